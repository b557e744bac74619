//! Request admission: concurrency caps and the gateway pipeline.

mod concurrency;
mod gateway;

pub use concurrency::{InFlightPermit, QueueFull, RequestLimiter};
pub use gateway::{AdmissionGateway, Forwarder, GatewayOptions, Request, Response};
