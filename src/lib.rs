//! Palisade - Request Admission Control
//!
//! This crate implements the admission subsystem that gates inbound HTTP
//! requests before they reach application logic: IP and header access
//! control, windowed rate limiting with pluggable usage storage, outbound
//! byte-rate throttling, bounded-concurrency admission with per-client
//! fairness, and a cluster-synchronized, live-reloadable limiter
//! configuration. State synchronization across nodes uses a peer-to-peer
//! gossip mesh rather than centralized storage.

pub mod acl;
pub mod admission;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod settings;
