//! Live-reloadable limiter settings and their sync protocol.

mod limits;
mod store;
pub mod wire;

pub use limits::{ExtraLimit, HeaderPattern, LimiterSettings};
pub use store::{SettingsListener, SettingsStore};
