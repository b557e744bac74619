//! Named rate-limit quotas.

use std::time::Duration;

use crate::error::{PalisadeError, Result};

/// A named quota: at most `capacity` calls per `window`.
///
/// Built via the fluent chain `RateLimit::of("login").to(5).per(window)`,
/// which validates both bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    name: String,
    capacity: u64,
    window: Duration,
}

impl RateLimit {
    /// Start building a quota with the given name.
    pub fn of(name: impl Into<String>) -> RateLimitBuilder {
        RateLimitBuilder {
            name: name.into(),
            capacity: 0,
        }
    }

    /// The quota name, unique within a limiter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum calls allowed within one window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The fixed time span over which calls are counted.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Intermediate state of the fluent quota builder.
#[derive(Debug, Clone)]
pub struct RateLimitBuilder {
    name: String,
    capacity: u64,
}

impl RateLimitBuilder {
    /// Set the call capacity.
    pub fn to(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the window and finish, validating both bounds.
    pub fn per(self, window: Duration) -> Result<RateLimit> {
        if self.name.is_empty() {
            return Err(PalisadeError::Config("rate limit name is empty".into()));
        }
        if self.capacity == 0 {
            return Err(PalisadeError::Config(format!(
                "rate limit {:?} has zero capacity",
                self.name
            )));
        }
        if window.is_zero() {
            return Err(PalisadeError::Config(format!(
                "rate limit {:?} has zero window",
                self.name
            )));
        }
        Ok(RateLimit {
            name: self.name,
            capacity: self.capacity,
            window,
        })
    }
}
