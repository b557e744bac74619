//! Quota evaluation against a usage ledger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{PalisadeError, Result};

use super::clock::Clock;
use super::quota::RateLimit;
use super::storage::UsageStorage;

/// Evaluates whether a call identified by a key is within quota.
///
/// A limiter binds a resource name, a clock, a storage and one or more
/// quotas. It is stateless itself; all usage lives in the storage, so
/// limiters are cheap to rebuild when configuration changes.
pub struct Limiter {
    resource: String,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn UsageStorage>,
    limits: Vec<RateLimit>,
}

impl Limiter {
    /// Create a limiter over the given quotas.
    ///
    /// Duplicate quota names would make accounting under the same key
    /// ambiguous, so they are rejected here rather than at first use.
    pub fn new(
        resource: impl Into<String>,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn UsageStorage>,
        limits: Vec<RateLimit>,
    ) -> Result<Self> {
        let resource = resource.into();
        if limits.is_empty() {
            return Err(PalisadeError::Config(format!(
                "limiter {:?} has no rate limits",
                resource
            )));
        }
        let mut names = HashSet::new();
        for limit in &limits {
            if !names.insert(limit.name()) {
                return Err(PalisadeError::Config(format!(
                    "limiter {:?} has duplicate rate limit name {:?}",
                    resource,
                    limit.name()
                )));
            }
        }
        Ok(Self {
            resource,
            clock,
            storage,
            limits,
        })
    }

    /// Record one call under `key` and report whether every bound quota
    /// still holds. All quotas are incremented; all must pass.
    pub async fn try_call(&self, key: &str) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut within = true;
        for limit in &self.limits {
            let count = self
                .storage
                .add_and_get(
                    &self.resource,
                    &format!("{}:{}", limit.name(), key),
                    limit.window(),
                    now,
                    limit.capacity(),
                )
                .await?;
            trace!(
                resource = %self.resource,
                limit = limit.name(),
                key,
                count,
                capacity = limit.capacity(),
                "checked rate limit"
            );
            if count > limit.capacity() {
                debug!(
                    resource = %self.resource,
                    limit = limit.name(),
                    key,
                    count,
                    capacity = limit.capacity(),
                    "rate limit exceeded"
                );
                within = false;
            }
        }
        Ok(within)
    }

    /// The resource name calls are accounted under.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The bound quotas.
    pub fn limits(&self) -> &[RateLimit] {
        &self.limits
    }

    /// The longest window among bound quotas, used for `Retry-After`.
    pub fn max_window(&self) -> Duration {
        self.limits
            .iter()
            .map(RateLimit::window)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, MemoryStorage};

    fn limiter_with(
        clock: Arc<ManualClock>,
        limits: Vec<RateLimit>,
    ) -> Limiter {
        Limiter::new("test", clock, Arc::new(MemoryStorage::new()), limits).unwrap()
    }

    #[tokio::test]
    async fn test_capacity_enforced_within_window() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limit = RateLimit::of("calls")
            .to(3)
            .per(Duration::from_secs(2))
            .unwrap();
        let limiter = limiter_with(Arc::clone(&clock), vec![limit]);

        for _ in 0..3 {
            assert!(limiter.try_call("10.0.0.1").await.unwrap());
        }
        assert!(!limiter.try_call("10.0.0.1").await.unwrap());

        // After the window elapses the quota is restored.
        clock.advance(2_000);
        assert!(limiter.try_call("10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_tracked_independently() {
        let clock = Arc::new(ManualClock::new(0));
        let limit = RateLimit::of("calls")
            .to(1)
            .per(Duration::from_secs(60))
            .unwrap();
        let limiter = limiter_with(clock, vec![limit]);

        assert!(limiter.try_call("a").await.unwrap());
        assert!(!limiter.try_call("a").await.unwrap());
        assert!(limiter.try_call("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_all_limits_must_pass() {
        let clock = Arc::new(ManualClock::new(0));
        let burst = RateLimit::of("burst")
            .to(2)
            .per(Duration::from_secs(1))
            .unwrap();
        let sustained = RateLimit::of("sustained")
            .to(10)
            .per(Duration::from_secs(60))
            .unwrap();
        let limiter = limiter_with(clock, vec![burst, sustained]);

        assert!(limiter.try_call("k").await.unwrap());
        assert!(limiter.try_call("k").await.unwrap());
        // Burst quota exhausted even though the sustained quota has room.
        assert!(!limiter.try_call("k").await.unwrap());
    }

    #[test]
    fn test_duplicate_limit_names_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let storage: Arc<dyn UsageStorage> = Arc::new(MemoryStorage::new());
        let a = RateLimit::of("same")
            .to(1)
            .per(Duration::from_secs(1))
            .unwrap();
        let b = RateLimit::of("same")
            .to(2)
            .per(Duration::from_secs(2))
            .unwrap();
        assert!(Limiter::new("dup", clock, storage, vec![a, b]).is_err());
    }

    #[test]
    fn test_empty_limits_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let storage: Arc<dyn UsageStorage> = Arc::new(MemoryStorage::new());
        assert!(Limiter::new("empty", clock, storage, Vec::new()).is_err());
    }

    #[test]
    fn test_max_window() {
        let clock = Arc::new(ManualClock::new(0));
        let a = RateLimit::of("a").to(1).per(Duration::from_secs(2)).unwrap();
        let b = RateLimit::of("b").to(1).per(Duration::from_secs(60)).unwrap();
        let limiter = limiter_with(clock, vec![a, b]);
        assert_eq!(limiter.max_window(), Duration::from_secs(60));
    }
}
