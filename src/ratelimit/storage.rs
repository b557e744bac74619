//! Usage ledgers: where windowed counters live.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;

/// Abstract counter ledger mapping `(resource, key)` to usage in the
/// current window.
///
/// Implementations must be atomic per `(resource, key)` pair and must
/// reset the count once the elapsed time since the window started
/// exceeds `window`. Entries are created lazily on first use and must
/// be evictable once stale.
#[async_trait]
pub trait UsageStorage: Send + Sync {
    /// Atomically record one use under `(resource, key)` and return the
    /// count accumulated in the current window.
    ///
    /// `limit` is advisory, for backends that size entries by it (for
    /// example a TTL); it does not gate the increment.
    async fn add_and_get(
        &self,
        resource: &str,
        key: &str,
        window: Duration,
        now_millis: u64,
        limit: u64,
    ) -> Result<u64>;
}

#[derive(Debug)]
struct Slot {
    count: u64,
    window_start: u64,
    window_millis: u64,
}

/// Default interval between stale-slot sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process ledger backed by a sharded map.
///
/// Slots whose window expired more than one full window ago are swept
/// out periodically so high-cardinality keys do not accumulate.
pub struct MemoryStorage {
    slots: DashMap<String, Slot>,
    sweep_interval_millis: u64,
    last_sweep: Mutex<u64>,
}

impl MemoryStorage {
    /// Create a storage with the default sweep interval.
    pub fn new() -> Self {
        Self::with_sweep_interval(SWEEP_INTERVAL)
    }

    /// Create a storage sweeping stale slots at the given interval.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            sweep_interval_millis: interval.as_millis() as u64,
            last_sweep: Mutex::new(0),
        }
    }

    /// Number of live slots, primarily useful for tests.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn maybe_sweep(&self, now: u64) {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_sub(*last) < self.sweep_interval_millis {
                return;
            }
            *last = now;
        }
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now.saturating_sub(slot.window_start) < slot.window_millis * 2);
        trace!(
            swept = before - self.slots.len(),
            remaining = self.slots.len(),
            "swept stale usage slots"
        );
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStorage for MemoryStorage {
    async fn add_and_get(
        &self,
        resource: &str,
        key: &str,
        window: Duration,
        now_millis: u64,
        _limit: u64,
    ) -> Result<u64> {
        let window_millis = (window.as_millis() as u64).max(1);
        let composite = format!("{}|{}", resource, key);
        let count = {
            // The entry guard holds the shard lock, making the
            // read-modify-write atomic per key.
            let mut slot = self.slots.entry(composite).or_insert_with(|| Slot {
                count: 0,
                window_start: now_millis,
                window_millis,
            });
            if now_millis.saturating_sub(slot.window_start) >= slot.window_millis {
                slot.count = 0;
                slot.window_start = now_millis;
            }
            slot.window_millis = window_millis;
            slot.count += 1;
            slot.count
        };
        self.maybe_sweep(now_millis);
        Ok(count)
    }
}
