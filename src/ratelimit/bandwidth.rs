//! Outbound byte-rate throttling.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Token bucket over response bytes with a fixed refill slice.
///
/// A budget of `bytes_per_slice` becomes available at each slice
/// boundary; once it is spent, callers wait for the next boundary. The
/// steady-state throughput bound is `bytes_per_slice / slice` and a
/// burst within one slice never exceeds `bytes_per_slice`.
///
/// One throttle instance accounts for one response writer.
#[derive(Debug)]
pub struct DownloadThrottle {
    bytes_per_slice: u64,
    slice: Duration,
    state: Mutex<SliceState>,
}

#[derive(Debug)]
struct SliceState {
    slice_start: Instant,
    used: u64,
}

impl DownloadThrottle {
    /// Create a throttle allowing `bytes_per_slice` bytes per `slice`.
    /// A zero byte budget disables throttling entirely.
    pub fn new(bytes_per_slice: u64, slice: Duration) -> Self {
        Self {
            bytes_per_slice,
            slice: slice.max(Duration::from_millis(1)),
            state: Mutex::new(SliceState {
                slice_start: Instant::now(),
                used: 0,
            }),
        }
    }

    /// The configured per-slice byte budget.
    pub fn bytes_per_slice(&self) -> u64 {
        self.bytes_per_slice
    }

    /// Consume budget for `len` outbound bytes, sleeping across slice
    /// boundaries once the current slice is exhausted.
    pub async fn consume(&self, mut len: u64) {
        if self.bytes_per_slice == 0 {
            return;
        }
        loop {
            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now.duration_since(state.slice_start) >= self.slice {
                    state.slice_start = now;
                    state.used = 0;
                }
                let available = self.bytes_per_slice.saturating_sub(state.used);
                if available >= len {
                    state.used += len;
                    return;
                }
                // Spend what is left in this slice and wait out the rest.
                state.used = self.bytes_per_slice;
                len -= available;
                state.slice_start + self.slice
            };
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Write `buf` through the throttle, chunked so no single write can
    /// overshoot a slice budget.
    pub async fn write_all<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        buf: &[u8],
    ) -> std::io::Result<()> {
        let chunk = if self.bytes_per_slice == 0 {
            buf.len().max(1)
        } else {
            self.bytes_per_slice as usize
        };
        for part in buf.chunks(chunk) {
            self.consume(part.len() as u64).await;
            writer.write_all(part).await?;
        }
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_slice_is_free() {
        let throttle = DownloadThrottle::new(1_000, Duration::from_secs(1));
        let start = Instant::now();
        throttle.consume(400).await;
        throttle.consume(600).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_slice_waits_for_boundary() {
        let throttle = DownloadThrottle::new(1_000, Duration::from_secs(1));
        let start = Instant::now();
        throttle.consume(1_000).await;
        throttle.consume(1).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_write_spreads_over_slices() {
        let throttle = DownloadThrottle::new(100, Duration::from_secs(1));
        let start = Instant::now();
        // 250 bytes at 100 bytes/s crosses two slice boundaries.
        throttle.consume(250).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_all_delivers_everything() {
        let throttle = DownloadThrottle::new(100, Duration::from_secs(1));
        let mut sink = Vec::new();
        let body = vec![7u8; 250];
        let start = Instant::now();
        throttle.write_all(&mut sink, &body).await.unwrap();
        assert_eq!(sink, body);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_disables_throttling() {
        let throttle = DownloadThrottle::new(0, Duration::from_secs(1));
        let start = Instant::now();
        throttle.consume(u64::MAX).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
