//! Rate limiting: quotas, usage ledgers and throttles.

mod bandwidth;
mod clock;
mod distributed;
mod limiter;
mod quota;
mod storage;

pub use bandwidth::DownloadThrottle;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::ClusterStorage;
pub use limiter::Limiter;
pub use quota::{RateLimit, RateLimitBuilder};
pub use storage::{MemoryStorage, UsageStorage};
