//! The root limiter configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A header name/pattern pair used by ACL header rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPattern {
    /// The header name (matched case-insensitively).
    pub name: String,
    /// Full-match regular expression over the header value.
    pub pattern: String,
}

/// A named quota applied to requests whose header value matches a
/// pattern, evaluated only after the base per-IP limiter passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraLimit {
    /// Quota name, unique among extra limits.
    pub name: String,
    /// The header whose value selects and keys the quota.
    pub header: String,
    /// Full-match regular expression over the header value.
    pub pattern: String,
    /// Calls allowed per window.
    pub capacity: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

/// Every tunable of the admission subsystem, plus a monotonically
/// increasing version counter.
///
/// The version increments on every local mutation (never on replay of a
/// peer's message) so nodes can detect staleness. Mutate through
/// [`crate::settings::SettingsStore`], which owns versioning and the
/// debounced change broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Mutation counter; 0 for a freshly constructed config.
    pub version: u64,

    /// ACL allow patterns (exact, wildcard, or slash-prefix).
    pub allow_cidr: Vec<String>,
    /// ACL deny patterns.
    pub deny_cidr: Vec<String>,
    /// Bypass ACL and frequency/download limiting for local addresses.
    pub enable_skip_local_ip: bool,
    /// Trusted `X-Forwarded-For` depth; 0 disables forwarded-header
    /// resolution and uses the direct peer address.
    pub max_forwarded_ips: u32,
    /// ACL header allow rules.
    pub allow_head: Vec<HeaderPattern>,
    /// ACL header deny rules.
    pub deny_head: Vec<HeaderPattern>,
    /// Path prefixes exempt from IP/header control.
    pub skip_ip_control_url: Vec<String>,
    /// Path prefixes IP/header control is restricted to, when non-empty.
    pub need_ip_control_url: Vec<String>,

    /// Per-IP frequency limiting toggle.
    pub enable_ip_based_limiter: bool,
    /// Calls allowed per IP per window.
    pub limit_capacity_for_ip: u64,
    /// Per-IP window length in seconds.
    pub duration_of_limit_for_ip: u64,
    /// Header-keyed quotas layered on top of the per-IP limiter.
    pub extra_limits: Vec<ExtraLimit>,

    /// Per-principal frequency limiting toggle.
    pub enable_user_based_limiter: bool,
    /// Calls allowed per principal per window.
    pub limit_capacity_for_user: u64,
    /// Per-principal window length in seconds.
    pub duration_of_limit_for_user: u64,
    /// Path prefixes exempt from frequency limiting.
    pub skip_frequency_limiter_url: Vec<String>,
    /// Path prefixes frequency limiting is restricted to, when non-empty.
    pub need_frequency_limiter_url: Vec<String>,

    /// Concurrency admission toggle.
    pub enable_concurrent_request_limiter: bool,
    /// Total in-flight request cap.
    pub max_concurrent_requests: usize,
    /// Bounded FIFO queue size for requests over the caps.
    pub request_limit_queue_size: usize,
    /// Per-source-IP in-flight cap.
    pub max_concurrent_per_ip: usize,

    /// Download byte-rate limiting toggle.
    pub enable_download_rate_limiter: bool,
    /// Bytes allowed per rate period.
    pub limit_rate_bytes: u64,
    /// Rate period length in seconds.
    pub limit_rate_period: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            version: 0,
            allow_cidr: Vec::new(),
            deny_cidr: Vec::new(),
            enable_skip_local_ip: false,
            max_forwarded_ips: 0,
            allow_head: Vec::new(),
            deny_head: Vec::new(),
            skip_ip_control_url: Vec::new(),
            need_ip_control_url: Vec::new(),
            enable_ip_based_limiter: false,
            limit_capacity_for_ip: 600,
            duration_of_limit_for_ip: 60,
            extra_limits: Vec::new(),
            enable_user_based_limiter: false,
            limit_capacity_for_user: 600,
            duration_of_limit_for_user: 60,
            skip_frequency_limiter_url: Vec::new(),
            need_frequency_limiter_url: Vec::new(),
            enable_concurrent_request_limiter: false,
            max_concurrent_requests: 256,
            request_limit_queue_size: 64,
            max_concurrent_per_ip: 16,
            enable_download_rate_limiter: false,
            limit_rate_bytes: 1024 * 1024,
            limit_rate_period: 1,
        }
    }
}

impl LimiterSettings {
    /// The per-IP limiter window as a duration.
    pub fn ip_limit_window(&self) -> Duration {
        Duration::from_secs(self.duration_of_limit_for_ip)
    }

    /// The per-principal limiter window as a duration.
    pub fn user_limit_window(&self) -> Duration {
        Duration::from_secs(self.duration_of_limit_for_user)
    }

    /// The download throttle slice as a duration.
    pub fn rate_period(&self) -> Duration {
        Duration::from_secs(self.limit_rate_period.max(1))
    }
}
