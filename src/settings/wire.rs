//! The delimited settings sync message.
//!
//! A settings snapshot travels between nodes as a single string of 25
//! backtick-separated fields in a fixed order. The format is positional:
//! field order and count are part of the protocol, and [`decode`]
//! refuses anything else. Lists are `|`-joined; the extra-limit list is
//! `|!`-joined because its entries are comma-separated tuples. Patterns
//! containing the delimiter characters are not representable.
//!
//! Decoding mutates an existing [`LimiterSettings`] in place, and only
//! after every field parsed cleanly; a malformed message leaves the
//! target untouched. The one tolerated irregularity is a malformed
//! extra-limit entry, which is logged and skipped.

use regex::Regex;
use tracing::warn;

use crate::acl::PeerMatch;
use crate::error::{PalisadeError, Result};

use super::limits::{ExtraLimit, HeaderPattern, LimiterSettings};

/// Number of fields in a settings message.
pub const FIELD_COUNT: usize = 25;

/// Version sentinel meaning "apply unconditionally regardless of skew".
/// Kept at the legacy 32-bit maximum for wire compatibility; receivers
/// reset it to version 0 after applying.
pub const FORCE_VERSION: u64 = i32::MAX as u64;

const FIELD_SEP: char = '`';
const LIST_SEP: char = '|';
const EXTRA_SEP: &str = "|!";

/// Serialize a settings snapshot. With `force`, the version field is
/// replaced by [`FORCE_VERSION`] for a full resync.
pub fn encode(settings: &LimiterSettings, force: bool) -> String {
    let version = if force {
        FORCE_VERSION
    } else {
        settings.version
    };
    let fields: [String; FIELD_COUNT] = [
        version.to_string(),
        join_list(&settings.allow_cidr),
        join_list(&settings.deny_cidr),
        settings.enable_skip_local_ip.to_string(),
        settings.max_forwarded_ips.to_string(),
        join_heads(&settings.allow_head),
        join_heads(&settings.deny_head),
        join_list(&settings.skip_ip_control_url),
        join_list(&settings.need_ip_control_url),
        settings.enable_ip_based_limiter.to_string(),
        settings.limit_capacity_for_ip.to_string(),
        settings.duration_of_limit_for_ip.to_string(),
        join_extras(&settings.extra_limits),
        settings.enable_user_based_limiter.to_string(),
        settings.limit_capacity_for_user.to_string(),
        settings.duration_of_limit_for_user.to_string(),
        join_list(&settings.skip_frequency_limiter_url),
        join_list(&settings.need_frequency_limiter_url),
        settings.enable_concurrent_request_limiter.to_string(),
        settings.max_concurrent_requests.to_string(),
        settings.request_limit_queue_size.to_string(),
        settings.max_concurrent_per_ip.to_string(),
        settings.enable_download_rate_limiter.to_string(),
        settings.limit_rate_bytes.to_string(),
        settings.limit_rate_period.to_string(),
    ];
    fields.join("`")
}

/// Parse a message and apply it onto `settings` in place.
///
/// A [`FORCE_VERSION`] sentinel is mapped back to version 0. Every field
/// is validated (including CIDR and header patterns) before anything is
/// assigned.
pub fn decode(message: &str, settings: &mut LimiterSettings) -> Result<()> {
    let fields: Vec<&str> = message.split(FIELD_SEP).collect();
    if fields.len() != FIELD_COUNT {
        return Err(PalisadeError::Config(format!(
            "settings message has {} fields, expected {}",
            fields.len(),
            FIELD_COUNT
        )));
    }

    let version = parse_number::<u64>(fields[0], "version")?;
    let allow_cidr = parse_cidr_list(fields[1])?;
    let deny_cidr = parse_cidr_list(fields[2])?;
    let enable_skip_local_ip = parse_bool(fields[3], "enableSkipLocalIp")?;
    let max_forwarded_ips = parse_number::<u32>(fields[4], "maxForwardedIPs")?;
    let allow_head = parse_heads(fields[5])?;
    let deny_head = parse_heads(fields[6])?;
    let skip_ip_control_url = split_list(fields[7]);
    let need_ip_control_url = split_list(fields[8]);
    let enable_ip_based_limiter = parse_bool(fields[9], "enableIpBasedLimiter")?;
    let limit_capacity_for_ip = parse_number::<u64>(fields[10], "limitCapacityForIp")?;
    let duration_of_limit_for_ip = parse_number::<u64>(fields[11], "durationOfLimitForIp")?;
    let extra_limits = parse_extras(fields[12]);
    let enable_user_based_limiter = parse_bool(fields[13], "enableUserBasedLimiter")?;
    let limit_capacity_for_user = parse_number::<u64>(fields[14], "limitCapacityForUser")?;
    let duration_of_limit_for_user =
        parse_number::<u64>(fields[15], "durationOfLimitForUser")?;
    let skip_frequency_limiter_url = split_list(fields[16]);
    let need_frequency_limiter_url = split_list(fields[17]);
    let enable_concurrent_request_limiter =
        parse_bool(fields[18], "enableConcurrentRequestLimiter")?;
    let max_concurrent_requests = parse_number::<usize>(fields[19], "maxConcurrentRequests")?;
    let request_limit_queue_size = parse_number::<usize>(fields[20], "requestLimitQueueSize")?;
    let max_concurrent_per_ip = parse_number::<usize>(fields[21], "maxConcurrentPerIp")?;
    let enable_download_rate_limiter =
        parse_bool(fields[22], "enableDownloadRateLimiter")?;
    let limit_rate_bytes = parse_number::<u64>(fields[23], "limitRateBytes")?;
    let limit_rate_period = parse_number::<u64>(fields[24], "limitRatePeriod")?;

    settings.version = if version == FORCE_VERSION { 0 } else { version };
    settings.allow_cidr = allow_cidr;
    settings.deny_cidr = deny_cidr;
    settings.enable_skip_local_ip = enable_skip_local_ip;
    settings.max_forwarded_ips = max_forwarded_ips;
    settings.allow_head = allow_head;
    settings.deny_head = deny_head;
    settings.skip_ip_control_url = skip_ip_control_url;
    settings.need_ip_control_url = need_ip_control_url;
    settings.enable_ip_based_limiter = enable_ip_based_limiter;
    settings.limit_capacity_for_ip = limit_capacity_for_ip;
    settings.duration_of_limit_for_ip = duration_of_limit_for_ip;
    settings.extra_limits = extra_limits;
    settings.enable_user_based_limiter = enable_user_based_limiter;
    settings.limit_capacity_for_user = limit_capacity_for_user;
    settings.duration_of_limit_for_user = duration_of_limit_for_user;
    settings.skip_frequency_limiter_url = skip_frequency_limiter_url;
    settings.need_frequency_limiter_url = need_frequency_limiter_url;
    settings.enable_concurrent_request_limiter = enable_concurrent_request_limiter;
    settings.max_concurrent_requests = max_concurrent_requests;
    settings.request_limit_queue_size = request_limit_queue_size;
    settings.max_concurrent_per_ip = max_concurrent_per_ip;
    settings.enable_download_rate_limiter = enable_download_rate_limiter;
    settings.limit_rate_bytes = limit_rate_bytes;
    settings.limit_rate_period = limit_rate_period;
    Ok(())
}

/// Read the version field without decoding the rest. Used by the mesh
/// watcher to rank peer messages cheaply.
pub fn peek_version(message: &str) -> Option<u64> {
    message.split(FIELD_SEP).next()?.parse().ok()
}

fn join_list(items: &[String]) -> String {
    items.join("|")
}

fn join_heads(heads: &[HeaderPattern]) -> String {
    heads
        .iter()
        .map(|h| format!("{},{}", h.name, h.pattern))
        .collect::<Vec<_>>()
        .join("|")
}

fn join_extras(extras: &[ExtraLimit]) -> String {
    extras
        .iter()
        .map(|e| {
            format!(
                "{},{},{},{},{}",
                e.name, e.header, e.pattern, e.capacity, e.window_secs
            )
        })
        .collect::<Vec<_>>()
        .join(EXTRA_SEP)
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(LIST_SEP)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(field: &str, name: &str) -> Result<bool> {
    match field {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(PalisadeError::Config(format!(
            "field {} is not a boolean: {:?}",
            name, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, name: &str) -> Result<T> {
    field.parse().map_err(|_| {
        PalisadeError::Config(format!("field {} is not a number: {:?}", name, field))
    })
}

fn parse_cidr_list(field: &str) -> Result<Vec<String>> {
    let patterns = split_list(field);
    for pattern in &patterns {
        PeerMatch::parse(pattern, false)?;
    }
    Ok(patterns)
}

fn parse_heads(field: &str) -> Result<Vec<HeaderPattern>> {
    split_list(field)
        .into_iter()
        .map(|entry| {
            let (name, pattern) = entry.split_once(',').ok_or_else(|| {
                PalisadeError::Config(format!("malformed header rule entry: {:?}", entry))
            })?;
            Regex::new(pattern).map_err(|e| {
                PalisadeError::Config(format!(
                    "malformed header pattern {:?}: {}",
                    pattern, e
                ))
            })?;
            Ok(HeaderPattern {
                name: name.to_string(),
                pattern: pattern.to_string(),
            })
        })
        .collect()
}

/// Extra-limit entries are `name,header,pattern,capacity,window_secs`.
/// The pattern may itself contain commas, so the tuple is split from
/// both ends. Malformed entries are skipped, not fatal.
fn parse_extras(field: &str) -> Vec<ExtraLimit> {
    if field.is_empty() {
        return Vec::new();
    }
    field
        .split(EXTRA_SEP)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match parse_extra_entry(entry) {
            Some(extra) => Some(extra),
            None => {
                warn!(entry, "skipping malformed extra limit entry");
                None
            }
        })
        .collect()
}

fn parse_extra_entry(entry: &str) -> Option<ExtraLimit> {
    let mut left = entry.splitn(3, ',');
    let name = left.next()?;
    let header = left.next()?;
    let rest = left.next()?;

    let mut right = rest.rsplitn(3, ',');
    let window_secs: u64 = right.next()?.parse().ok()?;
    let capacity: u64 = right.next()?.parse().ok()?;
    let pattern = right.next()?;

    if name.is_empty() || header.is_empty() || Regex::new(pattern).is_err() {
        return None;
    }

    Some(ExtraLimit {
        name: name.to_string(),
        header: header.to_string(),
        pattern: pattern.to_string(),
        capacity,
        window_secs,
    })
}
