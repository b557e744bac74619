//! Peer address pattern parsing and matching.
//!
//! A pattern string is classified into one of six shapes, checked in a
//! fixed order (exact before wildcard before slash prefix, IPv4 before
//! IPv6); the first shape that matches wins. Matching an address is then
//! a byte compare under a mask: exact patterns use a full mask, wildcard
//! patterns zero the mask at `*` positions, and prefix patterns mask the
//! leading `n` bits. IPv6 wildcard patterns require the full 8-group
//! form; `::` compression cannot carry a `*`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{PalisadeError, Result};

/// Address family a pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// How a pattern constrains an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Byte-for-byte equality with a single address.
    Exact,
    /// Octets/groups replaced by `*` match anything.
    Wildcard,
    /// The leading `n` bits must match.
    PrefixMask,
}

fn v4_exact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}$").unwrap())
}

fn v4_wildcard_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3}|\*)(\.(\d{1,3}|\*)){3}$").unwrap())
}

fn v4_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}(\.\d{1,3}){3}/\d{1,2}$").unwrap())
}

fn v6_exact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{1,4}(:[0-9A-Fa-f]{1,4}){7}$").unwrap())
}

fn v6_wildcard_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{1,4}|\*)(:([0-9A-Fa-f]{1,4}|\*)){7}$").unwrap())
}

fn v6_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{1,4}(:[0-9A-Fa-f]{1,4}){7}/\d{1,3}$").unwrap())
}

/// A single compiled IP rule.
///
/// Immutable once constructed; building one from a malformed pattern is a
/// configuration error raised at rule-add time, never at match time.
#[derive(Debug, Clone)]
pub struct PeerMatch {
    pattern: String,
    deny: bool,
    kind: MatchKind,
    family: AddressFamily,
    addr: [u8; 16],
    mask: [u8; 16],
    len: usize,
}

impl PeerMatch {
    /// Parse and classify a pattern string into a compiled rule.
    pub fn parse(pattern: &str, deny: bool) -> Result<Self> {
        if v4_exact_re().is_match(pattern) {
            let addr: Ipv4Addr = pattern
                .parse()
                .map_err(|_| malformed(pattern))?;
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::Exact,
                AddressFamily::V4,
                &addr.octets(),
                &[0xFF; 4],
            ));
        }
        if pattern.contains('*') && v4_wildcard_re().is_match(pattern) {
            let mut addr = [0u8; 4];
            let mut mask = [0u8; 4];
            for (i, part) in pattern.split('.').enumerate() {
                if part != "*" {
                    addr[i] = part.parse().map_err(|_| malformed(pattern))?;
                    mask[i] = 0xFF;
                }
            }
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::Wildcard,
                AddressFamily::V4,
                &addr,
                &mask,
            ));
        }
        if v4_prefix_re().is_match(pattern) {
            let (addr_part, bits) = split_prefix(pattern, 32)?;
            let addr: Ipv4Addr = addr_part.parse().map_err(|_| malformed(pattern))?;
            let mut mask = [0u8; 4];
            fill_prefix_mask(&mut mask, bits);
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::PrefixMask,
                AddressFamily::V4,
                &addr.octets(),
                &mask,
            ));
        }
        if v6_exact_re().is_match(pattern) {
            let addr: Ipv6Addr = pattern.parse().map_err(|_| malformed(pattern))?;
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::Exact,
                AddressFamily::V6,
                &addr.octets(),
                &[0xFF; 16],
            ));
        }
        if pattern.contains('*') && v6_wildcard_re().is_match(pattern) {
            let mut addr = [0u8; 16];
            let mut mask = [0u8; 16];
            for (i, part) in pattern.split(':').enumerate() {
                if part != "*" {
                    let group =
                        u16::from_str_radix(part, 16).map_err(|_| malformed(pattern))?;
                    addr[i * 2] = (group >> 8) as u8;
                    addr[i * 2 + 1] = group as u8;
                    mask[i * 2] = 0xFF;
                    mask[i * 2 + 1] = 0xFF;
                }
            }
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::Wildcard,
                AddressFamily::V6,
                &addr,
                &mask,
            ));
        }
        if v6_prefix_re().is_match(pattern) {
            let (addr_part, bits) = split_prefix(pattern, 128)?;
            let addr: Ipv6Addr = addr_part.parse().map_err(|_| malformed(pattern))?;
            let mut mask = [0u8; 16];
            fill_prefix_mask(&mut mask, bits);
            return Ok(Self::from_parts(
                pattern,
                deny,
                MatchKind::PrefixMask,
                AddressFamily::V6,
                &addr.octets(),
                &mask,
            ));
        }
        Err(malformed(pattern))
    }

    fn from_parts(
        pattern: &str,
        deny: bool,
        kind: MatchKind,
        family: AddressFamily,
        addr: &[u8],
        mask: &[u8],
    ) -> Self {
        let mut addr_buf = [0u8; 16];
        let mut mask_buf = [0u8; 16];
        addr_buf[..addr.len()].copy_from_slice(addr);
        mask_buf[..mask.len()].copy_from_slice(mask);
        Self {
            pattern: pattern.to_string(),
            deny,
            kind,
            family,
            addr: addr_buf,
            mask: mask_buf,
            len: addr.len(),
        }
    }

    /// Whether `ip` falls inside the range this rule describes.
    ///
    /// Addresses of the other family never match.
    pub fn matches(&self, ip: IpAddr) -> bool {
        let mut bytes = [0u8; 16];
        match (self.family, ip) {
            (AddressFamily::V4, IpAddr::V4(a)) => bytes[..4].copy_from_slice(&a.octets()),
            (AddressFamily::V6, IpAddr::V6(a)) => bytes.copy_from_slice(&a.octets()),
            _ => return false,
        }
        (0..self.len).all(|i| bytes[i] & self.mask[i] == self.addr[i] & self.mask[i])
    }

    /// The original pattern string.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this is a deny rule.
    pub fn is_deny(&self) -> bool {
        self.deny
    }

    /// The classified pattern shape.
    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    /// The address family this rule applies to.
    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

impl fmt::Display for PeerMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            if self.deny { "deny" } else { "allow" },
            self.pattern
        )
    }
}

fn malformed(pattern: &str) -> PalisadeError {
    PalisadeError::Config(format!("malformed IP pattern: {}", pattern))
}

fn split_prefix(pattern: &str, max_bits: u32) -> Result<(&str, u32)> {
    let (addr, bits) = pattern
        .split_once('/')
        .ok_or_else(|| malformed(pattern))?;
    let bits: u32 = bits.parse().map_err(|_| malformed(pattern))?;
    if bits > max_bits {
        return Err(malformed(pattern));
    }
    Ok((addr, bits))
}

fn fill_prefix_mask(mask: &mut [u8], bits: u32) {
    let mut remaining = bits;
    for byte in mask.iter_mut() {
        let take = remaining.min(8);
        *byte = if take == 0 { 0 } else { 0xFFu8 << (8 - take) };
        remaining -= take;
    }
}
