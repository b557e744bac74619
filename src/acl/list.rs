//! Ordered allow/deny rule sets over peer addresses and headers.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, error};

use crate::error::{PalisadeError, Result};

use super::pattern::{AddressFamily, PeerMatch};

/// A header rule: the named header's value must full-match the pattern.
///
/// Absence of the header is not a match signal by itself; the rule is
/// simply skipped for requests that do not carry the header.
#[derive(Debug, Clone)]
pub struct HeaderRule {
    name: String,
    pattern: String,
    regex: Regex,
    deny: bool,
}

impl HeaderRule {
    /// Compile a rule for `name`. The pattern is anchored so that partial
    /// matches inside a header value do not count.
    pub fn new(name: &str, pattern: &str, deny: bool) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            PalisadeError::Config(format!("malformed header pattern {:?}: {}", pattern, e))
        })?;
        Ok(Self {
            name: name.to_ascii_lowercase(),
            pattern: pattern.to_string(),
            regex,
            deny,
        })
    }

    /// The lowercased header name this rule applies to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The original (unanchored) pattern string.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this is a deny rule.
    pub fn is_deny(&self) -> bool {
        self.deny
    }

    fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

#[derive(Debug, Default)]
struct Rules {
    v4_allow: Vec<PeerMatch>,
    v4_deny: Vec<PeerMatch>,
    v6_allow: Vec<PeerMatch>,
    v6_deny: Vec<PeerMatch>,
    head_allow: Vec<HeaderRule>,
    head_deny: Vec<HeaderRule>,
}

/// Ordered allow/deny rule sets for IPs and headers.
///
/// Evaluation is allow-rules-first within an address family. An empty
/// allow set means no restriction for that family, but once any allow
/// listing exists anywhere, addresses matching nothing fail closed.
///
/// One writer at a time, many concurrent readers; readers never observe
/// a partially applied mutation.
#[derive(Debug, Default)]
pub struct AccessControlList {
    rules: RwLock<Rules>,
}

impl AccessControlList {
    /// Create an empty list, which admits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allow rule for an IP pattern.
    pub fn add_allow_ip(&self, pattern: &str) -> Result<()> {
        let rule = PeerMatch::parse(pattern, false)?;
        let mut rules = self.rules.write();
        match rule.family() {
            AddressFamily::V4 => rules.v4_allow.push(rule),
            AddressFamily::V6 => rules.v6_allow.push(rule),
        }
        Ok(())
    }

    /// Add a deny rule for an IP pattern.
    pub fn add_deny_ip(&self, pattern: &str) -> Result<()> {
        let rule = PeerMatch::parse(pattern, true)?;
        let mut rules = self.rules.write();
        match rule.family() {
            AddressFamily::V4 => rules.v4_deny.push(rule),
            AddressFamily::V6 => rules.v6_deny.push(rule),
        }
        Ok(())
    }

    /// Remove allow rules with the given pattern. Returns whether any
    /// rule was removed.
    pub fn remove_allow_ip(&self, pattern: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.v4_allow.len() + rules.v6_allow.len();
        rules.v4_allow.retain(|r| r.pattern() != pattern);
        rules.v6_allow.retain(|r| r.pattern() != pattern);
        rules.v4_allow.len() + rules.v6_allow.len() != before
    }

    /// Remove deny rules with the given pattern.
    pub fn remove_deny_ip(&self, pattern: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.v4_deny.len() + rules.v6_deny.len();
        rules.v4_deny.retain(|r| r.pattern() != pattern);
        rules.v6_deny.retain(|r| r.pattern() != pattern);
        rules.v4_deny.len() + rules.v6_deny.len() != before
    }

    /// Drop every IP rule.
    pub fn clear_ip_rules(&self) {
        let mut rules = self.rules.write();
        rules.v4_allow.clear();
        rules.v4_deny.clear();
        rules.v6_allow.clear();
        rules.v6_deny.clear();
    }

    /// Add an allow rule for a header.
    pub fn add_allow_head(&self, name: &str, pattern: &str) -> Result<()> {
        let rule = HeaderRule::new(name, pattern, false)?;
        self.rules.write().head_allow.push(rule);
        Ok(())
    }

    /// Add a deny rule for a header.
    pub fn add_deny_head(&self, name: &str, pattern: &str) -> Result<()> {
        let rule = HeaderRule::new(name, pattern, true)?;
        self.rules.write().head_deny.push(rule);
        Ok(())
    }

    /// Remove all allow rules for a header name.
    pub fn remove_allow_head(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let mut rules = self.rules.write();
        let before = rules.head_allow.len();
        rules.head_allow.retain(|r| r.name() != name);
        rules.head_allow.len() != before
    }

    /// Remove all deny rules for a header name.
    pub fn remove_deny_head(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        let mut rules = self.rules.write();
        let before = rules.head_deny.len();
        rules.head_deny.retain(|r| r.name() != name);
        rules.head_deny.len() != before
    }

    /// Drop every header rule.
    pub fn clear_head_rules(&self) {
        let mut rules = self.rules.write();
        rules.head_allow.clear();
        rules.head_deny.clear();
    }

    /// Atomically replace every rule set from raw pattern strings.
    ///
    /// The new sets are compiled off to the side and swapped in under a
    /// single write, so concurrent readers see either the old rules or
    /// the new ones, never a half-built list. Header rules are given as
    /// `(name, pattern)` pairs. Patterns that fail to compile are
    /// dropped with an error log so one bad entry cannot blank the rest.
    pub fn reload(
        &self,
        allow_ip: &[String],
        deny_ip: &[String],
        allow_head: &[(String, String)],
        deny_head: &[(String, String)],
    ) {
        let mut next = Rules::default();
        for pattern in allow_ip {
            match PeerMatch::parse(pattern, false) {
                Ok(rule) => match rule.family() {
                    AddressFamily::V4 => next.v4_allow.push(rule),
                    AddressFamily::V6 => next.v6_allow.push(rule),
                },
                Err(e) => error!(error = %e, pattern = %pattern, "dropping unusable allow pattern"),
            }
        }
        for pattern in deny_ip {
            match PeerMatch::parse(pattern, true) {
                Ok(rule) => match rule.family() {
                    AddressFamily::V4 => next.v4_deny.push(rule),
                    AddressFamily::V6 => next.v6_deny.push(rule),
                },
                Err(e) => error!(error = %e, pattern = %pattern, "dropping unusable deny pattern"),
            }
        }
        for (name, pattern) in allow_head {
            match HeaderRule::new(name, pattern, false) {
                Ok(rule) => next.head_allow.push(rule),
                Err(e) => error!(error = %e, header = %name, "dropping unusable header rule"),
            }
        }
        for (name, pattern) in deny_head {
            match HeaderRule::new(name, pattern, true) {
                Ok(rule) => next.head_deny.push(rule),
                Err(e) => error!(error = %e, header = %name, "dropping unusable header rule"),
            }
        }
        *self.rules.write() = next;
    }

    /// Whether any rule of any kind is configured.
    pub fn have_rules(&self) -> bool {
        self.have_ip_rules() || self.have_head_rules()
    }

    /// Whether any IP rule is configured.
    pub fn have_ip_rules(&self) -> bool {
        let rules = self.rules.read();
        !rules.v4_allow.is_empty()
            || !rules.v4_deny.is_empty()
            || !rules.v6_allow.is_empty()
            || !rules.v6_deny.is_empty()
    }

    /// Whether any header rule is configured.
    pub fn have_head_rules(&self) -> bool {
        let rules = self.rules.read();
        !rules.head_allow.is_empty() || !rules.head_deny.is_empty()
    }

    /// Decide whether an address is admitted.
    ///
    /// Per address family: a matching allow rule admits immediately; a
    /// matching deny rule rejects; a configured-but-missed deny list
    /// admits; a configured-but-missed allow list (in either family)
    /// rejects; no rules at all admits.
    pub fn validate_ip(&self, addr: IpAddr) -> bool {
        let rules = self.rules.read();
        let (allow, deny) = match addr {
            IpAddr::V4(_) => (&rules.v4_allow, &rules.v4_deny),
            IpAddr::V6(_) => (&rules.v6_allow, &rules.v6_deny),
        };
        if allow.iter().any(|r| r.matches(addr)) {
            return true;
        }
        if let Some(rule) = deny.iter().find(|r| r.matches(addr)) {
            debug!(%addr, rule = %rule, "address rejected by deny rule");
            return false;
        }
        if !deny.is_empty() {
            return true;
        }
        if !rules.v4_allow.is_empty() || !rules.v6_allow.is_empty() {
            debug!(%addr, "address matched no allow rule, failing closed");
            return false;
        }
        true
    }

    /// Decide whether a header map is admitted, mirroring the IP
    /// fallthrough. Rules whose header is absent are skipped.
    pub fn validate_head(&self, headers: &HashMap<String, String>) -> bool {
        let rules = self.rules.read();
        for rule in &rules.head_allow {
            if let Some(value) = header_value(headers, rule.name()) {
                if rule.matches(value) {
                    return true;
                }
            }
        }
        for rule in &rules.head_deny {
            if let Some(value) = header_value(headers, rule.name()) {
                if rule.matches(value) {
                    debug!(header = rule.name(), "request rejected by header deny rule");
                    return false;
                }
            }
        }
        if !rules.head_deny.is_empty() {
            return true;
        }
        if !rules.head_allow.is_empty() {
            debug!("request matched no header allow rule, failing closed");
            return false;
        }
        true
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
