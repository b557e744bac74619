//! IP and header access control.
//!
//! An [`AccessControlList`] holds ordered allow/deny rule sets over peer
//! addresses and request headers. IP rules are compiled [`PeerMatch`]
//! patterns (exact, wildcard, or slash-prefix, IPv4 and IPv6); header
//! rules are full-match regular expressions keyed by header name.

mod list;
mod pattern;

pub use list::{AccessControlList, HeaderRule};
pub use pattern::{AddressFamily, MatchKind, PeerMatch};
