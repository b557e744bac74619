//! The settings store: ownership, versioning and change broadcast.
//!
//! The store is the single writer for [`LimiterSettings`]. Mutators
//! produce a fresh snapshot (read-copy-update), bump the version, and
//! schedule a debounced broadcast: bursts of changes inside the debounce
//! window collapse into one message reflecting the final state. Applying
//! a peer's message updates the snapshot without bumping the version and
//! without re-broadcasting, so a multi-node fan-out cannot echo forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::acl::PeerMatch;
use crate::error::Result;

use super::limits::{ExtraLimit, HeaderPattern, LimiterSettings};
use super::wire;

/// How long to wait for a burst of changes to settle before
/// broadcasting.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Receives the serialized settings message after each debounced change.
pub trait SettingsListener: Send + Sync {
    /// Called with the encoded message reflecting the post-change state.
    fn settings_changed(&self, message: &str);
}

/// Owns the live [`LimiterSettings`] snapshot.
///
/// Readers take a cheap atomic snapshot and may observe a config that is
/// a few requests stale; writers are serialized through the store.
pub struct SettingsStore {
    current: RwLock<Arc<LimiterSettings>>,
    /// Bumped on every change, local or remote; lets readers detect that
    /// derived state (compiled rules, limiters) needs a rebuild even
    /// when the protocol version went backwards after a force resync.
    generation: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn SettingsListener>>>,
    broadcast_pending: Mutex<bool>,
}

impl SettingsStore {
    /// Create a store around an initial settings snapshot.
    pub fn new(initial: LimiterSettings) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            generation: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            broadcast_pending: Mutex::new(false),
        }
    }

    /// Register a listener for debounced change broadcasts.
    pub fn add_listener(&self, listener: Arc<dyn SettingsListener>) {
        self.listeners.write().push(listener);
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<LimiterSettings> {
        Arc::clone(&self.current.read())
    }

    /// The current protocol version.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// The change generation (local and remote changes both count).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Serialize the current snapshot; see [`wire::encode`].
    pub fn to_message(&self, force: bool) -> String {
        wire::encode(&self.current.read(), force)
    }

    /// Mutate the settings through `mutate`, bumping the version and
    /// scheduling a debounced broadcast.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update(self: &Arc<Self>, mutate: impl FnOnce(&mut LimiterSettings)) {
        {
            let mut current = self.current.write();
            let mut next = (**current).clone();
            mutate(&mut next);
            next.version = current.version + 1;
            *current = Arc::new(next);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.schedule_broadcast();
    }

    /// Apply a peer's serialized message onto the current settings.
    ///
    /// The snapshot is mutated in place (positionally, field for field)
    /// and marked externally sourced: no version bump, no re-broadcast.
    pub fn apply_message(&self, message: &str) -> Result<()> {
        {
            let mut current = self.current.write();
            let mut next = (**current).clone();
            wire::decode(message, &mut next)?;
            *current = Arc::new(next);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(version = self.version(), "applied externally sourced settings");
        Ok(())
    }

    /// Add an ACL allow pattern, validating it first.
    pub fn add_allow_cidr(self: &Arc<Self>, pattern: &str) -> Result<()> {
        PeerMatch::parse(pattern, false)?;
        let pattern = pattern.to_string();
        self.update(|s| {
            if !s.allow_cidr.contains(&pattern) {
                s.allow_cidr.push(pattern);
            }
        });
        Ok(())
    }

    /// Add an ACL deny pattern, validating it first.
    pub fn add_deny_cidr(self: &Arc<Self>, pattern: &str) -> Result<()> {
        PeerMatch::parse(pattern, true)?;
        let pattern = pattern.to_string();
        self.update(|s| {
            if !s.deny_cidr.contains(&pattern) {
                s.deny_cidr.push(pattern);
            }
        });
        Ok(())
    }

    /// Remove an ACL allow pattern.
    pub fn remove_allow_cidr(self: &Arc<Self>, pattern: &str) {
        let pattern = pattern.to_string();
        self.update(|s| s.allow_cidr.retain(|p| *p != pattern));
    }

    /// Remove an ACL deny pattern.
    pub fn remove_deny_cidr(self: &Arc<Self>, pattern: &str) {
        let pattern = pattern.to_string();
        self.update(|s| s.deny_cidr.retain(|p| *p != pattern));
    }

    /// Add a header allow rule, validating the pattern first.
    pub fn add_allow_head(self: &Arc<Self>, name: &str, pattern: &str) -> Result<()> {
        let rule = HeaderPattern {
            name: name.to_string(),
            pattern: pattern.to_string(),
        };
        crate::acl::HeaderRule::new(name, pattern, false)?;
        self.update(|s| {
            if !s.allow_head.contains(&rule) {
                s.allow_head.push(rule);
            }
        });
        Ok(())
    }

    /// Add a header deny rule, validating the pattern first.
    pub fn add_deny_head(self: &Arc<Self>, name: &str, pattern: &str) -> Result<()> {
        let rule = HeaderPattern {
            name: name.to_string(),
            pattern: pattern.to_string(),
        };
        crate::acl::HeaderRule::new(name, pattern, true)?;
        self.update(|s| {
            if !s.deny_head.contains(&rule) {
                s.deny_head.push(rule);
            }
        });
        Ok(())
    }

    /// Add an extra header-keyed limit, validating its pattern first.
    pub fn add_extra_limit(self: &Arc<Self>, extra: ExtraLimit) -> Result<()> {
        crate::acl::HeaderRule::new(&extra.header, &extra.pattern, false)?;
        self.update(|s| {
            s.extra_limits.retain(|e| e.name != extra.name);
            s.extra_limits.push(extra);
        });
        Ok(())
    }

    fn schedule_broadcast(self: &Arc<Self>) {
        {
            let mut pending = self.broadcast_pending.lock();
            if *pending {
                return;
            }
            *pending = true;
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            *store.broadcast_pending.lock() = false;
            let message = store.to_message(false);
            let listeners: Vec<_> = store.listeners.read().clone();
            debug!(
                version = store.version(),
                listeners = listeners.len(),
                "broadcasting settings change"
            );
            for listener in listeners {
                listener.settings_changed(&message);
            }
        });
    }
}
