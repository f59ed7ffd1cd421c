// src/services/unlocks.rs
//! Time-boxed user overrides.
//!
//! Not persisted. Expiry is checked at read time and a stale entry is removed
//! by the read that finds it; `sweep_expired` exists only to bound memory for
//! domains that are never revisited.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemporaryUnlock {
    pub domain: String,
    pub granted_at: DateTime<Utc>,
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
}

impl TemporaryUnlock {
    /// Valid while `now - granted_at <= ttl`. A clock that moved backwards
    /// keeps the unlock valid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.granted_at).to_std() {
            Ok(elapsed) => elapsed <= self.ttl,
            Err(_) => true,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.granted_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

mod ttl_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(ttl.as_secs())
    }
}

pub struct TemporaryUnlockRegistry {
    entries: Mutex<HashMap<String, TemporaryUnlock>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl TemporaryUnlockRegistry {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    pub fn new(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Grant with the registry's default TTL.
    pub fn grant_default(&self, domain: &str) -> TemporaryUnlock {
        self.grant(domain, self.default_ttl)
    }

    /// Grant or re-grant. Replaces any previous unlock for the domain; TTLs never stack.
    pub fn grant(&self, domain: &str, ttl: Duration) -> TemporaryUnlock {
        let unlock = TemporaryUnlock {
            domain: domain.to_string(),
            granted_at: self.clock.now(),
            ttl,
        };
        self.entries.lock().insert(domain.to_string(), unlock.clone());
        unlock
    }

    /// True iff an unexpired unlock exists. Removes the entry when it has expired.
    pub fn is_unlocked(&self, domain: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(domain) {
            Some(unlock) if unlock.is_valid_at(now) => true,
            Some(_) => {
                entries.remove(domain);
                tracing::debug!(%domain, "temporary unlock expired");
                false
            }
            None => false,
        }
    }

    /// Current entry without evicting it, expired or not.
    pub fn peek(&self, domain: &str) -> Option<TemporaryUnlock> {
        self.entries.lock().get(domain).cloned()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, u| u.is_valid_at(now));
        before - entries.len()
    }

    /// Entries currently held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn registry() -> (TemporaryUnlockRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let reg = TemporaryUnlockRegistry::new(clock.clone(), TemporaryUnlockRegistry::DEFAULT_TTL);
        (reg, clock)
    }

    #[test]
    fn unlock_is_valid_through_its_ttl_and_expires_just_after() {
        let (reg, clock) = registry();
        reg.grant_default("blocked.test");
        assert!(reg.is_unlocked("blocked.test"));

        clock.advance(ChronoDuration::minutes(5));
        assert!(reg.is_unlocked("blocked.test"));

        clock.advance(ChronoDuration::milliseconds(1));
        assert!(!reg.is_unlocked("blocked.test"));
        assert!(reg.is_empty(), "expired entry is evicted by the read");
    }

    #[test]
    fn regrant_replaces_instead_of_stacking() {
        let (reg, clock) = registry();
        let first = reg.grant_default("a.test");
        clock.advance(ChronoDuration::seconds(1));
        let second = reg.grant_default("a.test");

        assert_eq!(reg.len(), 1);
        let held = reg.peek("a.test").unwrap();
        assert_eq!(held.granted_at, second.granted_at);
        assert!(held.granted_at > first.granted_at);
        assert_eq!(held.ttl, TemporaryUnlockRegistry::DEFAULT_TTL);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let (reg, clock) = registry();
        reg.grant("short.test", Duration::from_secs(10));
        reg.grant_default("long.test");
        clock.advance(ChronoDuration::seconds(11));

        assert_eq!(reg.sweep_expired(), 1);
        assert!(reg.peek("short.test").is_none());
        assert!(reg.is_unlocked("long.test"));
    }

    #[test]
    fn unknown_domain_is_locked() {
        let (reg, _) = registry();
        assert!(!reg.is_unlocked("never.test"));
    }
}
