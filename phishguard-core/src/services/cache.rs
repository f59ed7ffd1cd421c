// src/services/cache.rs
//! In-memory verdict map, the session's source of truth.
//!
//! Readers take a short read lock and never wait on storage. Writers are
//! serialized by `write_gate`, mutate the map, release it, then flush a snapshot
//! to the store, so the durable record is always written in mutation order.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{Verdict, VerdictStatus};
use crate::error::{EngineError, EngineResult};
use crate::services::store::VerdictStore;

/// What a cache mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    /// False when an existing verdict carried a newer timestamp.
    pub applied: bool,
    /// False when the durable flush failed; the in-memory value still governs.
    pub durable: bool,
    pub warning: Option<String>,
}

impl CacheWrite {
    fn skipped() -> Self {
        Self {
            applied: false,
            durable: true,
            warning: None,
        }
    }
}

pub struct PolicyCache {
    verdicts: RwLock<HashMap<String, Verdict>>,
    write_gate: Mutex<()>,
    store: Arc<dyn VerdictStore>,
}

impl PolicyCache {
    /// Populate from the store. An unreadable record is set aside and the
    /// cache starts empty; a store that cannot be read at all is an error.
    pub fn load(store: Arc<dyn VerdictStore>) -> EngineResult<Self> {
        let loaded = match store.load() {
            Ok(loaded) => loaded,
            Err(EngineError::CorruptRecord(reason)) => {
                let backup = store.quarantine().unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "could not copy the unreadable verdict record");
                    None
                });
                tracing::warn!(%reason, ?backup, "verdict record unreadable; starting with an empty cache");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let mut verdicts = HashMap::with_capacity(loaded.len());
        for v in loaded {
            verdicts.insert(v.domain.clone(), v);
        }
        tracing::info!(entries = verdicts.len(), "policy cache loaded");
        Ok(Self {
            verdicts: RwLock::new(verdicts),
            write_gate: Mutex::new(()),
            store,
        })
    }

    pub fn lookup(&self, domain: &str) -> Option<Verdict> {
        self.verdicts.read().get(domain).cloned()
    }

    /// Hot-path variant of [`lookup`](Self::lookup) that copies only the status.
    pub fn status(&self, domain: &str) -> Option<VerdictStatus> {
        self.verdicts.read().get(domain).map(|v| v.status)
    }

    pub fn len(&self) -> usize {
        self.verdicts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All verdicts, sorted by domain.
    pub fn snapshot(&self) -> Vec<Verdict> {
        let mut all: Vec<Verdict> = self.verdicts.read().values().cloned().collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        all
    }

    /// Insert or replace the verdict for `verdict.domain`.
    ///
    /// Last write wins by `observed_at`: a verdict older than the one already
    /// cached is dropped. Re-setting an identical verdict is a no-op.
    pub fn set(&self, verdict: Verdict) -> CacheWrite {
        let _writer = self.write_gate.lock();

        let snapshot = {
            let mut map = self.verdicts.write();
            if let Some(existing) = map.get(&verdict.domain) {
                if *existing == verdict {
                    return CacheWrite {
                        applied: true,
                        durable: true,
                        warning: None,
                    };
                }
                if existing.observed_at > verdict.observed_at {
                    tracing::debug!(
                        domain = %verdict.domain,
                        "dropping verdict older than the cached one"
                    );
                    return CacheWrite::skipped();
                }
            }
            map.insert(verdict.domain.clone(), verdict);
            map.values().cloned().collect::<Vec<_>>()
        };

        self.flush(&snapshot)
    }

    /// Swap in a complete new verdict set. The new map is built before the
    /// write lock is taken, so readers see either the old or the new set.
    /// Later duplicates in `verdicts` win.
    pub fn bulk_replace(&self, verdicts: Vec<Verdict>) -> CacheWrite {
        let mut fresh = HashMap::with_capacity(verdicts.len());
        for v in verdicts {
            fresh.insert(v.domain.clone(), v);
        }
        let snapshot: Vec<Verdict> = fresh.values().cloned().collect();

        let _writer = self.write_gate.lock();
        let previous = std::mem::replace(&mut *self.verdicts.write(), fresh);
        drop(previous);

        self.flush(&snapshot)
    }

    fn flush(&self, snapshot: &[Verdict]) -> CacheWrite {
        match self.store.save(snapshot) {
            Ok(()) => CacheWrite {
                applied: true,
                durable: true,
                warning: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "verdict store write failed; keeping in-memory state");
                CacheWrite {
                    applied: true,
                    durable: false,
                    warning: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VerdictSource;
    use crate::services::store::MemoryVerdictStore;
    use chrono::{Duration, Utc};

    fn cache() -> (PolicyCache, Arc<MemoryVerdictStore>) {
        let store = Arc::new(MemoryVerdictStore::new());
        let cache = PolicyCache::load(store.clone()).unwrap();
        (cache, store)
    }

    #[test]
    fn newer_verdict_replaces_older_one() {
        let (cache, _) = cache();
        let t0 = Utc::now();
        cache.set(Verdict::new("a.test", VerdictStatus::Blocked, VerdictSource::RemoteRefresh, t0));
        let w = cache.set(Verdict::new(
            "a.test",
            VerdictStatus::Allowed,
            VerdictSource::Classifier,
            t0 + Duration::seconds(1),
        ));
        assert!(w.applied && w.durable);
        let v = cache.lookup("a.test").unwrap();
        assert_eq!(v.status, VerdictStatus::Allowed);
        assert_eq!(v.source, VerdictSource::Classifier);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_verdict_is_dropped() {
        let (cache, _) = cache();
        let t0 = Utc::now();
        cache.set(Verdict::new("a.test", VerdictStatus::Allowed, VerdictSource::Classifier, t0));
        let w = cache.set(Verdict::new(
            "a.test",
            VerdictStatus::Blocked,
            VerdictSource::ManualOverride,
            t0 - Duration::seconds(5),
        ));
        assert!(!w.applied);
        assert_eq!(cache.status("a.test"), Some(VerdictStatus::Allowed));
    }

    #[test]
    fn identical_set_does_not_touch_the_store() {
        let (cache, store) = cache();
        let v = Verdict::new("a.test", VerdictStatus::Allowed, VerdictSource::Classifier, Utc::now());
        cache.set(v.clone());
        cache.set(v);
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn unreadable_record_starts_an_empty_cache() {
        let store = Arc::new(MemoryVerdictStore::with_raw_record("{not json"));
        let cache = PolicyCache::load(store.clone()).unwrap();
        assert!(cache.is_empty());

        cache.set(Verdict::new("a.test", VerdictStatus::Allowed, VerdictSource::Classifier, Utc::now()));
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn failed_flush_keeps_memory_authoritative() {
        let (cache, store) = cache();
        store.set_fail_writes(true);
        let w = cache.set(Verdict::new("a.test", VerdictStatus::Allowed, VerdictSource::Classifier, Utc::now()));
        assert!(w.applied);
        assert!(!w.durable);
        assert!(w.warning.is_some());
        assert_eq!(cache.status("a.test"), Some(VerdictStatus::Allowed));
    }

    #[test]
    fn bulk_replace_drops_everything_not_in_the_new_set() {
        let (cache, store) = cache();
        let now = Utc::now();
        cache.set(Verdict::new("old.test", VerdictStatus::Allowed, VerdictSource::Classifier, now));
        cache.bulk_replace(vec![
            Verdict::new("new.test", VerdictStatus::Blocked, VerdictSource::RemoteRefresh, now),
            Verdict::new("new.test", VerdictStatus::Allowed, VerdictSource::RemoteRefresh, now),
        ]);
        assert_eq!(cache.lookup("old.test"), None);
        assert_eq!(cache.status("new.test"), Some(VerdictStatus::Allowed));
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
