// src/services/refresh.rs
//! Periodic replacement of the cache with the authoritative verdict set
//! (`GET /all_domains`).
//!
//! - A successful fetch always ends in `bulk_replace`, even when the list is empty.
//! - A failed fetch leaves the cache untouched; the next tick retries.
//! - Single-flight: a tick that finds a fetch in progress returns `InFlight`.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RefreshConfig;
use crate::domain::{normalize_domain, Verdict, VerdictSource, VerdictStatus};
use crate::error::{EngineError, EngineResult};
use crate::services::audit::Audit;
use crate::services::cache::PolicyCache;
use crate::services::messaging::{CacheEvents, CacheNotification};
use crate::services::unlocks::TemporaryUnlockRegistry;

/// Where the authoritative verdict set comes from.
pub trait VerdictFeed: Send + Sync {
    fn fetch_all(&self) -> EngineResult<Vec<RemoteVerdict>>;
}

/// One row of `GET /all_domains`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVerdict {
    pub domain: String,
    pub status: i64,
}

impl RemoteVerdict {
    pub fn new(domain: impl Into<String>, status: VerdictStatus) -> Self {
        Self {
            domain: domain.into(),
            status: i64::from(status.wire_code()),
        }
    }
}

pub struct HttpVerdictFeed {
    endpoint: String,
    timeout_secs: u64,
    http: reqwest::blocking::Client,
}

impl HttpVerdictFeed {
    pub fn new(cfg: &RefreshConfig) -> EngineResult<Self> {
        let endpoint = format!("{}/all_domains", cfg.endpoint.trim_end_matches('/'));
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("refresh http client: {e}")))?;
        Ok(Self {
            endpoint,
            timeout_secs: cfg.timeout_secs,
            http,
        })
    }
}

impl VerdictFeed for HttpVerdictFeed {
    fn fetch_all(&self) -> EngineResult<Vec<RemoteVerdict>> {
        let resp = self
            .http
            .get(&self.endpoint)
            .send()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Network {
                endpoint: self.endpoint.clone(),
                message: format!("server returned {status}"),
            });
        }

        resp.json()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// The cache now holds exactly `count` verdicts; `skipped` rows had no usable domain.
    Replaced { count: usize, skipped: usize },
    /// Another refresh was already running.
    InFlight,
    /// Fetch or decode failed; the cache was not touched.
    Failed { message: String },
}

pub struct RefreshScheduler {
    feed: Arc<dyn VerdictFeed>,
    cache: Arc<PolicyCache>,
    unlocks: Option<Arc<TemporaryUnlockRegistry>>,
    events: Arc<CacheEvents>,
    clock: Arc<dyn Clock>,
    audit: Audit,
    interval: Duration,
    in_flight: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(
        feed: Arc<dyn VerdictFeed>,
        cache: Arc<PolicyCache>,
        events: Arc<CacheEvents>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            feed,
            cache,
            unlocks: None,
            events,
            clock,
            audit: Audit::disabled(),
            interval,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Sweep expired unlocks after every refresh tick.
    pub fn sweeping(mut self, unlocks: Arc<TemporaryUnlockRegistry>) -> Self {
        self.unlocks = Some(unlocks);
        self
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn refresh_now(&self) -> RefreshOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("refresh already in flight; skipping tick");
            return RefreshOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let outcome = match self.feed.fetch_all().and_then(|rows| self.to_verdicts(rows)) {
            Ok((verdicts, skipped)) => {
                let count = verdicts.len();
                let write = self.cache.bulk_replace(verdicts);
                let entries = self.cache.len();
                self.events.publish(CacheNotification::Replaced { entries });
                tracing::info!(count = entries, skipped, durable = write.durable, "verdict set refreshed");
                self.audit.record_action(
                    "refresh",
                    "cache_replaced",
                    &json!({"entries": entries, "received": count, "skipped": skipped, "durable": write.durable}),
                    "low",
                );
                RefreshOutcome::Replaced {
                    count: entries,
                    skipped,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "refresh failed; keeping current cache");
                self.audit.record_action(
                    "refresh",
                    "refresh_failed",
                    &json!({"error": e.to_string()}),
                    "medium",
                );
                RefreshOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };

        if let Some(unlocks) = &self.unlocks {
            let swept = unlocks.sweep_expired();
            if swept > 0 {
                tracing::debug!(swept, "expired unlocks removed");
            }
        }
        outcome
    }

    /// An unknown status code rejects the whole response; a row whose domain
    /// does not normalize is skipped.
    fn to_verdicts(&self, rows: Vec<RemoteVerdict>) -> EngineResult<(Vec<Verdict>, usize)> {
        let now = self.clock.now();
        let mut verdicts = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            let status = VerdictStatus::from_wire(row.status).ok_or_else(|| EngineError::Protocol {
                endpoint: "all_domains".to_string(),
                message: format!("status {} for `{}` is not 0 or 1", row.status, row.domain),
            })?;
            match normalize_domain(&row.domain) {
                Ok(domain) => verdicts.push(Verdict::new(domain, status, VerdictSource::RemoteRefresh, now)),
                Err(e) => {
                    tracing::warn!(domain = %row.domain, error = %e, "skipping refresh row");
                    skipped += 1;
                }
            }
        }
        Ok((verdicts, skipped))
    }

    /// Refresh immediately, then once per interval until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> EngineResult<RefreshHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = self.interval;
        let join = thread::Builder::new()
            .name("phishguard-refresh".into())
            .spawn(move || loop {
                self.refresh_now();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| EngineError::Config(format!("spawn refresh thread: {e}")))?;
        Ok(RefreshHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the background refresh thread. Dropping it stops the loop.
pub struct RefreshHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    /// Stop the loop and wait for an in-progress refresh to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("refresh thread panicked");
            }
        }
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_domains_rows_decode() {
        let rows: Vec<RemoteVerdict> =
            serde_json::from_str(r#"[{"domain":"a.test","status":1},{"domain":"b.test","status":0}]"#).unwrap();
        assert_eq!(rows[0], RemoteVerdict::new("a.test", VerdictStatus::Allowed));
        assert_eq!(rows[1], RemoteVerdict::new("b.test", VerdictStatus::Blocked));
    }

    #[test]
    fn endpoint_is_derived_from_the_base_url() {
        let cfg = RefreshConfig {
            endpoint: "http://localhost:5000/".into(),
            ..RefreshConfig::default()
        };
        let feed = HttpVerdictFeed::new(&cfg).unwrap();
        assert_eq!(feed.endpoint, "http://localhost:5000/all_domains");
    }
}
