// src/services/verifier.rs
//! Cache-miss verification: classifier call, optional reputation signal,
//! cache write on ALLOWED.
//!
//! - Every classifier round trip is bounded by the configured deadline. A call
//!   that misses it is abandoned; its late answer is discarded, so nothing is
//!   written for it.
//! - BLOCKED results are never written. The cache keeps whatever it had.
//! - Failures come back as [`VerificationOutcome::Failed`], never as BLOCKED.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::domain::{domain_of_url, parse_target, Verdict, VerdictSource, VerdictStatus};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::services::audit::Audit;
use crate::services::cache::PolicyCache;
use crate::services::classifier::{Classifier, ClassifierReport, Rationale};
use crate::services::messaging::{CacheEvents, CacheNotification};
use crate::services::reputation::{ReputationFeed, ReputationReport};

/// What the verification surface renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub domain: String,
    pub original_url: String,
    pub final_status: VerdictStatus,
    pub prediction: String,
    pub confidence: Option<f64>,
    pub rationale: Vec<Rationale>,
    pub reputation_flagged: bool,
}

impl VerificationResult {
    /// Confidence with one decimal, e.g. `87.3%`.
    pub fn confidence_display(&self) -> String {
        match self.confidence {
            Some(c) => format!("{c:.1}%"),
            None => "N/A".to_string(),
        }
    }

    /// Rationale entries that push toward BLOCKED.
    pub fn risk_factors(&self) -> impl Iterator<Item = &Rationale> {
        self.rationale.iter().filter(|r| r.increases_risk())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VerificationOutcome {
    /// The domain is now cached ALLOWED; the caller may navigate to `proceed_to`.
    Allowed {
        result: VerificationResult,
        proceed_to: String,
    },
    /// Stay on the verification surface. A temporary unlock is the only way on.
    Blocked {
        result: VerificationResult,
        override_available: bool,
    },
    /// Could not get a verdict (timeout, network, malformed response, bad URL).
    Failed {
        domain: Option<String>,
        original_url: String,
        kind: ErrorKind,
        message: String,
        override_available: bool,
    },
}

impl VerificationOutcome {
    pub fn final_status(&self) -> Option<VerdictStatus> {
        match self {
            VerificationOutcome::Allowed { result, .. }
            | VerificationOutcome::Blocked { result, .. } => Some(result.final_status),
            VerificationOutcome::Failed { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&VerificationResult> {
        match self {
            VerificationOutcome::Allowed { result, .. }
            | VerificationOutcome::Blocked { result, .. } => Some(result),
            VerificationOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, VerificationOutcome::Failed { .. })
    }
}

pub struct VerificationCoordinator {
    cache: Arc<PolicyCache>,
    classifier: Arc<dyn Classifier>,
    reputation: Option<Arc<dyn ReputationFeed>>,
    reputation_wait: Duration,
    events: Arc<CacheEvents>,
    clock: Arc<dyn Clock>,
    audit: Audit,
    timeout: Duration,
}

impl VerificationCoordinator {
    pub fn new(
        cache: Arc<PolicyCache>,
        classifier: Arc<dyn Classifier>,
        events: Arc<CacheEvents>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            cache,
            classifier,
            reputation: None,
            reputation_wait: Duration::ZERO,
            events,
            clock,
            audit: Audit::disabled(),
            timeout,
        }
    }

    /// Consult `feed` alongside the classifier, waiting at most `wait` (from
    /// the start of the verification) for its answer.
    pub fn with_reputation(mut self, feed: Arc<dyn ReputationFeed>, wait: Duration) -> Self {
        self.reputation = Some(feed);
        self.reputation_wait = wait;
        self
    }

    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.audit = audit;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn verify(&self, original_url: &str) -> VerificationOutcome {
        let domain = match parse_target(original_url)
            .and_then(|url| domain_of_url(&url).ok_or_else(|| no_host(original_url)))
        {
            Ok(d) => d,
            Err(e) => return self.failed(None, original_url, e),
        };

        tracing::debug!(%domain, "verifying");
        let (report, reputation) = match self.ask(original_url) {
            (Ok(report), reputation) => (report, reputation),
            (Err(e), _) => return self.failed(Some(domain), original_url, e),
        };

        let result = merge(domain, original_url, report, reputation);
        match result.final_status {
            VerdictStatus::Allowed => self.allowed(result),
            VerdictStatus::Blocked => self.blocked(result),
        }
    }

    /// Run the classifier and, alongside it, the reputation feed. The
    /// classifier must answer within `timeout`; the feed gets `reputation_wait`
    /// and counts as "not flagged" when it misses it.
    fn ask(&self, url: &str) -> (EngineResult<ClassifierReport>, Option<ReputationReport>) {
        let started = Instant::now();
        let pending = self
            .reputation
            .as_ref()
            .and_then(|feed| self.start_lookup(feed, url));

        let report = self.classify_by(url, started + self.timeout);
        let reputation = match (&report, pending) {
            (Ok(_), Some(rx)) => self.reputation_by(rx, started + self.reputation_wait),
            _ => None,
        };
        (report, reputation)
    }

    fn classify_by(&self, url: &str, deadline: Instant) -> EngineResult<ClassifierReport> {
        let endpoint = self.classifier.endpoint().to_string();
        let classifier = Arc::clone(&self.classifier);
        let target = url.to_string();
        let rx = off_thread("phishguard-classify", move || classifier.classify(&target))?;

        match rx.recv_deadline(deadline) {
            Ok(answer) => answer,
            // The late answer lands in a dropped channel; nothing is written for it.
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout {
                endpoint,
                after: self.timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Network {
                endpoint,
                message: "classifier worker exited without an answer".to_string(),
            }),
        }
    }

    fn start_lookup(
        &self,
        feed: &Arc<dyn ReputationFeed>,
        url: &str,
    ) -> Option<Receiver<EngineResult<ReputationReport>>> {
        let feed = Arc::clone(feed);
        let target = url.to_string();
        match off_thread("phishguard-reputation", move || feed.lookup(&target)) {
            Ok(rx) => Some(rx),
            Err(e) => {
                tracing::warn!(error = %e, "reputation lookup not started; treating as not flagged");
                None
            }
        }
    }

    fn reputation_by(
        &self,
        rx: Receiver<EngineResult<ReputationReport>>,
        deadline: Instant,
    ) -> Option<ReputationReport> {
        match rx.recv_deadline(deadline) {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "reputation lookup failed; treating as not flagged");
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    wait_ms = self.reputation_wait.as_millis() as u64,
                    "reputation lookup timed out; treating as not flagged"
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn allowed(&self, result: VerificationResult) -> VerificationOutcome {
        let verdict = Verdict::new(
            result.domain.clone(),
            VerdictStatus::Allowed,
            VerdictSource::Classifier,
            self.clock.now(),
        );
        let write = self.cache.set(verdict);
        if write.applied {
            self.events.publish(CacheNotification::VerdictUpdated {
                domain: result.domain.clone(),
                status: VerdictStatus::Allowed,
                source: VerdictSource::Classifier,
            });
        }
        tracing::info!(domain = %result.domain, confidence = ?result.confidence, "verified allowed");
        self.audit.record_action(
            "verifier",
            "verdict_allowed",
            &json!({
                "domain": result.domain,
                "confidence": result.confidence,
                "durable": write.durable,
            }),
            "low",
        );
        VerificationOutcome::Allowed {
            proceed_to: result.original_url.clone(),
            result,
        }
    }

    fn blocked(&self, result: VerificationResult) -> VerificationOutcome {
        tracing::info!(
            domain = %result.domain,
            reputation_flagged = result.reputation_flagged,
            "verified blocked"
        );
        self.audit.record_action(
            "verifier",
            "verdict_blocked",
            &json!({
                "domain": result.domain,
                "prediction": result.prediction,
                "confidence": result.confidence,
                "reputation_flagged": result.reputation_flagged,
            }),
            "high",
        );
        VerificationOutcome::Blocked {
            result,
            override_available: true,
        }
    }

    fn failed(&self, domain: Option<String>, original_url: &str, err: EngineError) -> VerificationOutcome {
        tracing::warn!(url = %original_url, error = %err, "verification failed");
        self.audit.record_action(
            "verifier",
            "verification_failed",
            &json!({
                "url": original_url,
                "domain": domain,
                "error": err.to_string(),
            }),
            "medium",
        );
        VerificationOutcome::Failed {
            override_available: domain.is_some(),
            domain,
            original_url: original_url.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Run `job` on a named thread; its single result arrives on the returned channel.
fn off_thread<T, F>(name: &str, job: F) -> EngineResult<Receiver<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = bounded::<T>(1);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            // The receiver is gone once its deadline passed.
            let _ = tx.send(job());
        })
        .map_err(|e| EngineError::Config(format!("spawn {name}: {e}")))?;
    Ok(rx)
}

/// Fold the reputation signal into the classifier's answer. A flag from either
/// side forces BLOCKED.
fn merge(
    domain: String,
    original_url: &str,
    report: ClassifierReport,
    reputation: Option<ReputationReport>,
) -> VerificationResult {
    let mut rationale = report.rationale;
    let mut flagged = report.reputation_flagged;

    if let Some(rep) = reputation.filter(|r| r.flagged) {
        flagged = true;
        let note = if rep.threat_types.is_empty() {
            "Flagged by the reputation feed".to_string()
        } else {
            format!("Flagged by the reputation feed: {}", rep.threat_types.join(", "))
        };
        rationale.insert(0, Rationale::note(note));
    }

    let final_status = if flagged {
        VerdictStatus::Blocked
    } else {
        report.status
    };
    let prediction = if flagged && report.status == VerdictStatus::Allowed {
        "PHISHING".to_string()
    } else {
        report.prediction
    };

    VerificationResult {
        domain,
        original_url: original_url.to_string(),
        final_status,
        prediction,
        confidence: report.confidence,
        rationale,
        reputation_flagged: flagged,
    }
}

fn no_host(input: &str) -> EngineError {
    EngineError::Parse {
        input: input.to_string(),
        reason: "no host".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: VerdictStatus) -> ClassifierReport {
        ClassifierReport {
            status,
            prediction: match status {
                VerdictStatus::Allowed => "LEGITIMATE".into(),
                VerdictStatus::Blocked => "PHISHING".into(),
            },
            confidence: Some(87.25),
            rationale: vec![Rationale::signal("url_length", "92", "increases phishing risk")],
            reputation_flagged: false,
        }
    }

    #[test]
    fn confidence_is_shown_with_one_decimal() {
        let r = merge("a.test".into(), "https://a.test", report(VerdictStatus::Blocked), None);
        assert_eq!(r.confidence_display(), "87.3%");
        assert_eq!(r.risk_factors().count(), 1);
    }

    #[test]
    fn reputation_flag_overrides_an_allowed_classifier_answer() {
        let rep = ReputationReport {
            flagged: true,
            threat_types: vec!["SOCIAL_ENGINEERING".into()],
        };
        let r = merge("a.test".into(), "https://a.test", report(VerdictStatus::Allowed), Some(rep));
        assert_eq!(r.final_status, VerdictStatus::Blocked);
        assert!(r.reputation_flagged);
        assert_eq!(r.prediction, "PHISHING");
        assert!(matches!(&r.rationale[0], Rationale::Note { text } if text.contains("SOCIAL_ENGINEERING")));
    }

    #[test]
    fn unflagged_reputation_changes_nothing() {
        let rep = ReputationReport {
            flagged: false,
            threat_types: vec![],
        };
        let r = merge("a.test".into(), "https://a.test", report(VerdictStatus::Allowed), Some(rep));
        assert_eq!(r.final_status, VerdictStatus::Allowed);
        assert_eq!(r.rationale.len(), 1);
    }
}
