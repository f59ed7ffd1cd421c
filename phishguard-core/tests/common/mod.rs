// Shared stubs for the integration tests. Each test binary uses a subset.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use phishguard_core::clock::{Clock, ManualClock};
use phishguard_core::config::CoreConfig;
use phishguard_core::domain::VerdictStatus;
use phishguard_core::error::{EngineError, EngineResult};
use phishguard_core::services::{
    Audit, Classifier, ClassifierReport, MemoryVerdictStore, Rationale, RemoteVerdict, VerdictFeed,
    VerdictStore,
};
use phishguard_core::{Engine, EngineBuilder};

pub const SURFACE: &str = "chrome-extension://phishguard/blocked.html";

/// Classifier that answers from a script, counts calls, and can be slowed down.
pub struct StubClassifier {
    answer: Mutex<EngineResult<ClassifierReport>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubClassifier {
    pub fn answering(report: ClassifierReport) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Ok(report)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(err: EngineError) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Err(err)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(report: ClassifierReport, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Ok(report)),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Classifier for StubClassifier {
    fn classify(&self, _url: &str) -> EngineResult<ClassifierReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        match &*self.answer.lock() {
            Ok(report) => Ok(report.clone()),
            Err(e) => Err(clone_error(e)),
        }
    }
}

fn clone_error(e: &EngineError) -> EngineError {
    match e {
        EngineError::Network { endpoint, message } => EngineError::Network {
            endpoint: endpoint.clone(),
            message: message.clone(),
        },
        EngineError::Protocol { endpoint, message } => EngineError::Protocol {
            endpoint: endpoint.clone(),
            message: message.clone(),
        },
        other => EngineError::Network {
            endpoint: "stub".into(),
            message: other.to_string(),
        },
    }
}

/// Authoritative verdict set served from memory.
pub struct StubFeed {
    rows: Mutex<Option<Vec<RemoteVerdict>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubFeed {
    pub fn serving(rows: Vec<RemoteVerdict>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Some(rows)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(rows: Vec<RemoteVerdict>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Some(rows)),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    /// Every fetch fails until `serve` is called.
    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn serve(&self, rows: Vec<RemoteVerdict>) {
        *self.rows.lock() = Some(rows);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VerdictFeed for StubFeed {
    fn fetch_all(&self) -> EngineResult<Vec<RemoteVerdict>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.rows.lock().clone().ok_or_else(|| EngineError::Network {
            endpoint: "stub/all_domains".into(),
            message: "connection refused".into(),
        })
    }
}

pub fn phishing_report() -> ClassifierReport {
    ClassifierReport {
        status: VerdictStatus::Blocked,
        prediction: "PHISHING".into(),
        confidence: Some(87.3),
        rationale: vec![
            Rationale::signal("having_IP_Address", "1", "increases phishing risk"),
            Rationale::signal("URL_Length", "98", "increases phishing risk"),
            Rationale::signal("SSLfinal_State", "-1", "increases phishing risk"),
        ],
        reputation_flagged: false,
    }
}

pub fn legitimate_report() -> ClassifierReport {
    ClassifierReport {
        status: VerdictStatus::Allowed,
        prediction: "LEGITIMATE".into(),
        confidence: Some(96.4),
        rationale: vec![Rationale::signal("SSLfinal_State", "1", "decreases phishing risk")],
        reputation_flagged: false,
    }
}

pub fn test_config() -> CoreConfig {
    let mut cfg = CoreConfig::default();
    cfg.audit.enabled = false;
    cfg.refresh.interval_secs = 3600;
    cfg
}

pub fn builder(
    classifier: Arc<dyn Classifier>,
    feed: Arc<dyn VerdictFeed>,
    store: Arc<dyn VerdictStore>,
    clock: Arc<dyn Clock>,
) -> EngineBuilder {
    Engine::builder(test_config())
        .classifier(classifier)
        .verdict_feed(feed)
        .store(store)
        .clock(clock)
        .audit(Audit::disabled())
}

/// Engine over an in-memory store and a manual clock.
pub fn engine(classifier: Arc<dyn Classifier>, feed: Arc<dyn VerdictFeed>) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let engine = builder(
        classifier,
        feed,
        Arc::new(MemoryVerdictStore::new()),
        clock.clone(),
    )
    .build()
    .expect("engine builds");
    (engine, clock)
}
