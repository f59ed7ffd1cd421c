mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{engine, legitimate_report, phishing_report, StubClassifier, StubFeed};
use phishguard_core::clock::{Clock, SystemClock};
use phishguard_core::domain::{VerdictSource, VerdictStatus};
use phishguard_core::error::{EngineError, ErrorKind};
use phishguard_core::services::{
    CacheEvents, CacheNotification, MemoryVerdictStore, PolicyCache, Rationale, ReputationFeed,
    ReputationReport, VerificationCoordinator, VerificationOutcome,
};

#[test]
fn phishing_verdict_blocks_with_ranked_rationale_and_writes_nothing() {
    let classifier = StubClassifier::answering(phishing_report());
    let (engine, _) = engine(classifier.clone(), StubFeed::serving(vec![]));
    let events = engine.subscribe();

    let outcome = engine.verify("http://192.168.0.1/paypal-login");
    let VerificationOutcome::Blocked { result, override_available } = &outcome else {
        panic!("expected Blocked, got {outcome:?}");
    };
    assert!(*override_available);
    assert_eq!(result.final_status, VerdictStatus::Blocked);
    assert_eq!(result.prediction, "PHISHING");
    assert_eq!(result.confidence_display(), "87.3%");
    assert_eq!(result.rationale.len(), 3);
    assert_eq!(result.risk_factors().count(), 3);

    assert_eq!(engine.cache().lookup("192.168.0.1"), None);
    assert!(events.try_recv().is_err());
    assert!(!engine.check("http://192.168.0.1/paypal-login").is_allow());
    assert_eq!(classifier.calls(), 1);
}

#[test]
fn legitimate_verdict_is_cached_and_skips_the_classifier_next_time() {
    let classifier = StubClassifier::answering(legitimate_report());
    let (engine, clock) = engine(classifier.clone(), StubFeed::serving(vec![]));
    let events = engine.subscribe();

    let original = "https://www.docs.example.test/guide?page=2";
    assert!(!engine.check(original).is_allow());

    let outcome = engine.verify(original);
    let VerificationOutcome::Allowed { result, proceed_to } = &outcome else {
        panic!("expected Allowed, got {outcome:?}");
    };
    assert_eq!(proceed_to, original);
    assert_eq!(result.domain, "docs.example.test");

    let cached = engine.cache().lookup("docs.example.test").expect("cached");
    assert_eq!(cached.status, VerdictStatus::Allowed);
    assert_eq!(cached.source, VerdictSource::Classifier);
    assert_eq!(cached.observed_at, clock.now());

    assert_eq!(
        events.try_recv().unwrap(),
        CacheNotification::VerdictUpdated {
            domain: "docs.example.test".into(),
            status: VerdictStatus::Allowed,
            source: VerdictSource::Classifier,
        }
    );

    assert!(engine.check(original).is_allow());
    assert!(engine.check("http://docs.example.test/other").is_allow());
    assert_eq!(classifier.calls(), 1);
}

#[test]
fn classifier_failure_is_its_own_state_not_blocked() {
    let classifier = StubClassifier::failing(EngineError::Protocol {
        endpoint: "stub".into(),
        message: "model_status missing".into(),
    });
    let (engine, _) = engine(classifier, StubFeed::serving(vec![]));

    let outcome = engine.verify("https://odd.test/");
    match &outcome {
        VerificationOutcome::Failed {
            domain,
            kind,
            override_available,
            ..
        } => {
            assert_eq!(domain.as_deref(), Some("odd.test"));
            assert_eq!(*kind, ErrorKind::Protocol);
            assert!(*override_available);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(outcome.final_status(), None);
    assert!(engine.cache().is_empty());
}

#[test]
fn unparseable_target_fails_without_calling_the_classifier() {
    let classifier = StubClassifier::answering(legitimate_report());
    let (engine, _) = engine(classifier.clone(), StubFeed::serving(vec![]));

    let outcome = engine.verify("http://[::1");
    assert!(matches!(
        outcome,
        VerificationOutcome::Failed { kind: ErrorKind::Parse, override_available: false, .. }
    ));
    assert_eq!(classifier.calls(), 0);
}

#[test]
fn timed_out_call_leaves_no_write_even_when_it_answers_late() {
    let cache = Arc::new(PolicyCache::load(Arc::new(MemoryVerdictStore::new())).unwrap());
    let classifier = StubClassifier::slow(legitimate_report(), Duration::from_millis(300));
    let verifier = VerificationCoordinator::new(
        cache.clone(),
        classifier.clone(),
        Arc::new(CacheEvents::new()),
        Arc::new(SystemClock),
        Duration::from_millis(50),
    );

    let outcome = verifier.verify("https://slow.test/");
    match &outcome {
        VerificationOutcome::Failed { kind, message, .. } => {
            assert_eq!(*kind, ErrorKind::Network);
            assert!(message.contains("50ms"), "timeout message was {message}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    // Let the abandoned call finish; its ALLOWED answer must go nowhere.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(classifier.calls(), 1);
    assert!(cache.is_empty());
}

struct Flagging;

impl ReputationFeed for Flagging {
    fn lookup(&self, _url: &str) -> phishguard_core::error::EngineResult<ReputationReport> {
        Ok(ReputationReport {
            flagged: true,
            threat_types: vec!["SOCIAL_ENGINEERING".into()],
        })
    }
}

struct Broken;

impl ReputationFeed for Broken {
    fn lookup(&self, _url: &str) -> phishguard_core::error::EngineResult<ReputationReport> {
        Err(EngineError::Network {
            endpoint: "reputation".into(),
            message: "503".into(),
        })
    }
}

#[test]
fn reputation_flag_blocks_an_otherwise_legitimate_site() {
    let cache = Arc::new(PolicyCache::load(Arc::new(MemoryVerdictStore::new())).unwrap());
    let verifier = VerificationCoordinator::new(
        cache.clone(),
        StubClassifier::answering(legitimate_report()),
        Arc::new(CacheEvents::new()),
        Arc::new(SystemClock),
        Duration::from_secs(2),
    )
    .with_reputation(Arc::new(Flagging), Duration::from_secs(2));

    let outcome = verifier.verify("https://lookalike.test/");
    let result = outcome.result().expect("has a result");
    assert_eq!(result.final_status, VerdictStatus::Blocked);
    assert!(result.reputation_flagged);
    assert!(matches!(&result.rationale[0], Rationale::Note { .. }));
    assert!(cache.is_empty());
}

#[test]
fn reputation_failure_leaves_the_classifier_in_charge() {
    let cache = Arc::new(PolicyCache::load(Arc::new(MemoryVerdictStore::new())).unwrap());
    let verifier = VerificationCoordinator::new(
        cache.clone(),
        StubClassifier::answering(legitimate_report()),
        Arc::new(CacheEvents::new()),
        Arc::new(SystemClock),
        Duration::from_secs(2),
    )
    .with_reputation(Arc::new(Broken), Duration::from_secs(2));

    assert_eq!(
        verifier.verify("https://fine.test/").final_status(),
        Some(VerdictStatus::Allowed)
    );
    assert_eq!(cache.status("fine.test"), Some(VerdictStatus::Allowed));
}

struct Sluggish;

impl ReputationFeed for Sluggish {
    fn lookup(&self, _url: &str) -> phishguard_core::error::EngineResult<ReputationReport> {
        thread::sleep(Duration::from_millis(300));
        Ok(ReputationReport {
            flagged: true,
            threat_types: vec!["MALWARE".into()],
        })
    }
}

#[test]
fn slow_reputation_feed_does_not_cost_the_classifier_answer() {
    let cache = Arc::new(PolicyCache::load(Arc::new(MemoryVerdictStore::new())).unwrap());
    let verifier = VerificationCoordinator::new(
        cache.clone(),
        StubClassifier::answering(legitimate_report()),
        Arc::new(CacheEvents::new()),
        Arc::new(SystemClock),
        Duration::from_millis(100),
    )
    .with_reputation(Arc::new(Sluggish), Duration::from_millis(50));

    let outcome = verifier.verify("https://fine.test/");
    assert!(!outcome.is_failed(), "got {outcome:?}");
    assert_eq!(outcome.final_status(), Some(VerdictStatus::Allowed));
    assert!(!outcome.result().unwrap().reputation_flagged);
    assert_eq!(cache.status("fine.test"), Some(VerdictStatus::Allowed));
}

#[test]
fn concurrent_verifications_for_different_domains() {
    let classifier = StubClassifier::slow(legitimate_report(), Duration::from_millis(20));
    let (engine, _) = engine(classifier.clone(), StubFeed::serving(vec![]));
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || engine.verify(&format!("https://site{i}.test/")))
        })
        .collect();
    for h in handles {
        assert!(!h.join().unwrap().is_failed());
    }
    assert_eq!(engine.cache().len(), 8);
    assert_eq!(classifier.calls(), 8);
}
