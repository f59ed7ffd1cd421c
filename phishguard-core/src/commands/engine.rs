// src/commands/engine.rs
//! The owned engine instance: one cache, one unlock registry, one gate, one
//! verifier, one refresh scheduler, wired together with shared handles.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::commands::init::ensure_initialized;
use crate::config::CoreConfig;
use crate::services::{
    Audit, CacheEvents, CacheNotification, Classifier, GateDecision, HttpClassifier,
    HttpVerdictFeed, Message, MessageHandler, MessageResponse, NavigationRequest, PolicyCache,
    RefreshHandle, RefreshOutcome, RefreshScheduler, ReputationFeed, RequestGate,
    SafeBrowsingClient, SqliteVerdictStore, TemporaryUnlockRegistry, VerdictFeed, VerdictStore,
    VerificationCoordinator, VerificationOutcome, VerificationSurface,
};

/// Overrides for collaborators. Anything left unset is built from the config.
pub struct EngineBuilder {
    config: CoreConfig,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn VerdictStore>>,
    classifier: Option<Arc<dyn Classifier>>,
    feed: Option<Arc<dyn VerdictFeed>>,
    reputation: Option<Arc<dyn ReputationFeed>>,
    audit: Option<Audit>,
}

impl EngineBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            classifier: None,
            feed: None,
            reputation: None,
            audit: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn VerdictStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn verdict_feed(mut self, feed: Arc<dyn VerdictFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn reputation(mut self, feed: Arc<dyn ReputationFeed>) -> Self {
        self.reputation = Some(feed);
        self
    }

    pub fn audit(mut self, audit: Audit) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let cfg = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit = self
            .audit
            .unwrap_or_else(|| Audit::from_config(&cfg.audit));

        let store: Arc<dyn VerdictStore> = match self.store {
            Some(s) => s,
            None => Arc::new(
                SqliteVerdictStore::open(&cfg.store.path, &cfg.store.storage_key)
                    .with_context(|| format!("opening verdict store {}", cfg.store.path.display()))?,
            ),
        };
        let classifier: Arc<dyn Classifier> = match self.classifier {
            Some(c) => c,
            None => Arc::new(HttpClassifier::new(&cfg.classifier).context("building classifier client")?),
        };
        let feed: Arc<dyn VerdictFeed> = match self.feed {
            Some(f) => f,
            None => Arc::new(HttpVerdictFeed::new(&cfg.refresh).context("building refresh client")?),
        };
        let reputation: Option<Arc<dyn ReputationFeed>> = match self.reputation {
            Some(r) => Some(r),
            None => SafeBrowsingClient::from_config(&cfg.reputation)
                .context("building reputation client")?
                .map(|c| Arc::new(c) as Arc<dyn ReputationFeed>),
        };

        let cache = Arc::new(PolicyCache::load(store).context("loading verdict cache")?);
        let unlocks = Arc::new(TemporaryUnlockRegistry::new(clock.clone(), cfg.unlock.ttl()));
        let events = Arc::new(CacheEvents::new());

        let surface = VerificationSurface::new(&cfg.gate.verification_surface_url)
            .context("parsing [gate] verification_surface_url")?;
        let gate = RequestGate::new(
            cache.clone(),
            unlocks.clone(),
            surface,
            cfg.gate.fail_open_on_parse_error,
        );

        let mut verifier = VerificationCoordinator::new(
            cache.clone(),
            classifier,
            events.clone(),
            clock.clone(),
            Duration::from_secs(cfg.classifier.timeout_secs),
        )
        .with_audit(audit.clone());
        if let Some(feed) = reputation {
            verifier = verifier.with_reputation(feed, Duration::from_secs(cfg.reputation.timeout_secs));
        }

        let mut scheduler = RefreshScheduler::new(
            feed,
            cache.clone(),
            events.clone(),
            clock.clone(),
            cfg.refresh.interval(),
        )
        .with_audit(audit.clone());
        if cfg.unlock.sweep_on_refresh {
            scheduler = scheduler.sweeping(unlocks.clone());
        }

        let messages = MessageHandler::new(
            cache.clone(),
            unlocks.clone(),
            events.clone(),
            clock,
            audit.clone(),
        );

        Ok(Engine {
            config: cfg,
            cache,
            unlocks,
            events,
            gate,
            verifier,
            messages,
            scheduler: Arc::new(scheduler),
            refresh: Mutex::new(None),
            audit,
        })
    }
}

pub struct Engine {
    config: CoreConfig,
    cache: Arc<PolicyCache>,
    unlocks: Arc<TemporaryUnlockRegistry>,
    events: Arc<CacheEvents>,
    gate: RequestGate,
    verifier: VerificationCoordinator,
    messages: MessageHandler,
    scheduler: Arc<RefreshScheduler>,
    refresh: Mutex<Option<RefreshHandle>>,
    audit: Audit,
}

impl Engine {
    pub fn builder(config: CoreConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Initialize `root` if needed, load its config, and build with HTTP collaborators.
    pub fn open(root: &Path) -> Result<Self> {
        ensure_initialized(root)?;
        let config = CoreConfig::load(root)?;
        EngineBuilder::new(config).build()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Start periodic refresh (first fetch runs immediately). Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.refresh.lock();
        if slot.is_some() {
            return Ok(());
        }
        if !self.config.refresh.enabled {
            tracing::info!("periodic refresh disabled");
            return Ok(());
        }
        let handle = Arc::clone(&self.scheduler)
            .spawn()
            .context("starting refresh scheduler")?;
        *slot = Some(handle);
        tracing::info!(interval_secs = self.config.refresh.interval_secs, "engine started");
        self.audit.record_action(
            "engine",
            "started",
            &json!({"cache_entries": self.cache.len()}),
            "low",
        );
        Ok(())
    }

    /// Stop the refresh thread. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let handle = self.refresh.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            tracing::info!("engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.refresh.lock().is_some()
    }

    pub fn on_navigation(&self, request: &NavigationRequest) -> GateDecision {
        self.gate.evaluate(request)
    }

    pub fn check(&self, url: &str) -> GateDecision {
        self.gate.check(url)
    }

    pub fn verify(&self, original_url: &str) -> VerificationOutcome {
        self.verifier.verify(original_url)
    }

    /// Recover the original URL from a redirect target produced by the gate.
    pub fn original_url_of(&self, redirect_target: &str) -> Option<String> {
        self.gate.surface().original_from(redirect_target)
    }

    pub fn request_temporary_unlock(&self, domain: &str) -> MessageResponse {
        self.messages.request_temporary_unlock(domain)
    }

    pub fn handle_message(&self, message: Message) -> MessageResponse {
        self.messages.handle(message)
    }

    pub fn handle_message_json(&self, raw: &str) -> MessageResponse {
        self.messages.handle_json(raw)
    }

    pub fn refresh_now(&self) -> RefreshOutcome {
        self.scheduler.refresh_now()
    }

    pub fn subscribe(&self) -> Receiver<CacheNotification> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn unlocks(&self) -> &Arc<TemporaryUnlockRegistry> {
        &self.unlocks
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
