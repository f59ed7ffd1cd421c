// src/services/mod.rs

pub mod audit;
pub mod cache;        // in-memory verdict map, write-through to the store
pub mod classifier;   // POST /domain_status client + response interpretation
pub mod gate;         // hot-path navigation decision; never does I/O
pub mod messaging;    // typed channel messages + cache change fan-out
pub mod refresh;      // GET /all_domains + single-flight periodic replace
pub mod reputation;   // optional second opinion (Safe Browsing style)
pub mod store;        // the ONLY durable writer
pub mod unlocks;      // time-boxed overrides, lazily evicted
pub mod verifier;     // cache-miss verification flow

// Public API
pub use audit::Audit;
pub use cache::{CacheWrite, PolicyCache};
pub use classifier::{Classifier, ClassifierReport, HttpClassifier, Rationale};
pub use gate::{GateDecision, GateReason, NavigationRequest, RequestGate, ResourceKind, VerificationSurface};
pub use messaging::{CacheEvents, CacheNotification, Message, MessageHandler, MessageResponse};
pub use refresh::{HttpVerdictFeed, RefreshHandle, RefreshOutcome, RefreshScheduler, RemoteVerdict, VerdictFeed};
pub use reputation::{ReputationFeed, ReputationReport, SafeBrowsingClient};
pub use store::{MemoryVerdictStore, SqliteVerdictStore, VerdictStore};
pub use unlocks::{TemporaryUnlock, TemporaryUnlockRegistry};
pub use verifier::{VerificationCoordinator, VerificationOutcome, VerificationResult};
