// src/services/messaging.rs
//! Control channel between verification surfaces and the engine.
//!
//! Requests are typed ([`Message`]) and answered through one dispatcher
//! ([`MessageHandler::handle`]). Cache changes are fanned out to subscribers
//! as [`CacheNotification`]s so other open contexts can update their mirrors.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::clock::Clock;
use crate::domain::{normalize_domain, Verdict, VerdictSource, VerdictStatus};
use crate::services::audit::Audit;
use crate::services::cache::PolicyCache;
use crate::services::unlocks::TemporaryUnlockRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    TemporaryUnlock { domain: String },
    /// `status` uses the wire encoding: `0` blocked, `1` allowed.
    UpdateCache { domain: String, status: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MessageResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheNotification {
    VerdictUpdated {
        domain: String,
        status: VerdictStatus,
        source: VerdictSource,
    },
    Replaced {
        entries: usize,
    },
    Unlocked {
        domain: String,
        expires_at: DateTime<Utc>,
    },
}

/// Subscriber list for cache notifications. Disconnected subscribers are
/// dropped on the next publish.
#[derive(Default)]
pub struct CacheEvents {
    subscribers: Mutex<Vec<Sender<CacheNotification>>>,
}

impl CacheEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CacheNotification> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: CacheNotification) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

pub struct MessageHandler {
    cache: Arc<PolicyCache>,
    unlocks: Arc<TemporaryUnlockRegistry>,
    events: Arc<CacheEvents>,
    clock: Arc<dyn Clock>,
    audit: Audit,
}

impl MessageHandler {
    pub fn new(
        cache: Arc<PolicyCache>,
        unlocks: Arc<TemporaryUnlockRegistry>,
        events: Arc<CacheEvents>,
        clock: Arc<dyn Clock>,
        audit: Audit,
    ) -> Self {
        Self {
            cache,
            unlocks,
            events,
            clock,
            audit,
        }
    }

    pub fn handle(&self, message: Message) -> MessageResponse {
        match message {
            Message::TemporaryUnlock { domain } => self.request_temporary_unlock(&domain),
            Message::UpdateCache { domain, status } => self.update_cache(&domain, status),
        }
    }

    /// Decode and dispatch a raw JSON message; a bad payload is a failed response.
    pub fn handle_json(&self, raw: &str) -> MessageResponse {
        match serde_json::from_str::<Message>(raw) {
            Ok(message) => self.handle(message),
            Err(e) => MessageResponse::failed(format!("invalid message: {e}")),
        }
    }

    /// Grant the default-TTL unlock. The caller re-issues the navigation.
    pub fn request_temporary_unlock(&self, domain: &str) -> MessageResponse {
        let domain = match normalize_domain(domain) {
            Ok(d) => d,
            Err(e) => return MessageResponse::failed(e.to_string()),
        };
        let unlock = self.unlocks.grant_default(&domain);
        tracing::info!(%domain, expires_at = %unlock.expires_at(), "temporary unlock granted");
        self.audit.record_action(
            "messaging",
            "unlock_granted",
            &json!({"domain": domain, "ttl_secs": unlock.ttl.as_secs()}),
            "medium",
        );
        self.events.publish(CacheNotification::Unlocked {
            domain,
            expires_at: unlock.expires_at(),
        });
        MessageResponse::ok()
    }

    fn update_cache(&self, domain: &str, status: i64) -> MessageResponse {
        let domain = match normalize_domain(domain) {
            Ok(d) => d,
            Err(e) => return MessageResponse::failed(e.to_string()),
        };
        let Some(status) = VerdictStatus::from_wire(status) else {
            return MessageResponse::failed(format!("status must be 0 or 1, got {status}"));
        };

        let verdict = Verdict::new(
            domain.clone(),
            status,
            VerdictSource::ManualOverride,
            self.clock.now(),
        );
        let write = self.cache.set(verdict);
        if let Some(warning) = &write.warning {
            tracing::warn!(%domain, %warning, "manual cache update not persisted");
        }
        self.audit.record_action(
            "messaging",
            "cache_updated",
            &json!({
                "domain": domain,
                "status": status.as_str(),
                "applied": write.applied,
                "durable": write.durable,
            }),
            "medium",
        );
        if write.applied {
            self.events.publish(CacheNotification::VerdictUpdated {
                domain,
                status,
                source: VerdictSource::ManualOverride,
            });
        }
        MessageResponse::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_the_extension_wire_names() {
        let m: Message =
            serde_json::from_str(r#"{"action":"temporaryUnlock","domain":"a.test"}"#).unwrap();
        assert_eq!(m, Message::TemporaryUnlock { domain: "a.test".into() });
        let m: Message =
            serde_json::from_str(r#"{"action":"updateCache","domain":"a.test","status":1}"#).unwrap();
        assert_eq!(m, Message::UpdateCache { domain: "a.test".into(), status: 1 });

        let resp = serde_json::to_value(MessageResponse::ok()).unwrap();
        assert_eq!(resp, serde_json::json!({"success": true}));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let events = CacheEvents::new();
        let keep = events.subscribe();
        drop(events.subscribe());
        events.publish(CacheNotification::Replaced { entries: 0 });
        assert_eq!(events.subscriber_count(), 1);
        assert_eq!(keep.try_recv().unwrap(), CacheNotification::Replaced { entries: 0 });
    }
}
