// src/services/gate.rs
//! The navigation gate: one synchronous decision per outbound request.
//!
//! Order of checks for a top-level navigation:
//!   parse → own verification surface → non-web scheme → unlock → cached verdict.
//! Only hash lookups happen here. No network, no storage, no audit writes.
//!
//! Unparseable URLs are allowed by default (`fail_open_on_parse_error`). The
//! engine exists to stop known-bad domains; a parse error is not evidence of
//! one. Turning the flag off sends such navigations to verification instead.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::domain::{domain_of_url, is_web_scheme, parse_target, VerdictStatus};
use crate::error::{EngineError, EngineResult};
use crate::services::cache::PolicyCache;
use crate::services::unlocks::TemporaryUnlockRegistry;

/// Request classes as reported by the host browser. Only `MainFrame` is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    Xmlhttprequest,
    Media,
    Websocket,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationRequest {
    pub requested_url: String,
    #[serde(default)]
    pub resource_kind: ResourceKind,
}

impl NavigationRequest {
    pub fn main_frame(url: impl Into<String>) -> Self {
        Self {
            requested_url: url.into(),
            resource_kind: ResourceKind::MainFrame,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    Allow,
    Redirect { target: String },
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Why the gate decided what it did (diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    SubResource,
    VerificationSurface,
    NonWebScheme,
    ParseFailOpen,
    ParseFailClosed,
    Unlocked,
    CachedAllowed,
    CachedBlocked,
    CacheMiss,
}

/// Where blocked and unknown navigations are sent. The original URL travels
/// as the `url` query parameter.
#[derive(Debug, Clone)]
pub struct VerificationSurface {
    base: Url,
}

impl VerificationSurface {
    pub const PARAM: &'static str = "url";

    pub fn new(base_url: &str) -> EngineResult<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            EngineError::Config(format!("verification_surface_url `{base_url}`: {e}"))
        })?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Same scheme, host, port and path as the surface; query and fragment ignored.
    pub fn is_surface(&self, url: &Url) -> bool {
        url.scheme() == self.base.scheme()
            && url.host_str() == self.base.host_str()
            && url.port_or_known_default() == self.base.port_or_known_default()
            && url.path() == self.base.path()
    }

    pub fn target_for(&self, original_url: &str) -> String {
        let mut target = self.base.clone();
        target.set_query(None);
        target
            .query_pairs_mut()
            .append_pair(Self::PARAM, original_url);
        target.into()
    }

    /// Recover the original URL from a surface target.
    pub fn original_from(&self, target: &str) -> Option<String> {
        let url = Url::parse(target).ok()?;
        if !self.is_surface(&url) {
            return None;
        }
        url.query_pairs()
            .find(|(k, _)| k == Self::PARAM)
            .map(|(_, v)| v.into_owned())
    }
}

pub struct RequestGate {
    cache: Arc<PolicyCache>,
    unlocks: Arc<TemporaryUnlockRegistry>,
    surface: VerificationSurface,
    fail_open_on_parse_error: bool,
}

impl RequestGate {
    pub fn new(
        cache: Arc<PolicyCache>,
        unlocks: Arc<TemporaryUnlockRegistry>,
        surface: VerificationSurface,
        fail_open_on_parse_error: bool,
    ) -> Self {
        Self {
            cache,
            unlocks,
            surface,
            fail_open_on_parse_error,
        }
    }

    pub fn surface(&self) -> &VerificationSurface {
        &self.surface
    }

    /// Shorthand for a top-level navigation to `url`.
    pub fn check(&self, url: &str) -> GateDecision {
        self.evaluate(&NavigationRequest::main_frame(url))
    }

    pub fn evaluate(&self, request: &NavigationRequest) -> GateDecision {
        let (decision, reason) = self.evaluate_with_reason(request);
        tracing::debug!(url = %request.requested_url, ?reason, allow = decision.is_allow(), "gate");
        decision
    }

    pub fn evaluate_with_reason(&self, request: &NavigationRequest) -> (GateDecision, GateReason) {
        if request.resource_kind != ResourceKind::MainFrame {
            return (GateDecision::Allow, GateReason::SubResource);
        }

        let raw = request.requested_url.as_str();
        let url = match parse_target(raw) {
            Ok(url) => url,
            Err(_) => return self.unparseable(raw),
        };

        if self.surface.is_surface(&url) {
            return (GateDecision::Allow, GateReason::VerificationSurface);
        }
        if !is_web_scheme(&url) {
            return (GateDecision::Allow, GateReason::NonWebScheme);
        }
        let Some(domain) = domain_of_url(&url) else {
            return self.unparseable(raw);
        };

        if self.unlocks.is_unlocked(&domain) {
            return (GateDecision::Allow, GateReason::Unlocked);
        }

        match self.cache.status(&domain) {
            Some(VerdictStatus::Allowed) => (GateDecision::Allow, GateReason::CachedAllowed),
            Some(VerdictStatus::Blocked) => (self.redirect(raw), GateReason::CachedBlocked),
            None => (self.redirect(raw), GateReason::CacheMiss),
        }
    }

    fn unparseable(&self, raw: &str) -> (GateDecision, GateReason) {
        if self.fail_open_on_parse_error {
            (GateDecision::Allow, GateReason::ParseFailOpen)
        } else {
            (self.redirect(raw), GateReason::ParseFailClosed)
        }
    }

    fn redirect(&self, original_url: &str) -> GateDecision {
        GateDecision::Redirect {
            target: self.surface.target_for(original_url),
        }
    }
}
