// src/domain.rs
//! Verdict model and host normalization.
//!
//! A domain is the registrable host of a navigation target: lowercased, with a
//! single leading `www.` removed. It is the only key shared by the cache, the
//! durable store and the unlock registry, so every entry point normalizes
//! through [`normalize_domain`] before touching them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Blocked,
    Allowed,
}

impl VerdictStatus {
    /// Wire encoding shared by the classifier and refresh endpoints: `0` blocks, `1` allows.
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            0 => Some(VerdictStatus::Blocked),
            1 => Some(VerdictStatus::Allowed),
            _ => None,
        }
    }

    pub fn wire_code(self) -> u8 {
        match self {
            VerdictStatus::Blocked => 0,
            VerdictStatus::Allowed => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictStatus::Blocked => "blocked",
            VerdictStatus::Allowed => "allowed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictSource {
    Cache,
    RemoteRefresh,
    Classifier,
    ManualOverride,
}

impl VerdictSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictSource::Cache => "cache",
            VerdictSource::RemoteRefresh => "remote_refresh",
            VerdictSource::Classifier => "classifier",
            VerdictSource::ManualOverride => "manual_override",
        }
    }
}

/// The cached allow/block decision for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub domain: String,
    pub status: VerdictStatus,
    pub source: VerdictSource,
    pub observed_at: DateTime<Utc>,
}

impl Verdict {
    pub fn new(
        domain: impl Into<String>,
        status: VerdictStatus,
        source: VerdictSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: domain.into(),
            status,
            source,
            observed_at,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.status == VerdictStatus::Allowed
    }
}

/// Parse a navigation target. Inputs without a scheme (`example.com/login`,
/// `localhost:5000`) are retried as `http://<input>`.
pub fn parse_target(input: &str) -> EngineResult<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(parse_error(input, "empty input"));
    }

    match Url::parse(trimmed) {
        // `host:port` parses as an opaque scheme; bare hosts fail as relative.
        Ok(url) if url.host_str().is_none() && looks_like_host_port(trimmed) => {
            with_http_scheme(input, trimmed)
        }
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => with_http_scheme(input, trimmed),
        Err(e) => Err(parse_error(input, &e.to_string())),
    }
}

fn with_http_scheme(input: &str, trimmed: &str) -> EngineResult<Url> {
    Url::parse(&format!("http://{trimmed}")).map_err(|e| parse_error(input, &e.to_string()))
}

fn looks_like_host_port(s: &str) -> bool {
    if s.contains("://") {
        return false;
    }
    let Some((_, rest)) = s.split_once(':') else {
        return false;
    };
    let port = rest.split(['/', '?', '#']).next().unwrap_or("");
    !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
}

/// Normalized domain of an already-parsed URL, if it has a usable host.
pub fn domain_of_url(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Normalize a URL or bare host into the cache key.
pub fn normalize_domain(input: &str) -> EngineResult<String> {
    let url = parse_target(input)?;
    domain_of_url(&url).ok_or_else(|| parse_error(input, "no host"))
}

/// Only `http(s)` navigations are subject to gating.
pub fn is_web_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn parse_error(input: &str, reason: &str) -> EngineError {
    EngineError::Parse {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
