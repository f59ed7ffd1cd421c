// src/services/reputation.rs
//! Optional reputation feed consulted alongside the classifier.
//!
//! A positive match is an extra reason to block; it never unblocks. The
//! production client speaks the Safe Browsing v4 `threatMatches:find` shape.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ReputationConfig;
use crate::error::{EngineError, EngineResult};

pub trait ReputationFeed: Send + Sync {
    fn lookup(&self, url: &str) -> EngineResult<ReputationReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReputationReport {
    pub flagged: bool,
    pub threat_types: Vec<String>,
}

const THREAT_TYPES: [&str; 4] = [
    "MALWARE",
    "SOCIAL_ENGINEERING",
    "UNWANTED_SOFTWARE",
    "POTENTIALLY_HARMFUL_APPLICATION",
];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FindRequest<'a> {
    client: ClientInfo<'a>,
    threat_info: ThreatInfo<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    client_id: &'a str,
    client_version: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreatInfo<'a> {
    threat_types: &'a [&'a str],
    platform_types: [&'a str; 1],
    threat_entry_types: [&'a str; 1],
    threat_entries: [ThreatEntry<'a>; 1],
}

#[derive(Serialize)]
struct ThreatEntry<'a> {
    url: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct FindResponse {
    #[serde(default)]
    matches: Vec<ThreatMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreatMatch {
    #[serde(default)]
    threat_type: String,
}

pub struct SafeBrowsingClient {
    endpoint: String,
    api_key: String,
    client_id: String,
    timeout_secs: u64,
    http: reqwest::blocking::Client,
}

impl SafeBrowsingClient {
    pub fn new(cfg: &ReputationConfig, api_key: String) -> EngineResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("reputation http client: {e}")))?;
        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            api_key,
            client_id: cfg.client_id.clone(),
            timeout_secs: cfg.timeout_secs,
            http,
        })
    }

    /// Build from config when enabled and an API key is present.
    pub fn from_config(cfg: &ReputationConfig) -> EngineResult<Option<Self>> {
        if !cfg.enabled {
            return Ok(None);
        }
        match cfg.api_key() {
            Some(key) => Self::new(cfg, key).map(Some),
            None => {
                tracing::warn!(env = %cfg.api_key_env, "reputation feed enabled but no API key set");
                Ok(None)
            }
        }
    }
}

impl ReputationFeed for SafeBrowsingClient {
    fn lookup(&self, url: &str) -> EngineResult<ReputationReport> {
        let body = FindRequest {
            client: ClientInfo {
                client_id: &self.client_id,
                client_version: env!("CARGO_PKG_VERSION"),
            },
            threat_info: ThreatInfo {
                threat_types: &THREAT_TYPES,
                platform_types: ["ANY_PLATFORM"],
                threat_entry_types: ["URL"],
                threat_entries: [ThreatEntry { url }],
            },
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Network {
                endpoint: self.endpoint.clone(),
                message: format!("server returned {status}"),
            });
        }

        let found: FindResponse = resp
            .json()
            .map_err(|e| EngineError::from_http(&self.endpoint, self.timeout_secs, e))?;
        let threat_types: Vec<String> = found.matches.into_iter().map(|m| m.threat_type).collect();
        Ok(ReputationReport {
            flagged: !threat_types.is_empty(),
            threat_types,
        })
    }
}
