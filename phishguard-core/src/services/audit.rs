//! services/audit.rs
//! Action logbook: verifications, overrides, cache updates and refresh outcomes.
//!
//! - One JSON object per line, appended to the configured file.
//! - Best effort: write failures are ignored so auditing never fails a caller.
//! - Gate decisions are NOT recorded here; the gate must stay I/O-free.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::AuditConfig;

#[derive(Debug, Clone)]
pub struct Audit {
    path: Option<PathBuf>,
}

impl Audit {
    pub fn from_config(cfg: &AuditConfig) -> Self {
        Self {
            path: cfg.enabled.then(|| cfg.path.clone()),
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a generic action event.
    ///
    /// # Arguments
    /// * `agent`: Logical component name (e.g., `"verifier"`, `"refresh"`).
    /// * `action`: Short verb label (e.g., `"verdict_allowed"`, `"unlock_granted"`).
    /// * `details`: Arbitrary JSON payload (domain, status, counts).
    /// * `severity`: `"low" | "medium" | "high"`, for quick triage.
    pub fn record_action(&self, agent: &str, action: &str, details: &Value, severity: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": "action",
            "agent": agent,
            "action": action,
            "severity": severity,
            "details": details
        });
        append_jsonl(path, &entry);
    }
}

/// Append a single JSON value as a line to a JSONL file.
///
/// Creates parent directories if missing; ignores write errors to avoid crashing the caller.
fn append_jsonl<P: AsRef<Path>, S: Serialize>(path: P, val: &S) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let Ok(line) = serde_json::to_string(val) else {
        return;
    };
    if let Ok(mut f) = fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{line}");
    }
}
