// src/services/store.rs
//! Durable projection of the policy cache.
//!
//! - The whole domain → verdict map lives in ONE record under a fixed key.
//! - Loaded wholesale at startup, written wholesale on every cache mutation.
//! - Only `PolicyCache` calls `save`; nothing else writes here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::domain::{Verdict, VerdictSource, VerdictStatus};
use crate::error::{EngineError, EngineResult};

pub trait VerdictStore: Send + Sync {
    /// Every persisted verdict; empty when nothing was ever saved.
    fn load(&self) -> EngineResult<Vec<Verdict>>;
    /// Replace the persisted set with `verdicts`.
    fn save(&self, verdicts: &[Verdict]) -> EngineResult<()>;
    /// Keep a copy of an unreadable record before the next `save` overwrites it.
    /// Returns where the copy went, if anywhere.
    fn quarantine(&self) -> EngineResult<Option<String>> {
        Ok(None)
    }
}

/// On-disk shape of one entry. Older records hold a bare `0|1` status.
#[derive(Debug, Serialize, Deserialize)]
struct StoredVerdict {
    status: VerdictStatus,
    source: VerdictSource,
    observed_at: DateTime<Utc>,
}

fn encode(verdicts: &[Verdict]) -> EngineResult<String> {
    let map: BTreeMap<&str, StoredVerdict> = verdicts
        .iter()
        .map(|v| {
            (
                v.domain.as_str(),
                StoredVerdict {
                    status: v.status,
                    source: v.source,
                    observed_at: v.observed_at,
                },
            )
        })
        .collect();
    serde_json::to_string(&map).map_err(|e| EngineError::Persistence(e.to_string()))
}

fn decode(text: &str, written_at: DateTime<Utc>) -> EngineResult<Vec<Verdict>> {
    let raw: BTreeMap<String, Value> =
        serde_json::from_str(text).map_err(|e| EngineError::CorruptRecord(e.to_string()))?;
    let mut out = Vec::with_capacity(raw.len());
    for (domain, value) in raw {
        // Legacy `{domain: 0|1}` records carry no provenance; they come back as CACHE.
        if let Some(code) = value.as_i64() {
            match VerdictStatus::from_wire(code) {
                Some(status) => {
                    out.push(Verdict::new(domain, status, VerdictSource::Cache, written_at))
                }
                None => tracing::warn!(%domain, code, "skipping stored verdict with unknown status"),
            }
            continue;
        }
        match serde_json::from_value::<StoredVerdict>(value) {
            Ok(s) => out.push(Verdict::new(domain, s.status, s.source, s.observed_at)),
            Err(e) => tracing::warn!(%domain, error = %e, "skipping unreadable stored verdict"),
        }
    }
    Ok(out)
}

/// SQLite-backed store: one `kv` row keyed by `storage_key`.
pub struct SqliteVerdictStore {
    db: Mutex<Connection>,
    key: String,
}

impl SqliteVerdictStore {
    /// Open/create the database and ensure schema.
    ///
    /// Creates the parent directory if missing and enables WAL.
    pub fn open(db_path: &Path, storage_key: &str) -> EngineResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Persistence(format!("{}: {e}", parent.display())))?;
        }

        let db = Connection::open(db_path)?;
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS kv (
              key         TEXT PRIMARY KEY,  -- fixed storage key
              value       TEXT NOT NULL,     -- JSON object: domain -> verdict
              updated_at  TEXT NOT NULL      -- RFC3339 UTC
            );
            "#,
        )?;

        Ok(Self {
            db: Mutex::new(db),
            key: storage_key.to_string(),
        })
    }
}

impl VerdictStore for SqliteVerdictStore {
    fn load(&self) -> EngineResult<Vec<Verdict>> {
        let db = self.db.lock();
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT value, updated_at FROM kv WHERE key=?1",
                [self.key.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((value, updated_at)) = row else {
            return Ok(Vec::new());
        };
        let written_at = DateTime::parse_from_rfc3339(&updated_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        decode(&value, written_at)
    }

    fn save(&self, verdicts: &[Verdict]) -> EngineResult<()> {
        let value = encode(verdicts)?;
        let now = Utc::now().to_rfc3339();
        self.db.lock().execute(
            r#"
            INSERT INTO kv(key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              value      = excluded.value,
              updated_at = excluded.updated_at
            "#,
            (self.key.as_str(), value.as_str(), now.as_str()),
        )?;
        Ok(())
    }

    fn quarantine(&self) -> EngineResult<Option<String>> {
        let backup = format!("{}.corrupt-{}", self.key, Utc::now().format("%Y%m%dT%H%M%SZ"));
        let copied = self.db.lock().execute(
            r#"
            INSERT OR REPLACE INTO kv(key, value, updated_at)
            SELECT ?2, value, ?3 FROM kv WHERE key = ?1
            "#,
            (self.key.as_str(), backup.as_str(), Utc::now().to_rfc3339().as_str()),
        )?;
        Ok((copied > 0).then_some(backup))
    }
}

/// Process-local store for tests and ephemeral engines. Goes through the same
/// JSON encoding as the SQLite store.
#[derive(Default)]
pub struct MemoryVerdictStore {
    record: Mutex<Option<String>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryVerdictStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Seed with a raw record, e.g. a legacy `{domain: 0|1}` map.
    pub fn with_raw_record(text: impl Into<String>) -> Self {
        let store = Self::default();
        *store.record.lock() = Some(text.into());
        store
    }
}

impl VerdictStore for MemoryVerdictStore {
    fn load(&self) -> EngineResult<Vec<Verdict>> {
        match self.record.lock().as_deref() {
            Some(text) => decode(text, Utc::now()),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, verdicts: &[Verdict]) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("simulated write failure".into()));
        }
        let text = encode(verdicts)?;
        *self.record.lock() = Some(text);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
