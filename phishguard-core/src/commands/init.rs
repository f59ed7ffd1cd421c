// phishguard-core/src/commands/init.rs

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

// ---------- single global init gate ----------

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Idempotent process-wide initializer for the root from [`phishguard_root`].
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(|| ensure_initialized(&phishguard_root()))
}

/// Resolve the engine root. `PHISHGUARD_ROOT` overrides the default (tests, hosts).
pub fn phishguard_root() -> PathBuf {
    std::env::var_os("PHISHGUARD_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".phishguard"))
}

/// What the root must contain. Directories come before the files inside them.
const LAYOUT: &[(&str, Option<&str>)] = &[
    (".", None),
    ("cache", None),
    ("logbook", None),
    ("config.toml", Some(DEFAULT_CONFIG_TOML)),
];

/// Create the root layout if missing. Safe to call often; never overwrites.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        existed: Vec::new(),
    };

    for (rel, seed) in LAYOUT {
        let path = if *rel == "." { root.to_path_buf() } else { root.join(rel) };
        if path.exists() {
            report.existed.push(rel.to_string());
            continue;
        }
        match seed {
            None => fs::create_dir_all(&path)
                .with_context(|| format!("create_dir_all({:?})", path))?,
            Some(text) => write_new(&path, text)?,
        }
        report.created.push(rel.to_string());
    }

    Ok(report)
}

/// Write through a sibling temp file so a crash never leaves a half-written config.
fn write_new(path: &Path, text: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)
        .with_context(|| format!("open temp file {:?}", tmp))?;
    f.write_all(text.as_bytes())?;
    f.sync_all()?;
    drop(f);
    fs::rename(&tmp, path).with_context(|| format!("rename {:?} -> {:?}", tmp, path))
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"# Relative paths resolve against this directory.

[store]
path = "cache/verdicts.db"
storage_key = "domainStatusCache"

[gate]
verification_surface_url = "chrome-extension://phishguard/blocked.html"
fail_open_on_parse_error = true

[unlock]
ttl_secs = 300
sweep_on_refresh = true

[classifier]
endpoint = "http://localhost:5000"
timeout_secs = 10

[refresh]
enabled = true
endpoint = "http://localhost:5000"
interval_secs = 3600
timeout_secs = 10

[reputation]
enabled = false
endpoint = "https://safebrowsing.googleapis.com/v4/threatMatches:find"
api_key_env = "GOOGLE_SAFE_BROWSING_API_KEY"
timeout_secs = 5
client_id = "phishguard"

[audit]
enabled = true
path = "logbook/actions.jsonl"
"#;
