use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub unlock: UnlockConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl CoreConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.store.path = absolutize(root, &self.store.path);
        self.audit.path = absolutize(root, &self.audit.path);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "StoreConfig::default_storage_key")]
    pub storage_key: String,
}

impl StoreConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("cache/verdicts.db")
    }

    fn default_storage_key() -> String {
        "domainStatusCache".to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            storage_key: Self::default_storage_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "GateConfig::default_verification_surface_url")]
    pub verification_surface_url: String,
    /// Allow navigations whose URL cannot be normalized instead of sending
    /// them to verification.
    #[serde(default = "GateConfig::default_true")]
    pub fail_open_on_parse_error: bool,
}

impl GateConfig {
    fn default_verification_surface_url() -> String {
        "chrome-extension://phishguard/blocked.html".to_string()
    }

    fn default_true() -> bool {
        true
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            verification_surface_url: Self::default_verification_surface_url(),
            fail_open_on_parse_error: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnlockConfig {
    #[serde(default = "UnlockConfig::default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "UnlockConfig::default_sweep_on_refresh")]
    pub sweep_on_refresh: bool,
}

impl UnlockConfig {
    fn default_ttl_secs() -> u64 {
        300
    }

    fn default_sweep_on_refresh() -> bool {
        true
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for UnlockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Self::default_ttl_secs(),
            sweep_on_refresh: Self::default_sweep_on_refresh(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_backend_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_backend_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "RefreshConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backend_endpoint")]
    pub endpoint: String,
    #[serde(default = "RefreshConfig::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RefreshConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_interval_secs() -> u64 {
        60 * 60
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            endpoint: default_backend_endpoint(),
            interval_secs: Self::default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReputationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "ReputationConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "ReputationConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "ReputationConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "ReputationConfig::default_client_id")]
    pub client_id: String,
}

impl ReputationConfig {
    fn default_endpoint() -> String {
        "https://safebrowsing.googleapis.com/v4/threatMatches:find".to_string()
    }

    fn default_api_key_env() -> String {
        "GOOGLE_SAFE_BROWSING_API_KEY".to_string()
    }

    fn default_timeout_secs() -> u64 {
        5
    }

    fn default_client_id() -> String {
        "phishguard".to_string()
    }

    /// API key from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: Self::default_endpoint(),
            api_key_env: Self::default_api_key_env(),
            timeout_secs: Self::default_timeout_secs(),
            client_id: Self::default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AuditConfig::default_path")]
    pub path: PathBuf,
}

impl AuditConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_path() -> PathBuf {
        PathBuf::from("logbook/actions.jsonl")
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            path: Self::default_path(),
        }
    }
}

fn default_backend_endpoint() -> String {
    "http://localhost:5000".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
