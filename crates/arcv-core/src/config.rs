use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration (loaded from arcv.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub client: ClientConfig,
    pub service: ServiceConfig,
    pub local: LocalStoreConfig,
    pub credentials: CredentialConfig,
    pub upload: UploadConfig,
    pub log: LogConfig,
}

impl ArchiveConfig {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    }
}

/// Which backend implementation serves archive operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Network,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// "network" (remote archive service) or "local" (on-device stand-in)
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Archive service base URL
    pub url: String,
    /// Account username for identified calls (password comes from ARCV_SERVICE_PASSWORD)
    pub username: Option<String>,
    /// Per-request timeout in seconds (uploads use per-chunk requests)
    pub timeout_secs: u64,
    /// Reject plaintext HTTP service URLs
    pub enforce_tls: bool,
    /// Extra headers sent on every request (e.g. user agent)
    pub extra_headers: BTreeMap<String, String>,
}

/// Store backing the local variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalStoreKind {
    #[default]
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// "fs" (on-device directory) or "s3" (self-hosted S3-compatible endpoint)
    pub kind: LocalStoreKind,
    /// Root directory for the fs store
    pub root: PathBuf,
    /// S3 endpoint for the s3 store
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket name
    pub bucket: String,
    /// Enforce HTTPS for the S3 endpoint
    pub enforce_tls: bool,
    /// Cap on archived media bytes; copies past it fail with 413
    pub max_media_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Days covered by one credential fetch (default: 7)
    pub window_days: u64,
    /// Prefetch when fewer than this many future days remain cached
    pub refresh_threshold_days: u64,
    /// Interval between scheduled prefetch checks
    pub prefetch_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bytes sent per resumable chunk request
    pub chunk_size: usize,
    /// Consecutive transient failures tolerated before giving up
    pub max_resume_attempts: u32,
    /// Initial backoff between resume attempts (doubles, capped at 30s)
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: "https://archive.example.org".into(),
            username: None,
            timeout_secs: 30,
            enforce_tls: true,
            extra_headers: BTreeMap::new(),
        }
    }
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            kind: LocalStoreKind::Fs,
            root: PathBuf::from("~/.local/share/arcv/archive"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "arcv".into(),
            enforce_tls: false,
            max_media_bytes: None,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            refresh_threshold_days: 2,
            prefetch_interval_secs: 6 * 3600,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            max_resume_attempts: 5,
            backoff_ms: 500,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
