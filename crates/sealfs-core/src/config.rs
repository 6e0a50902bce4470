use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SealfsError, SealfsResult};

/// Top-level configuration (loaded from sealfs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SealfsConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
}

impl SealfsConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a present but malformed file is an error.
    pub fn load(path: &Path) -> SealfsResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| SealfsError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> SealfsResult<Self> {
        toml::from_str(content).map_err(|e| SealfsError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Which backend the storage layer talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    Memory,
    /// Local filesystem rooted at `root`
    Fs,
    /// Any S3-compatible endpoint
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the fs backend, key prefix for s3
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Refuse plaintext HTTP S3 endpoints
    pub enforce_tls: bool,
}

/// Streaming encryption parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// File holding the base64-encoded 32-byte key
    pub key_file: Option<PathBuf>,
    /// Plaintext bytes per chunk (default: 65536)
    pub chunk_size: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("./sealfs-data"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "sealfs".into(),
            enforce_tls: false,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            chunk_size: 64 * 1024,
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
