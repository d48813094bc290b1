use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SealdropError, SealdropResult};

/// Default PBKDF2-HMAC-SHA256 iteration count for container keys
pub const DEFAULT_KDF_ITERATIONS: u32 = 1_000_000;

/// Top-level configuration (loaded from sealdrop.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SealdropConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for per-session chunk staging directories
    pub staging_dir: PathBuf,
    /// Directory finished containers are written to
    pub storage_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Hashing worker threads (0 = cpu_count)
    pub hash_workers: usize,
    /// Idle time after which an unfinished session is reclaimed
    pub session_ttl_secs: u64,
}

/// Container key derivation settings.
///
/// The secret itself never lives in the config file; it is read from
/// `SEALDROP_SECRET` or prompted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2 iterations (default: 1,000,000)
    pub kdf_iterations: u32,
    /// KDF salt (overridable via SEALDROP_SALT)
    pub salt: String,
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
            staging_dir: PathBuf::from("~/.local/share/sealdrop/staging"),
            storage_dir: PathBuf::from("~/.local/share/sealdrop/files"),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            hash_workers: 0,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            salt: String::new(),
        }
    }
}

impl SealdropConfig {
    /// Load from a TOML file, or fall back to defaults when the file is absent.
    pub fn load(path: &Path) -> SealdropResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| SealdropError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> SealdropResult<Self> {
        toml::from_str(content).map_err(|e| SealdropError::Config(format!("parsing config: {e}")))
    }

    /// Reject settings that would make key derivation or sweeping meaningless.
    pub fn validate(&self) -> SealdropResult<()> {
        if self.crypto.kdf_iterations == 0 {
            return Err(SealdropError::Config(
                "crypto.kdf_iterations must be at least 1".into(),
            ));
        }
        if self.crypto.salt.is_empty() {
            return Err(SealdropError::Config(
                "crypto.salt is empty (set it in the config or SEALDROP_SALT)".into(),
            ));
        }
        if self.upload.session_ttl_secs == 0 {
            return Err(SealdropError::Config(
                "upload.session_ttl_secs must be non-zero".into(),
            ));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(SealdropError::Config(format!(
                "logging.format must be \"json\" or \"text\", got {other:?}"
            ))),
        }
    }
}
