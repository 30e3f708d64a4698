use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::CliError;

/// Top-level configuration, loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct KeywardConfig {
    /// Lock backend configuration.
    #[serde(default)]
    pub lock: LockConfig,
}

impl KeywardConfig {
    /// Load configuration from `path`, or use defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Configuration for the lock backend.
///
/// Exactly one backend is selected per process.
#[derive(Debug, Deserialize)]
pub struct LockConfig {
    /// Which backend to use: `"memory"` or `"redis"`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Connection URL for the backend (e.g. `redis://localhost:6379`).
    pub url: Option<String>,

    /// Key prefix for backends that support it. Defaults to `"keyward"`.
    pub prefix: Option<String>,

    /// Connection pool size for backends that pool connections.
    pub pool_size: Option<usize>,

    /// Connection and command timeout in milliseconds.
    pub connection_timeout_ms: Option<u64>,
}

impl LockConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            prefix: None,
            pool_size: None,
            connection_timeout_ms: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_owned()
}
