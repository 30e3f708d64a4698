use thiserror::Error;

use keyward_lock::LockError;

/// Errors raised while configuring or running the Keyward CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. reading the config file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`KeywardConfig`](crate::config::KeywardConfig).
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    /// A lock usage error.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}
