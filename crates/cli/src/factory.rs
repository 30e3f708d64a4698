use std::sync::Arc;

use keyward_lock::LockManager;
use keyward_lock_memory::MemoryLockBackend;
#[cfg(feature = "redis")]
use keyward_lock_redis::{RedisConfig, RedisLockBackend};

use crate::config::LockConfig;
use crate::error::CliError;

/// Construct the process-wide [`LockManager`] for the configured backend.
///
/// Call this once at startup and share the returned manager.
pub fn create_lock_manager(config: &LockConfig) -> Result<LockManager, CliError> {
    match config.backend.as_str() {
        "memory" => Ok(create_memory()),
        #[cfg(feature = "redis")]
        "redis" => create_redis(config),
        other => Err(CliError::Config(format!(
            "unsupported lock backend: {other} (is the feature enabled?)"
        ))),
    }
}

fn create_memory() -> LockManager {
    LockManager::new(Arc::new(MemoryLockBackend::new()))
}

#[cfg(feature = "redis")]
fn create_redis(config: &LockConfig) -> Result<LockManager, CliError> {
    let defaults = RedisConfig::default();
    let redis_config = RedisConfig {
        url: config.url.clone().unwrap_or(defaults.url),
        prefix: config.prefix.clone().unwrap_or(defaults.prefix),
        pool_size: config.pool_size.unwrap_or(defaults.pool_size),
        connection_timeout: config
            .connection_timeout()
            .unwrap_or(defaults.connection_timeout),
    };
    let backend = RedisLockBackend::new(&redis_config)
        .map_err(|e| CliError::Config(format!("redis lock: {e}")))?;
    Ok(LockManager::new(Arc::new(backend)))
}
