use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::LockBackend;
use crate::error::LockError;
use crate::handle::LockHandle;
use crate::key::derive_key;

/// Entry point for acquiring and releasing named locks.
///
/// A `LockManager` wraps exactly one backend and is meant to be constructed
/// once per process and shared (it is cheap to clone). Backend failures never
/// escape it: they are logged and reported the same way as a contended lock
/// (`None`) or a lock that was not held (`false`). The only error callers see
/// is [`LockError::InvalidKey`].
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Name of the backend behind this manager.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Attempt once to acquire `key` for `issuer` for `ttl`.
    ///
    /// Returns the handle already held when `issuer` holds `key` (its expiry
    /// is not extended), `None` when another issuer holds it.
    pub async fn acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        validate_key(key)?;
        let result = self.backend.acquire(key, issuer, ttl).await;
        Ok(self.acquired(key, issuer, result))
    }

    /// Blocking form of [`acquire`](Self::acquire).
    pub fn blocking_acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        validate_key(key)?;
        let result = self.backend.blocking_acquire(key, issuer, ttl);
        Ok(self.acquired(key, issuer, result))
    }

    /// Acquire the key derived from `value` by [`derive_key`].
    pub async fn acquire_for<T, F, V>(
        &self,
        value: &T,
        ttl: Duration,
        selector: F,
        issuer: &str,
    ) -> Result<Option<LockHandle>, LockError>
    where
        T: ?Sized,
        F: FnOnce(&T) -> V,
        V: Display,
    {
        let key = derive_key(value, selector);
        self.acquire(&key, issuer, ttl).await
    }

    /// Blocking form of [`acquire_for`](Self::acquire_for).
    pub fn blocking_acquire_for<T, F, V>(
        &self,
        value: &T,
        ttl: Duration,
        selector: F,
        issuer: &str,
    ) -> Result<Option<LockHandle>, LockError>
    where
        T: ?Sized,
        F: FnOnce(&T) -> V,
        V: Display,
    {
        let key = derive_key(value, selector);
        self.blocking_acquire(&key, issuer, ttl)
    }

    /// Release `handle`.
    ///
    /// Returns `true` only for the call that released it; releasing again, or
    /// releasing a handle whose entry was already removed, returns `false`.
    pub async fn release(&self, handle: &LockHandle) -> bool {
        if handle.is_released() {
            return false;
        }
        let result = self.backend.release(handle).await;
        self.released(handle.key(), result)
    }

    /// Blocking form of [`release`](Self::release).
    pub fn blocking_release(&self, handle: &LockHandle) -> bool {
        if handle.is_released() {
            return false;
        }
        let result = self.backend.blocking_release(handle);
        self.released(handle.key(), result)
    }

    /// Force-release `key` regardless of which issuer holds it.
    ///
    /// Returns `Ok(true)` if a live lock was removed.
    pub async fn release_key(&self, key: &str) -> Result<bool, LockError> {
        validate_key(key)?;
        let result = self.backend.release_key(key).await;
        Ok(self.released(key, result))
    }

    fn acquired(
        &self,
        key: &str,
        issuer: &str,
        result: Result<Option<LockHandle>, LockError>,
    ) -> Option<LockHandle> {
        match result {
            Ok(Some(handle)) => {
                debug!(
                    backend = self.backend.name(),
                    key,
                    issuer,
                    expires_on = %handle.expires_on(),
                    "lock acquired"
                );
                Some(handle)
            }
            Ok(None) => {
                debug!(backend = self.backend.name(), key, issuer, "lock unavailable");
                None
            }
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    key,
                    issuer,
                    error = %e,
                    "lock acquire failed"
                );
                None
            }
        }
    }

    fn released(&self, key: &str, result: Result<bool, LockError>) -> bool {
        match result {
            Ok(released) => {
                debug!(backend = self.backend.name(), key, released, "lock release");
                released
            }
            Err(e) => {
                warn!(backend = self.backend.name(), key, error = %e, "lock release failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<(), LockError> {
    if key.is_empty() {
        return Err(LockError::InvalidKey);
    }
    Ok(())
}
