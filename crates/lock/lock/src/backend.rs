use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;
use crate::handle::LockHandle;

/// Contract every lock backend satisfies.
///
/// Each operation has a blocking and an async form with identical semantics.
/// The async forms default to the blocking ones, which is what an in-process
/// backend wants; backends that talk to a remote store override both.
///
/// Backends return their failures as errors. [`LockManager`](crate::LockManager)
/// is responsible for turning them into "not acquired" / "not released".
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Short name used in logs, e.g. `"memory"`.
    fn name(&self) -> &'static str;

    /// Attempt once to acquire `key` for `issuer`.
    ///
    /// Returns a fresh handle when the key was free, the handle already held
    /// by `issuer` when it holds the key, and `None` when another issuer does.
    /// `key` has already been validated as non-empty.
    fn blocking_acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Remove the entry for `handle` if it still belongs to it, then release
    /// the handle through [`LockHandle::release_as_manager`].
    fn blocking_release(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Remove whatever entry exists for `key`, regardless of issuer.
    ///
    /// Returns `true` if a live entry was removed.
    fn blocking_release_key(&self, key: &str) -> Result<bool, LockError>;

    async fn acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        self.blocking_acquire(key, issuer, ttl)
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        self.blocking_release(handle)
    }

    async fn release_key(&self, key: &str) -> Result<bool, LockError> {
        self.blocking_release_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Backend implementing only the blocking forms.
    #[derive(Default)]
    struct BlockingOnly {
        acquires: AtomicUsize,
        key_releases: AtomicUsize,
    }

    #[async_trait]
    impl LockBackend for BlockingOnly {
        fn name(&self) -> &'static str {
            "blocking-only"
        }

        fn blocking_acquire(
            &self,
            _key: &str,
            _issuer: &str,
            _ttl: Duration,
        ) -> Result<Option<LockHandle>, LockError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn blocking_release(&self, _handle: &LockHandle) -> Result<bool, LockError> {
            Ok(false)
        }

        fn blocking_release_key(&self, key: &str) -> Result<bool, LockError> {
            self.key_releases.fetch_add(1, Ordering::SeqCst);
            Ok(key == "held")
        }
    }

    #[tokio::test]
    async fn async_forms_default_to_blocking_forms() {
        let inner = Arc::new(BlockingOnly::default());
        let backend: Arc<dyn LockBackend> = inner.clone();

        let acquired = backend.acquire("k", "A", Duration::from_secs(1)).await;
        assert!(matches!(acquired, Ok(None)));
        assert!(backend.release_key("held").await.unwrap());
        assert!(!backend.release_key("free").await.unwrap());

        assert_eq!(inner.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(inner.key_releases.load(Ordering::SeqCst), 2);
        assert_eq!(backend.name(), "blocking-only");
    }
}
