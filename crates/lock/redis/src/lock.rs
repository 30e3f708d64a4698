//! Redis-backed locking.
//!
//! This module provides [`RedisLockBackend`], which keeps one Redis string per
//! held lock: the value is the issuer token and the key carries a native `PX`
//! expiry equal to the lock's TTL.
//!
//! # How It Works
//!
//! - **Acquire** runs one Lua script: `SET key "<token>:<issuer>" NX PX ttl`,
//!   with a token that is fresh for every attempt. When the key already
//!   exists, the script compares the issuer part of its value in the same
//!   atomic step and reports a reentrant acquire, returning the stored value
//!   and the remaining `PTTL` without extending it.
//! - **Release** runs a Lua script that deletes the key only if it still holds
//!   the releasing acquisition's value. A lock that expired and was taken
//!   again, even by the same issuer, is never deleted by a previous holder.
//! - **Release by key** is a plain `DEL`.
//!
//! Handles issued by this process are indexed by key, so a reentrant acquire
//! returns the same handle and a release by key notifies its listeners. A
//! handle that is no longer the indexed one is refused without touching
//! Redis. An issuer reentering a lock taken by another process gets a new
//! handle that expires with the Redis key.
//!
//! Holder releases ([`LockHandle::release_as_holder`], dropping a
//! [`LockGuard`](keyward_lock::LockGuard)) are synchronous. Inside a
//! multi-threaded Tokio runtime they run through
//! [`tokio::task::block_in_place`]; on a current-thread runtime they block the
//! runtime for up to the connection timeout, so prefer
//! [`LockManager::release`](keyward_lock::LockManager::release) there.
//!
//! # Guarantees
//!
//! Against a single Redis instance, at most one issuer holds a key at a time.
//! With Sentinel or Cluster, replication is asynchronous: a failover right
//! after an acquire can lose the key and let a second issuer in. Treat the
//! lock as best-effort coordination in those deployments.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keyward_lock::LockManager;
//! use keyward_lock_redis::{RedisConfig, RedisLockBackend};
//!
//! let backend = RedisLockBackend::new(&RedisConfig::new("redis://localhost:6379"))?;
//! let locks = LockManager::new(Arc::new(backend));
//!
//! if let Some(handle) = locks.acquire("order:1", "worker-a", Duration::from_secs(30)).await? {
//!     // Critical section...
//!     locks.release(&handle).await;
//! }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use deadpool_redis::{Config, Pool, Runtime};
use redis::{AsyncCommands, Commands, Script};
use tokio::runtime::{Handle, RuntimeFlavor};

use keyward_lock::{
    EntryRemover, LockBackend, LockError, LockHandle, WeakLockHandle, expiry_after,
};

use crate::config::RedisConfig;
use crate::scripts;

/// `(code, ttl in milliseconds, stored value)` as returned by the acquire script.
type AcquireReply = (i64, i64, String);

/// One acquisition handed out by this process.
struct Issued {
    handle: WeakLockHandle,
    value: String,
}

impl Issued {
    /// The indexed handle, if it is still live and holds `value`.
    fn live(&self, value: &str) -> Option<LockHandle> {
        if self.value != value {
            return None;
        }
        self.handle.upgrade().filter(LockHandle::is_live)
    }
}

/// State shared by the backend and the handles it issues.
struct RedisShared {
    pool: Pool,
    client: redis::Client,
    prefix: String,
    timeout: Duration,
    acquire: Script,
    release: Script,
    issued: DashMap<String, Issued>,
}

impl RedisShared {
    /// Build the full Redis key for a lock.
    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }

    /// Obtain a connection from the pool.
    async fn conn(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))
    }

    /// Open a dedicated connection for a blocking operation.
    fn blocking_conn(&self) -> Result<redis::Connection, LockError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| LockError::Connection(e.to_string()))?;
        conn.set_read_timeout(Some(self.timeout))
            .and_then(|()| conn.set_write_timeout(Some(self.timeout)))
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(conn)
    }

    /// Stored value of `handle`'s acquisition, if `handle` is the one indexed
    /// for its key.
    fn value_of(&self, handle: &LockHandle) -> Option<String> {
        let issued = self.issued.get(handle.key())?;
        let indexed = issued.handle.upgrade()?;
        indexed.ptr_eq(handle).then(|| issued.value.clone())
    }

    /// Forget `handle` if it is the one indexed for its key.
    fn unindex(&self, handle: &LockHandle) {
        self.issued.remove_if(handle.key(), |_, issued| {
            issued.handle.upgrade().is_none_or(|h| h.ptr_eq(handle))
        });
    }

    fn settle_release(&self, handle: &LockHandle, deleted: i64) -> bool {
        if deleted == 0 {
            return false;
        }
        self.unindex(handle);
        true
    }
}

impl EntryRemover for RedisShared {
    fn remove_entry(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let Some(value) = self.value_of(handle) else {
            return Ok(false);
        };
        let deleted: i64 = run_blocking(|| {
            let mut conn = self.blocking_conn()?;
            self.release
                .key(self.lock_key(handle.key()))
                .arg(&value)
                .invoke(&mut conn)
                .map_err(backend_error)
        })?;
        Ok(self.settle_release(handle, deleted))
    }
}

/// Redis-backed implementation of [`LockBackend`].
///
/// See the [module-level documentation](self) for the consistency guarantees.
#[derive(Clone)]
pub struct RedisLockBackend {
    shared: Arc<RedisShared>,
}

impl RedisLockBackend {
    /// Create a new `RedisLockBackend` from the provided configuration.
    ///
    /// No connection is opened until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Connection`] if the URL is invalid or the pool
    /// cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, LockError> {
        let cfg = Config::from_url(&config.url);
        let pool = cfg
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connection_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| LockError::Connection(e.to_string()))?
            .map_err(|e| LockError::Connection(e.to_string()))?;
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| LockError::Connection(e.to_string()))?;

        Ok(Self {
            shared: Arc::new(RedisShared {
                pool,
                client,
                prefix: config.prefix.clone(),
                timeout: config.connection_timeout,
                acquire: Script::new(scripts::LOCK_ACQUIRE),
                release: Script::new(scripts::LOCK_RELEASE),
                issued: DashMap::new(),
            }),
        })
    }

    fn settle_acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
        reply: AcquireReply,
    ) -> Result<Option<LockHandle>, LockError> {
        match reply {
            (scripts::ACQUIRED, _, value) => Ok(Some(self.publish(key, issuer, ttl, value))),
            (scripts::REENTERED, pttl, value) => {
                // A key without expiry reports -1.
                let remaining = u64::try_from(pttl).map_or(Duration::MAX, Duration::from_millis);
                Ok(Some(self.publish(key, issuer, remaining, value)))
            }
            (scripts::DENIED, ..) => Ok(None),
            (code, ..) => Err(LockError::Backend(format!(
                "unexpected acquire reply code {code} for lock {key}"
            ))),
        }
    }

    /// Return the live handle this process holds for the stored `value`, or
    /// index a new one.
    ///
    /// Racing acquires of one issuer may settle in either order (the
    /// reentrant reply before the acquiring one), so both paths go through
    /// here and share whichever handle was published first.
    fn publish(&self, key: &str, issuer: &str, ttl: Duration, value: String) -> LockHandle {
        match self.shared.issued.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if let Some(held) = occupied.get().live(&value) {
                    return held;
                }
                let handle = self.new_handle(key, issuer, ttl);
                occupied.insert(Issued {
                    handle: handle.downgrade(),
                    value,
                });
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = self.new_handle(key, issuer, ttl);
                vacant.insert(Issued {
                    handle: handle.downgrade(),
                    value,
                });
                handle
            }
        }
    }

    fn new_handle(&self, key: &str, issuer: &str, ttl: Duration) -> LockHandle {
        let remover: Weak<RedisShared> = Arc::downgrade(&self.shared);
        LockHandle::new(key, issuer, expiry_after(ttl), remover)
    }

    fn settle_key_release(&self, key: &str, deleted: i64) -> bool {
        if let Some((_, issued)) = self.shared.issued.remove(key) {
            if let Some(handle) = issued.handle.upgrade() {
                handle.release_as_manager();
            }
        }
        deleted > 0
    }
}

fn backend_error(e: redis::RedisError) -> LockError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() {
        LockError::Connection(e.to_string())
    } else {
        LockError::Backend(e.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    // `SET ... PX 0` is rejected by Redis.
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Value to store for a new acquisition by `issuer`.
fn new_lock_value(issuer: &str) -> String {
    scripts::lock_value(&uuid::Uuid::new_v4().simple().to_string(), issuer)
}

/// Run synchronous store I/O, stepping off the async worker when called
/// from a multi-threaded Tokio runtime.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn blocking_acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let value = new_lock_value(issuer);
        let reply: AcquireReply = run_blocking(|| {
            let mut conn = self.shared.blocking_conn()?;
            self.shared
                .acquire
                .key(self.shared.lock_key(key))
                .arg(&value)
                .arg(issuer)
                .arg(ttl_millis(ttl))
                .invoke(&mut conn)
                .map_err(backend_error)
        })?;
        self.settle_acquire(key, issuer, ttl, reply)
    }

    fn blocking_release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        if handle.is_released() || !self.shared.remove_entry(handle)? {
            return Ok(false);
        }
        Ok(handle.release_as_manager())
    }

    fn blocking_release_key(&self, key: &str) -> Result<bool, LockError> {
        let deleted: i64 = run_blocking(|| {
            let mut conn = self.shared.blocking_conn()?;
            conn.del(self.shared.lock_key(key)).map_err(backend_error)
        })?;
        Ok(self.settle_key_release(key, deleted))
    }

    async fn acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let value = new_lock_value(issuer);
        let mut conn = self.shared.conn().await?;
        let reply: AcquireReply = self
            .shared
            .acquire
            .key(self.shared.lock_key(key))
            .arg(&value)
            .arg(issuer)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        self.settle_acquire(key, issuer, ttl, reply)
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        if handle.is_released() {
            return Ok(false);
        }
        let Some(value) = self.shared.value_of(handle) else {
            return Ok(false);
        };
        let mut conn = self.shared.conn().await?;
        let deleted: i64 = self
            .shared
            .release
            .key(self.shared.lock_key(handle.key()))
            .arg(&value)
            .invoke_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(self.shared.settle_release(handle, deleted) && handle.release_as_manager())
    }

    async fn release_key(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.shared.conn().await?;
        let deleted: i64 = conn
            .del(self.shared.lock_key(key))
            .await
            .map_err(backend_error)?;
        Ok(self.settle_key_release(key, deleted))
    }
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend")
            .field("prefix", &self.shared.prefix)
            .field("issued", &self.shared.issued.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    // Building the backend opens no connection, so reply handling can be
    // exercised without a server.
    fn backend() -> RedisLockBackend {
        RedisLockBackend::new(&RedisConfig::default()).expect("pool creation should succeed")
    }

    fn unreachable_backend() -> RedisLockBackend {
        RedisLockBackend::new(&RedisConfig {
            url: "redis://127.0.0.1:1".to_owned(),
            connection_timeout: Duration::from_millis(200),
            ..RedisConfig::default()
        })
        .expect("pool creation should succeed")
    }

    fn acquired(value: &str) -> AcquireReply {
        (scripts::ACQUIRED, 30_000, value.to_owned())
    }

    fn reentered(pttl: i64, value: &str) -> AcquireReply {
        (scripts::REENTERED, pttl, value.to_owned())
    }

    #[test]
    fn lock_keys_are_prefixed() {
        let backend = backend();
        assert_eq!(backend.shared.lock_key("order:1"), "keyward:lock:order:1");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let result = RedisLockBackend::new(&RedisConfig::new("not a url"));
        assert!(matches!(result, Err(LockError::Connection(_))));
    }

    #[test]
    fn ttl_is_sent_in_whole_positive_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn every_acquisition_stores_a_distinct_value() {
        let first = new_lock_value("A");
        let second = new_lock_value("A");
        assert_ne!(first, second);
        assert!(first.ends_with(":A"));
        assert_eq!(first.find(':'), Some(32));
    }

    #[test]
    fn acquired_reply_issues_and_indexes_a_handle() {
        let backend = backend();
        let handle = backend
            .settle_acquire("order:1", "A", TTL, acquired("t1:A"))
            .unwrap()
            .expect("acquired");
        assert_eq!(handle.key(), "order:1");
        assert_eq!(handle.issuer(), "A");
        assert!(handle.is_live());
        assert_eq!(backend.shared.value_of(&handle).as_deref(), Some("t1:A"));
    }

    #[test]
    fn reentered_reply_returns_the_local_handle() {
        let backend = backend();
        let first = backend
            .settle_acquire("order:1", "A", TTL, acquired("t1:A"))
            .unwrap()
            .unwrap();
        let again = backend
            .settle_acquire("order:1", "A", TTL * 2, reentered(29_000, "t1:A"))
            .unwrap()
            .unwrap();
        assert!(again.ptr_eq(&first));
    }

    #[test]
    fn reentry_settled_before_acquire_shares_one_handle() {
        let backend = backend();
        let reentered = backend
            .settle_acquire("k", "A", TTL, reentered(30_000, "t1:A"))
            .unwrap()
            .unwrap();
        let acquired = backend
            .settle_acquire("k", "A", TTL, acquired("t1:A"))
            .unwrap()
            .unwrap();

        assert!(acquired.ptr_eq(&reentered));
        assert_eq!(backend.shared.issued.len(), 1);
        assert!(backend.shared.value_of(&acquired).is_some());
    }

    #[test]
    fn reentry_of_another_processes_acquisition_gets_its_own_handle() {
        let backend = backend();
        let local = backend
            .settle_acquire("order:1", "A", Duration::ZERO, acquired("t1:A"))
            .unwrap()
            .unwrap();
        let remote = backend
            .settle_acquire("order:1", "A", TTL, reentered(1_000, "t2:A"))
            .unwrap()
            .unwrap();

        assert!(!remote.ptr_eq(&local));
        assert!(remote.expires_on() <= expiry_after(Duration::from_secs(1)));
        assert!(remote.is_live());
        assert!(backend.shared.value_of(&local).is_none());
    }

    #[test]
    fn reentered_reply_without_store_expiry_never_expires() {
        let backend = backend();
        let handle = backend
            .settle_acquire("order:1", "A", TTL, reentered(-1, "t1:A"))
            .unwrap()
            .unwrap();
        assert_eq!(handle.expires_on(), expiry_after(Duration::MAX));
    }

    #[test]
    fn denied_and_malformed_replies() {
        let backend = backend();
        let denied = (scripts::DENIED, 0, String::new());
        assert!(
            backend
                .settle_acquire("order:1", "B", TTL, denied)
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            backend.settle_acquire("order:1", "B", TTL, (7, 0, String::new())),
            Err(LockError::Backend(_))
        ));
    }

    #[test]
    fn key_release_disposes_the_local_handle() {
        let backend = backend();
        let handle = backend
            .settle_acquire("order:1", "A", TTL, acquired("t1:A"))
            .unwrap()
            .unwrap();

        assert!(backend.settle_key_release("order:1", 1));
        assert!(handle.is_released());
        assert!(backend.shared.issued.is_empty());

        assert!(!backend.settle_key_release("order:1", 0));
    }

    #[test]
    fn release_reply_unindexes_only_on_delete() {
        let backend = backend();
        let handle = backend
            .settle_acquire("order:1", "A", TTL, acquired("t1:A"))
            .unwrap()
            .unwrap();

        assert!(!backend.shared.settle_release(&handle, 0));
        assert_eq!(backend.shared.issued.len(), 1);
        assert!(backend.shared.settle_release(&handle, 1));
        assert!(backend.shared.issued.is_empty());
    }

    #[tokio::test]
    async fn superseded_handle_is_refused_without_store_io() {
        // Any store round trip would fail with a connection error.
        let backend = unreachable_backend();
        let stale = backend
            .settle_acquire("order:1", "A", Duration::ZERO, acquired("t1:A"))
            .unwrap()
            .unwrap();
        let fresh = backend
            .settle_acquire("order:1", "A", TTL, acquired("t2:A"))
            .unwrap()
            .unwrap();
        assert!(!fresh.ptr_eq(&stale));

        assert!(!backend.release(&stale).await.unwrap());
        assert!(!backend.blocking_release(&stale).unwrap());
        assert!(!stale.release_as_holder());

        // A late delete reply for the stale handle leaves the fresh one indexed.
        backend.shared.settle_release(&stale, 1);
        assert_eq!(backend.shared.value_of(&fresh).as_deref(), Some("t2:A"));
        assert!(fresh.is_live());
    }

    #[tokio::test]
    async fn unreachable_store_is_reported_as_connection_error() {
        let backend = unreachable_backend();

        let acquired = backend.acquire("order:1", "A", TTL).await;
        assert!(matches!(acquired, Err(LockError::Connection(_))));
        let acquired = backend.blocking_acquire("order:1", "A", TTL);
        assert!(matches!(acquired, Err(LockError::Connection(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guard_drop_inside_multi_thread_runtime_blocks_in_place() {
        let backend = unreachable_backend();
        let handle = backend
            .settle_acquire("order:1", "A", TTL, acquired("t1:A"))
            .unwrap()
            .unwrap();

        drop(handle.clone().into_guard());

        assert!(!handle.is_released(), "the store was unreachable");
        assert!(backend.shared.value_of(&handle).is_some());
    }
}
