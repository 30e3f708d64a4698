//! Lock handles and their release protocol.
//!
//! A [`LockHandle`] is created by a backend inside a successful acquire and
//! represents exclusive ownership of one key. It can be released along two
//! paths:
//!
//! - **holder path** ([`LockHandle::release_as_holder`]): the caller that owns
//!   the handle gives it up. The handle asks its backend to remove the entry and
//!   then marks itself released.
//! - **manager path** ([`LockHandle::release_as_manager`]): the backend has
//!   already removed the entry (owner release through the manager, or an
//!   administrative release by key) and only asks the handle to mark itself
//!   released.
//!
//! Both paths are idempotent and the release notification fires at most once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::LockError;

/// Event delivered to release listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockReleased {
    pub key: String,
    pub issuer: String,
}

type ReleaseListener = Box<dyn FnOnce(&LockReleased) + Send>;

/// Removal primitive a backend exposes to the handles it issues.
///
/// Handles keep only a weak reference to their remover, so a table of handles
/// never keeps itself alive.
pub trait EntryRemover: Send + Sync {
    /// Atomically remove the entry for `handle.key()` if it still belongs to
    /// `handle`. Returns `true` if an entry was removed.
    fn remove_entry(&self, handle: &LockHandle) -> Result<bool, LockError>;
}

struct HandleState {
    key: String,
    issuer: String,
    expires_on: DateTime<Utc>,
    released: AtomicBool,
    releasing: AtomicBool,
    listeners: Mutex<Vec<ReleaseListener>>,
    remover: Weak<dyn EntryRemover>,
}

/// One successful acquisition of a key.
///
/// Cloning is cheap and every clone refers to the same acquisition; a
/// reentrant acquire by the same issuer hands out another clone of the handle
/// that is already held.
#[derive(Clone)]
pub struct LockHandle {
    state: Arc<HandleState>,
}

impl LockHandle {
    /// Create a handle for `key` owned by `issuer`.
    ///
    /// Only backends create handles, from inside their atomic acquire.
    pub fn new(
        key: impl Into<String>,
        issuer: impl Into<String>,
        expires_on: DateTime<Utc>,
        remover: Weak<dyn EntryRemover>,
    ) -> Self {
        Self {
            state: Arc::new(HandleState {
                key: key.into(),
                issuer: issuer.into(),
                expires_on,
                released: AtomicBool::new(false),
                releasing: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                remover,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.state.key
    }

    /// The issuer token that owns this lock.
    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.state.expires_on
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.state.expires_on
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    /// Neither released nor expired.
    pub fn is_live(&self) -> bool {
        !self.is_released() && !self.is_expired()
    }

    /// Whether both handles refer to the same acquisition.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn downgrade(&self) -> WeakLockHandle {
        WeakLockHandle {
            state: Arc::downgrade(&self.state),
        }
    }

    /// Register a one-shot listener for the release of this lock.
    ///
    /// The listener runs once, on the thread that completes the release, and
    /// is dropped afterwards. Returns `false` without registering when the
    /// lock has already been released.
    pub fn on_released<F>(&self, listener: F) -> bool
    where
        F: FnOnce(&LockReleased) + Send + 'static,
    {
        let mut listeners = self.listeners();
        if self.is_released() {
            return false;
        }
        listeners.push(Box::new(listener));
        true
    }

    /// Release this lock as its holder.
    ///
    /// Removes the backend entry if it still belongs to this handle, then
    /// marks the handle released and notifies listeners. Returns `true` only
    /// for the call that performed the release. Calls made while a release of
    /// this handle is already in progress (for example from a listener) return
    /// `false` without touching the backend.
    pub fn release_as_holder(&self) -> bool {
        if self.is_released() {
            return false;
        }
        if self.state.releasing.swap(true, Ordering::AcqRel) {
            return false;
        }

        let removed = match self.state.remover.upgrade() {
            Some(remover) => match remover.remove_entry(self) {
                Ok(removed) => removed,
                Err(e) => {
                    warn!(key = %self.key(), error = %e, "lock release failed");
                    false
                }
            },
            None => false,
        };

        let released = removed && self.mark_released();
        self.state.releasing.store(false, Ordering::Release);
        released
    }

    /// Mark this lock released after its backend entry has been removed.
    ///
    /// Backends call this once their own atomic removal succeeded; the handle
    /// does not go back to the backend. Returns `true` only for the call that
    /// performed the release.
    pub fn release_as_manager(&self) -> bool {
        let nested = self.state.releasing.swap(true, Ordering::AcqRel);
        let released = self.mark_released();
        if !nested {
            self.state.releasing.store(false, Ordering::Release);
        }
        released
    }

    /// Wrap the handle in a guard that releases it when dropped.
    ///
    /// The release runs synchronously on the dropping thread. With a remote
    /// backend that is a store round trip; in async code prefer releasing
    /// through [`LockManager::release`](crate::LockManager::release).
    pub fn into_guard(self) -> LockGuard {
        LockGuard { handle: self }
    }

    fn mark_released(&self) -> bool {
        if self
            .state
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let listeners = std::mem::take(&mut *self.listeners());
        if !listeners.is_empty() {
            let event = LockReleased {
                key: self.state.key.clone(),
                issuer: self.state.issuer.clone(),
            };
            for listener in listeners {
                listener(&event);
            }
        }
        true
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<ReleaseListener>> {
        self.state
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.state.key)
            .field("issuer", &self.state.issuer)
            .field("expires_on", &self.state.expires_on)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// Non-owning reference to a [`LockHandle`].
#[derive(Clone, Default)]
pub struct WeakLockHandle {
    state: Weak<HandleState>,
}

impl WeakLockHandle {
    pub fn upgrade(&self) -> Option<LockHandle> {
        self.state.upgrade().map(|state| LockHandle { state })
    }
}

impl fmt::Debug for WeakLockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakLockHandle")
    }
}

/// Scoped ownership of a lock: releases it as holder when dropped.
///
/// Dropping the guard calls [`LockHandle::release_as_holder`], which blocks
/// until the backend has removed the entry.
#[must_use = "dropping the guard releases the lock immediately"]
#[derive(Debug)]
pub struct LockGuard {
    handle: LockHandle,
}

impl LockGuard {
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Release now instead of at the end of the scope.
    pub fn release(self) -> bool {
        self.handle.release_as_holder()
    }
}

impl std::ops::Deref for LockGuard {
    type Target = LockHandle;

    fn deref(&self) -> &LockHandle {
        &self.handle
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.handle.release_as_holder();
    }
}

/// Absolute expiry for a lock acquired now with the given TTL.
///
/// Saturates at the maximum representable timestamp.
pub fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Remover that answers with a fixed outcome and counts calls.
    struct CountingRemover {
        calls: AtomicUsize,
        outcome: Result<bool, ()>,
    }

    impl CountingRemover {
        fn new(outcome: Result<bool, ()>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EntryRemover for CountingRemover {
        fn remove_entry(&self, _handle: &LockHandle) -> Result<bool, LockError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .map_err(|()| LockError::Connection("store unreachable".into()))
        }
    }

    fn handle_with(remover: &Arc<CountingRemover>) -> LockHandle {
        let weak: Weak<CountingRemover> = Arc::downgrade(remover);
        LockHandle::new("order:1", "A", expiry_after(Duration::from_secs(60)), weak)
    }

    #[test]
    fn holder_release_is_idempotent() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        assert!(handle.on_released(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(handle.release_as_holder());
        assert!(!handle.release_as_holder());
        assert!(handle.is_released());
        assert_eq!(remover.calls(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_receives_key_and_issuer() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        handle.on_released(move |event| sink.lock().unwrap().push(event.clone()));

        handle.release_as_holder();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![LockReleased {
                key: "order:1".into(),
                issuer: "A".into(),
            }]
        );
    }

    #[test]
    fn failed_removal_leaves_handle_held() {
        let remover = CountingRemover::new(Ok(false));
        let handle = handle_with(&remover);

        assert!(!handle.release_as_holder());
        assert!(!handle.is_released());
        // Not latched: a later attempt goes back to the backend.
        assert!(!handle.release_as_holder());
        assert_eq!(remover.calls(), 2);
    }

    #[test]
    fn backend_error_is_reported_as_not_released() {
        let remover = CountingRemover::new(Err(()));
        let handle = handle_with(&remover);
        assert!(!handle.release_as_holder());
        assert!(!handle.is_released());
    }

    #[test]
    fn dropped_backend_cannot_release() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        drop(remover);
        assert!(!handle.release_as_holder());
        assert!(!handle.is_released());
    }

    #[test]
    fn manager_release_does_not_touch_backend() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);

        assert!(handle.release_as_manager());
        assert!(!handle.release_as_manager());
        assert!(!handle.release_as_holder());
        assert_eq!(remover.calls(), 0);
    }

    #[test]
    fn listener_release_during_manager_release_is_suppressed() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        let inner = handle.clone();
        let nested = Arc::new(AtomicBool::new(true));
        let nested_result = Arc::clone(&nested);
        handle.on_released(move |_| {
            nested_result.store(inner.release_as_holder(), Ordering::SeqCst);
        });

        assert!(handle.release_as_manager());
        assert!(!nested.load(Ordering::SeqCst));
        assert_eq!(remover.calls(), 0);
    }

    #[test]
    fn registering_after_release_is_rejected() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        handle.release_as_holder();
        assert!(!handle.on_released(|_| panic!("must not fire")));
    }

    #[test]
    fn guard_releases_on_drop() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        {
            let guard = handle.clone().into_guard();
            assert_eq!(guard.key(), "order:1");
            assert!(!guard.is_released());
        }
        assert!(handle.is_released());
        assert_eq!(remover.calls(), 1);
    }

    #[test]
    fn explicit_guard_release_then_drop_releases_once() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        let guard = handle.clone().into_guard();
        assert!(guard.release());
        assert_eq!(remover.calls(), 1);
    }

    #[test]
    fn expiry_is_evaluated_lazily() {
        let remover = CountingRemover::new(Ok(true));
        let weak: Weak<CountingRemover> = Arc::downgrade(&remover);
        let handle = LockHandle::new("k", "", expiry_after(Duration::ZERO), weak);
        assert!(handle.is_expired());
        assert!(!handle.is_live());
        assert!(!handle.is_released());
        assert_eq!(handle.issuer(), "");
    }

    #[test]
    fn expiry_saturates_for_huge_ttl() {
        assert_eq!(expiry_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn weak_handle_upgrades_to_same_acquisition() {
        let remover = CountingRemover::new(Ok(true));
        let handle = handle_with(&remover);
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some_and(|h| h.ptr_eq(&handle)));
        drop(handle);
        assert!(weak.upgrade().is_none());
    }
}
