use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use keyward_lock::{EntryRemover, LockBackend, LockError, LockHandle, expiry_after};

/// Key to handle table shared by a backend and the handles it issues.
#[derive(Debug, Default)]
struct LockTable {
    locks: DashMap<String, LockHandle>,
}

impl EntryRemover for LockTable {
    fn remove_entry(&self, handle: &LockHandle) -> Result<bool, LockError> {
        Ok(self
            .locks
            .remove_if(handle.key(), |_, held| held.ptr_eq(handle))
            .is_some())
    }
}

/// In-memory [`LockBackend`] backed by a [`DashMap`].
///
/// Every acquire runs inside a single `entry` call, so the shard lock is the
/// only arbiter between racing acquirers. Expiry is lazy: nothing sweeps the
/// table, but an expired entry is replaced by the next acquire of its key,
/// whoever the issuer. The replaced handle is not marked released.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockBackend {
    table: Arc<LockTable>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the table, expired ones included.
    pub fn len(&self) -> usize {
        self.table.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.locks.is_empty()
    }

    fn issue(&self, key: &str, issuer: &str, ttl: Duration) -> LockHandle {
        let remover: Weak<LockTable> = Arc::downgrade(&self.table);
        LockHandle::new(key, issuer, expiry_after(ttl), remover)
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn blocking_acquire(
        &self,
        key: &str,
        issuer: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        // The replaced handle is dropped after the shard lock is released.
        let (acquired, _stale) = match self.table.locks.entry(key.to_owned()) {
            Entry::Vacant(vacant) => {
                let handle = self.issue(key, issuer, ttl);
                vacant.insert(handle.clone());
                (Some(handle), None)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    let handle = self.issue(key, issuer, ttl);
                    let stale = occupied.insert(handle.clone());
                    (Some(handle), Some(stale))
                } else if occupied.get().issuer() == issuer {
                    (Some(occupied.get().clone()), None)
                } else {
                    (None, None)
                }
            }
        };
        Ok(acquired)
    }

    fn blocking_release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        if self.table.remove_entry(handle)? {
            Ok(handle.release_as_manager())
        } else {
            Ok(false)
        }
    }

    fn blocking_release_key(&self, key: &str) -> Result<bool, LockError> {
        match self.table.locks.remove(key) {
            Some((_, handle)) => {
                let live = !handle.is_expired();
                Ok(handle.release_as_manager() && live)
            }
            None => Ok(false),
        }
    }
}
