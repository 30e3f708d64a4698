//! In-process lock backend for Keyward.
//!
//! Locks live in a concurrent map owned by one process, so this backend only
//! provides mutual exclusion between threads and tasks of that process.

mod lock;

pub use lock::MemoryLockBackend;
