//! Named, issuer-owned locks with a time-to-live.
//!
//! This crate defines the pieces every Keyward backend shares:
//!
//! - [`LockHandle`]: one successful acquisition, with its release protocol and
//!   one-shot release notification.
//! - [`LockBackend`]: the atomic acquire/release contract a backend implements.
//! - [`LockManager`]: the facade callers use. It validates keys and turns
//!   backend failures into "not acquired" / "not released".
//! - [`derive_key`]: builds a key from a value and one of its fields.
//!
//! Backends live in their own crates (`keyward-lock-memory`,
//! `keyward-lock-redis`) and are checked against [`testing`].

pub mod backend;
pub mod error;
pub mod handle;
pub mod key;
pub mod manager;
pub mod testing;

pub use backend::LockBackend;
pub use error::LockError;
pub use handle::{
    EntryRemover, LockGuard, LockHandle, LockReleased, WeakLockHandle, expiry_after,
};
pub use key::derive_key;
pub use manager::LockManager;
