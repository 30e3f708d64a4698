//! Redis lock backend for Keyward.
//!
//! This crate provides a Redis-backed implementation of the [`LockBackend`]
//! trait from `keyward-lock`, so locks are shared by every process that talks
//! to the same Redis.
//!
//! - **Atomic acquire**: `SET NX PX` and the reentrancy check run in one Lua
//!   script.
//! - **Owner-checked release**: the key is deleted only if its value is still
//!   the releasing issuer.
//! - **Connection pooling**: async operations use `deadpool-redis`; blocking
//!   operations open a dedicated connection with the configured timeout.
//!
//! See [`lock`] module documentation for consistency guarantees.
//!
//! [`LockBackend`]: keyward_lock::LockBackend

mod config;
pub mod lock;
mod scripts;

pub use config::RedisConfig;
pub use lock::RedisLockBackend;
