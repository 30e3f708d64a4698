//! Backend registration for Keyward.
//!
//! Turns a [`KeywardConfig`] into the single [`LockManager`](keyward_lock::LockManager)
//! a process uses. The `keyward` binary in this crate is a thin command-line
//! front end over it.

pub mod config;
pub mod error;
pub mod factory;

pub use config::{KeywardConfig, LockConfig};
pub use error::CliError;
pub use factory::create_lock_manager;
