use thiserror::Error;

/// Errors from lock backends and the lock manager.
///
/// Only [`LockError::InvalidKey`] ever reaches callers of
/// [`LockManager`](crate::LockManager); the other variants are logged at the
/// manager boundary and reported as "not acquired" or "not released".
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock key must not be empty")]
    InvalidKey,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            LockError::InvalidKey.to_string(),
            "lock key must not be empty"
        );
        assert_eq!(
            LockError::Connection("refused".into()).to_string(),
            "connection error: refused"
        );
    }
}
