use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::LockError;
use crate::handle::{LockHandle, LockReleased};
use crate::manager::LockManager;

const TTL: Duration = Duration::from_secs(5);

/// Run the full lock conformance test suite against a manager.
///
/// Call this from your backend's test module with a manager over a fresh
/// backend instance.
///
/// # Errors
///
/// Returns an error if a usage error is reported where none was expected.
pub async fn run_lock_conformance_tests(manager: &LockManager) -> Result<(), LockError> {
    test_acquire_and_contention(manager).await?;
    test_reentrant_acquire(manager).await?;
    test_release_is_idempotent(manager).await?;
    test_release_then_reacquire(manager).await?;
    test_release_by_key(manager).await?;
    test_release_notification(manager).await?;
    test_release_by_key_disposes_handle(manager).await?;
    test_release_missing_key(manager).await?;
    test_holder_release(manager).await?;
    test_blocking_forms(manager)?;
    test_empty_key(manager).await;
    test_derived_key(manager).await?;
    Ok(())
}

fn expect_handle(handle: Option<LockHandle>, what: &str) -> LockHandle {
    match handle {
        Some(handle) => handle,
        None => panic!("{what}: expected a lock handle"),
    }
}

/// Count notifications and record their payloads.
fn record_releases(handle: &LockHandle) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<LockReleased>>>) {
    let count = Arc::new(AtomicUsize::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));
    let (c, e) = (Arc::clone(&count), Arc::clone(&events));
    let registered = handle.on_released(move |event| {
        c.fetch_add(1, Ordering::SeqCst);
        e.lock().unwrap().push(event.clone());
    });
    assert!(registered, "listener should register on a held lock");
    (count, events)
}

async fn test_acquire_and_contention(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:contention";
    let held = expect_handle(manager.acquire(key, "A", TTL).await?, "uncontested acquire");
    assert_eq!(held.key(), key);
    assert_eq!(held.issuer(), "A");
    assert!(held.is_live());

    let other = manager.acquire(key, "B", TTL).await?;
    assert!(other.is_none(), "second issuer must not acquire a held lock");

    assert!(manager.release(&held).await);
    Ok(())
}

async fn test_reentrant_acquire(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:reentrant";
    let first = expect_handle(manager.acquire(key, "A", TTL).await?, "first acquire");
    let again = expect_handle(
        manager.acquire(key, "A", TTL * 2).await?,
        "reentrant acquire",
    );
    assert!(again.ptr_eq(&first), "reentrant acquire returns the held lock");
    assert_eq!(
        again.expires_on(),
        first.expires_on(),
        "reentrant acquire does not refresh the TTL"
    );

    assert!(manager.acquire(key, "B", TTL).await?.is_none());

    assert!(manager.release(&again).await);
    assert!(first.is_released());
    Ok(())
}

async fn test_release_is_idempotent(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:idempotent";
    let handle = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire");
    let (count, _) = record_releases(&handle);

    assert!(manager.release(&handle).await, "first release succeeds");
    assert!(!manager.release(&handle).await, "second release is a no-op");
    assert!(!manager.blocking_release(&handle));
    assert!(!handle.release_as_holder());
    assert!(handle.is_released());
    assert_eq!(count.load(Ordering::SeqCst), 1, "notification fires once");
    Ok(())
}

async fn test_release_then_reacquire(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:reacquire";
    let first = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire by A");
    assert!(manager.release(&first).await);

    let second = expect_handle(
        manager.acquire(key, "B", TTL).await?,
        "acquire by B after release",
    );
    assert!(!second.ptr_eq(&first));

    // A stale handle must not release the new owner's lock.
    assert!(!manager.release(&first).await);
    assert!(manager.acquire(key, "C", TTL).await?.is_none());

    assert!(manager.release(&second).await);
    Ok(())
}

async fn test_release_by_key(manager: &LockManager) -> Result<(), LockError> {
    let key = "order:1";
    let h1 = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire by A");
    assert!(manager.acquire(key, "B", TTL).await?.is_none());

    assert!(manager.release_key(key).await?, "key release removes the lock");

    let h2 = expect_handle(
        manager.acquire(key, "B", TTL).await?,
        "acquire by B after key release",
    );
    assert!(!h2.ptr_eq(&h1));
    assert!(manager.release(&h2).await);
    Ok(())
}

async fn test_release_notification(manager: &LockManager) -> Result<(), LockError> {
    let key = "order:2";
    let handle = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire");
    let (count, events) = record_releases(&handle);

    assert!(manager.release(&handle).await);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec![LockReleased {
            key: key.to_owned(),
            issuer: "A".to_owned(),
        }]
    );
    Ok(())
}

async fn test_release_by_key_disposes_handle(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:force";
    let handle = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire");
    let (count, _) = record_releases(&handle);

    assert!(manager.release_key(key).await?);
    assert!(handle.is_released());
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert!(!manager.release(&handle).await);
    assert!(!manager.release_key(key).await?);
    Ok(())
}

async fn test_release_missing_key(manager: &LockManager) -> Result<(), LockError> {
    assert!(!manager.release_key("conformance:never-held").await?);
    Ok(())
}

async fn test_holder_release(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:holder";
    let handle = expect_handle(manager.acquire(key, "A", TTL).await?, "acquire");
    let (count, _) = record_releases(&handle);

    {
        let _guard = handle.clone().into_guard();
    }
    assert!(handle.is_released(), "dropping the guard releases the lock");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let next = expect_handle(
        manager.acquire(key, "B", TTL).await?,
        "acquire after holder release",
    );
    assert!(next.release_as_holder());
    Ok(())
}

fn test_blocking_forms(manager: &LockManager) -> Result<(), LockError> {
    let key = "conformance:blocking";
    let held = expect_handle(manager.blocking_acquire(key, "A", TTL)?, "blocking acquire");
    assert!(manager.blocking_acquire(key, "B", TTL)?.is_none());
    let again = expect_handle(
        manager.blocking_acquire(key, "A", TTL)?,
        "blocking reentrant acquire",
    );
    assert!(again.ptr_eq(&held));

    assert!(manager.blocking_release(&held));
    assert!(!manager.blocking_release(&held));
    Ok(())
}

async fn test_empty_key(manager: &LockManager) {
    assert!(matches!(
        manager.acquire("", "A", TTL).await,
        Err(LockError::InvalidKey)
    ));
    assert!(matches!(
        manager.release_key("").await,
        Err(LockError::InvalidKey)
    ));
}

struct Invoice {
    number: u32,
}

async fn test_derived_key(manager: &LockManager) -> Result<(), LockError> {
    let invoice = Invoice { number: 7 };
    let handle = expect_handle(
        manager
            .acquire_for(&invoice, TTL, |i| i.number, "A")
            .await?,
        "derived-key acquire",
    );
    assert_eq!(handle.key(), "Invoice:7");

    let denied = manager.blocking_acquire_for(&invoice, TTL, |i| i.number, "B")?;
    assert!(denied.is_none());

    assert!(manager.release(&handle).await);
    Ok(())
}
