//! Retry glue shared by every mutating operation.

use crate::errors::{Error, Result};
use std::{future::Future, time::Duration};
use tracing::warn;

/// Runs `operation`, re-running it from scratch while it fails with
/// [`Error::StoreConflict`], up to `attempts` times in total.
///
/// Each run must be a complete atomic unit (its own store transaction), so a
/// retry never observes a half-applied previous attempt.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(Error::StoreConflict { message }) if attempt < attempts => {
                warn!(operation = name, attempt, %message, "Store conflict, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_conflicts_are_retried_until_success() -> Result<()> {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_on_conflict(3, "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::StoreConflict {
                    message: "database is locked".to_string(),
                })
            } else {
                Ok(7)
            }
        })
        .await?;
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_last_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_conflict(2, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::StoreConflict {
                message: "deadlock detected".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::StoreConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_conflict(5, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidAmount { amount: 0 })
        })
        .await;
        assert!(matches!(result, Err(Error::InvalidAmount { amount: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
