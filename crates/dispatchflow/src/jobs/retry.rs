use std::future::Future;
use std::time::Duration;

use crate::jobs::error::StoreError;

/// Bounded, fixed-delay retry for store operations that lose a lock race.
#[derive(Debug, Clone)]
pub struct ContentionPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

// serialization_failure, deadlock_detected, lock_not_available
const CONTENTION_SQLSTATES: [&str; 3] = ["40001", "40P01", "55P03"];

pub fn classify_db_error(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::PoolTimedOut => ErrorClass::Retryable,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if CONTENTION_SQLSTATES.contains(&&*code) => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        },
        _ => ErrorClass::NonRetryable,
    }
}

/// Runs `op` until it succeeds, fails with a non-contention error, or the
/// policy runs out of attempts.
pub async fn retry_on_contention<T, F, Fut>(
    policy: &ContentionPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Database(e)) if classify_db_error(&e) == ErrorClass::Retryable => {
                if attempt >= max_attempts {
                    return Err(StoreError::Contended {
                        operation,
                        attempts: attempt,
                    });
                }
                tracing::debug!(operation, attempt, error = %e, "store contended, backing off");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
