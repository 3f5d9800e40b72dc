//! Single delayed retry for calls the backend rejects while a resource is busy
//!
//! Network topology changes lock the load balancer for a short while after
//! creation and other network actions. Only `conflict` and `locked` are
//! retried, exactly once. The delay is a plain sleep; dropping the calling
//! future cancels it along with everything else.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, ErrorCode, Result};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub fn is_transient(err: &Error) -> bool {
    err.has_code(&[ErrorCode::Conflict, ErrorCode::Locked])
}

/// Run `operation`, retrying it once after `delay` on a transient error
pub async fn retry_once<F, Fut, T>(operation_name: &str, delay: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Err(e) if is_transient(&e) => {
            warn!(
                operation = %operation_name,
                error = %e,
                ?delay,
                "Backend busy, retrying once"
            );
            tokio::time::sleep(delay).await;
            operation().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cloud_error(code: ErrorCode) -> Error {
        Error::CloudApi {
            code,
            message: "busy".to_string(),
        }
    }

    async fn run(failures: Vec<ErrorCode>) -> (Result<u32>, u32) {
        let attempts = AtomicU32::new(0);
        let failures = std::sync::Mutex::new(failures);
        let (attempts_ref, failures_ref) = (&attempts, &failures);
        let res = retry_once("attach", Duration::from_millis(1), move || async move {
            let n = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let mut failures = failures_ref.lock().unwrap();
            if failures.is_empty() {
                Ok(n)
            } else {
                Err(cloud_error(failures.remove(0)))
            }
        })
        .await;
        (res, attempts.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_success_needs_one_attempt() {
        let (res, attempts) = run(vec![]).await;
        assert_eq!(res.unwrap(), 1);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_locked_is_retried_once() {
        let (res, attempts) = run(vec![ErrorCode::Locked]).await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let (res, attempts) = run(vec![ErrorCode::Conflict, ErrorCode::Locked]).await;
        assert!(res.unwrap_err().has_code(&[ErrorCode::Locked]));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (res, attempts) = run(vec![ErrorCode::RateLimitExceeded]).await;
        assert!(res.is_err());
        assert_eq!(attempts, 1);
    }
}
