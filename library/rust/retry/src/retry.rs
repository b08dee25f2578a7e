use crate::error::RetryError;
use crate::policy::RetryConfig;
use std::future::Future;

/// すべてのエラーを一時的なものとみなして再試行する。
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(config, operation, |_| true).await
}

/// `is_retryable` が false を返したエラーでは即座に中断する。
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let attempts = attempt.saturating_add(1);
                if !is_retryable(&e) {
                    return Err(RetryError::NonRetryable { attempts, error: e });
                }
                match config.max_attempts {
                    Some(max) => tracing::warn!("リトライ試行 {}/{}: {}", attempts, max, e),
                    None => tracing::warn!("リトライ試行 {}: {}", attempts, e),
                }
                if !config.allows_attempt(attempts) {
                    return Err(RetryError::ExhaustedRetries {
                        attempts,
                        last_error: e,
                    });
                }
                tokio::time::sleep(config.compute_delay(attempt)).await;
                attempt = attempts;
            }
        }
    }
}
