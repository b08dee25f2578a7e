use kafkademo_retry::error::RetryError;
use kafkademo_retry::policy::RetryConfig;
use kafkademo_retry::retry::{with_retry, with_retry_if};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_retry_succeeds_on_first_attempt() {
    let config = RetryConfig::new(3);
    let result: Result<&str, RetryError<String>> =
        with_retry(&config, || async { Ok("success") }).await;
    assert_eq!(result.unwrap(), "success");
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);

    let counter_clone = counter.clone();
    let result: Result<&str, RetryError<String>> = with_retry(&config, move || {
        let c = counter_clone.clone();
        async move {
            let attempt = c.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err("not yet".to_string())
            } else {
                Ok("success")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "success");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhausted() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);

    let counter_clone = counter.clone();
    let result: Result<&str, RetryError<String>> = with_retry(&config, move || {
        counter_clone.fetch_add(1, Ordering::SeqCst);
        async { Err("always fails".to_string()) }
    })
    .await;

    match result {
        Err(RetryError::ExhaustedRetries {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "always fails");
        }
        _ => panic!("ExhaustedRetries エラーが期待される"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_if_stops_on_non_retryable() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new(5)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false);

    let counter_clone = counter.clone();
    let result: Result<(), RetryError<String>> = with_retry_if(
        &config,
        move || {
            let attempt = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("timeout".to_string())
                } else {
                    Err("message too large".to_string())
                }
            }
        },
        |e| e.as_str() == "timeout",
    )
    .await;

    match result {
        Err(RetryError::NonRetryable { attempts, error }) => {
            assert_eq!(attempts, 2);
            assert_eq!(error, "message too large");
        }
        _ => panic!("NonRetryable エラーが期待される"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unlimited_retry_keeps_going_until_success() {
    let counter = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::unlimited()
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(2))
        .with_jitter(false);

    let counter_clone = counter.clone();
    let result: Result<u32, RetryError<String>> = with_retry(&config, move || {
        let attempt = counter_clone.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 10 {
                Err(format!("attempt {attempt}"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 10);
}

#[test]
fn test_compute_delay_exponential() {
    let config = RetryConfig::new(5)
        .with_initial_delay(Duration::from_millis(100))
        .with_multiplier(2.0)
        .with_max_delay(Duration::from_secs(30))
        .with_jitter(false);

    assert_eq!(config.compute_delay(0).as_millis(), 100);
    assert_eq!(config.compute_delay(1).as_millis(), 200);
    assert_eq!(config.compute_delay(2).as_millis(), 400);
}

#[test]
fn test_compute_delay_respects_cap() {
    let config = RetryConfig::new(10)
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(500))
        .with_jitter(false);

    // 100 * 2^3 = 800 は上限 500 に切り詰められる
    assert_eq!(config.compute_delay(3).as_millis(), 500);
}
