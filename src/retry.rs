//! Retry with exponential backoff and jitter.
//!
//! Used by the controller client for transport failures. Errors the caller
//! classifies as permanent are returned on the first attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use log::{error, warn};
use rand::Rng;

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed since the first attempt
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_elapsed: Duration::from_secs(5 * 60),
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or `config.max_elapsed` runs out.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !is_transient(&err) {
            return Err(err);
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        if started.elapsed() + jittered_delay > config.max_elapsed {
            error!(
                "{} failed after {} attempts, giving up: {}",
                operation_name, attempt, err
            );
            return Err(err);
        }

        warn!(
            "{} failed (attempt {}), retrying in {}ms: {}",
            operation_name,
            attempt,
            jittered_delay.as_millis(),
            err
        );

        tokio::time::sleep(jittered_delay).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_with_backoff(&fast(), "op", |_| true, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, &str> = retry_with_backoff(&fast(), "op", |_| true, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), &str> = retry_with_backoff(
            &fast(),
            "op",
            |e: &&str| *e != "404 Not Found",
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("404 Not Found") }
            },
        )
        .await;
        assert_eq!(result, Err("404 Not Found"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_elapsed() {
        let config = RetryConfig {
            max_elapsed: Duration::from_millis(30),
            ..fast()
        };
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), &str> = retry_with_backoff(&config, "op", |_| true, || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err("timeout") }
        })
        .await;
        assert_eq!(result, Err("timeout"));
        assert!(count.load(Ordering::SeqCst) > 1);
    }
}
