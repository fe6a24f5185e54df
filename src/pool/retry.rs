use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize each wait within `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
    pub total_time: Duration,
}

/// Delay before retrying after failed attempt `attempt` (1-indexed), before
/// jitter: `min(max_delay, initial_delay * multiplier^(attempt - 1))`.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let millis = config.initial_delay.as_millis() as f64 * config.backoff_multiplier.powi(exponent);
    let capped = millis.min(config.max_delay.as_millis() as f64);
    if capped.is_finite() && capped > 0.0 {
        Duration::from_millis(capped as u64)
    } else {
        Duration::ZERO
    }
}

fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let millis = thread_rng().gen_range(0..=delay.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Runs `operation` until it succeeds, `is_retryable` rejects the error, or
/// `max_attempts` is exhausted; the last error is returned as-is.
///
/// `on_retry(attempt, &error, delay)` fires before each wait, never after the
/// final failed attempt. Waiting only suspends the calling task.
pub async fn with_retry<T, E, Op, Fut, R, N>(
    config: &RetryConfig,
    mut operation: Op,
    is_retryable: R,
    mut on_retry: N,
) -> Result<RetryOutcome<T>, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    N: FnMut(u32, &E, Duration),
{
    let started = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                return Ok(RetryOutcome {
                    result,
                    attempts: attempt,
                    total_time: started.elapsed(),
                })
            }
            Err(e) => {
                if attempt >= max_attempts || !is_retryable(&e) {
                    return Err(e);
                }

                let mut delay = backoff_delay(attempt, config);
                if config.jitter {
                    delay = jittered(delay);
                }
                on_retry(attempt, &e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
