use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay uniformly over `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `failures` (1 after the first failure).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()));

        if self.jitter && !capped.is_zero() {
            let half = capped / 2;
            let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(spread)
        } else {
            capped
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or `max_attempts` is used up. The last error is returned as-is.
pub async fn retry_with_exponential_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Operation succeeded on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(e) if !is_transient(&e) => {
                debug!("Attempt {} failed with non-transient error, not retrying: {}", attempt, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!("Operation failed after {} attempts: {}", max_attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                debug!("Attempt {} failed transiently, retrying in {:?}: {}", attempt, delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
