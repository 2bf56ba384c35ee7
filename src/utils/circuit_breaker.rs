use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Either the breaker refused the call or the call itself failed.
#[derive(Debug)]
pub enum BreakerError<E> {
    Open,
    Inner(E),
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Stops hammering a dependency after consecutive failures, then lets a
/// probe through once `timeout` has passed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub async fn execute<F, T, E, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == CircuitState::Open {
                let cooled = inner
                    .last_failure_time
                    .map(|t| t.elapsed() > self.config.timeout)
                    .unwrap_or(false);
                if !cooled {
                    return Err(BreakerError::Open);
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                info!("Circuit breaker '{}' half-open after timeout", self.name);
            }
        }

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure().await;
                Err(BreakerError::Inner(e))
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    info!("Circuit breaker '{}' closed again", self.name);
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            warn!(
                "Circuit breaker '{}' opening after {} failures",
                self.name, inner.failure_count
            );
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                success_threshold: 1,
                timeout: Duration::from_secs(30),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker(2);
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner("boom"))));
        assert_eq!(b.get_state().await, CircuitState::Closed);
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner("boom"))));
        assert_eq!(b.get_state().await, CircuitState::Open);

        let refused = b.execute(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(refused, Err(BreakerError::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let b = breaker(1);
        let _ = fail(&b).await;
        assert_eq!(b.get_state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let probe = b.execute(|| async { Ok::<_, &str>("ok") }).await;
        assert!(matches!(probe, Ok("ok")));
        assert_eq!(b.get_state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(2);
        let _ = fail(&b).await;
        let _ = b.execute(|| async { Ok::<_, &str>(()) }).await;
        let _ = fail(&b).await;
        assert_eq!(b.get_state().await, CircuitState::Closed);
    }
}
