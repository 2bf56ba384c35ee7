//! Rolling-window send limiter, one per channel.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Admits at most `max_sends` sends in any window of `window` length.
///
/// Runs on tokio's clock so tests can drive it with a paused runtime.
#[derive(Debug)]
pub struct RateLimiter {
    max_sends: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_sends: config.max_sends.max(1) as usize,
            window: config.window(),
            sent: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn has_capacity(&mut self) -> bool {
        self.prune(Instant::now());
        self.sent.len() < self.max_sends
    }

    /// How long until a send would be admitted; zero when one is now.
    pub fn wait_time(&mut self) -> Duration {
        let now = Instant::now();
        self.prune(now);
        if self.sent.len() < self.max_sends {
            return Duration::ZERO;
        }
        self.sent
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Waits for capacity and records one send.
    pub async fn acquire(&mut self) {
        loop {
            let wait = self.wait_time();
            if wait.is_zero() {
                self.sent.push_back(Instant::now());
                return;
            }
            debug!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }
}
