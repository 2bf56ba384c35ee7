//! Channel Dispatcher.
//!
//! Each channel gets its own tokio task that drains a FIFO queue ordered by
//! `(scheduled_time, id)`. Sends pass through the channel's rate limiter and
//! are retried according to the channel's [`DeliveryPolicy`]. Workers share
//! one [`PendingSet`] so a (notification, channel) pair settles only once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use log::{debug, error, info, warn};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channels::{build_channel, NotificationChannel, OutboundMessage};
use crate::config::{ChannelConfig, RateLimitConfig, RetrySettings};
use crate::error::DeliveryError;
use crate::models::{ChannelId, ChannelStats, DeliveryResult, DeliveryState, LedgerUpdate, ScheduledNotification};
use crate::utils::retry::RetryConfig;

pub mod hooks;
pub mod pending;
pub mod rate_limiter;

pub use hooks::{DispatchHook, HookChain, LoggingHook};
pub use pending::{PendingKey, PendingSet};
pub use rate_limiter::RateLimiter;

/// Retry discipline for one channel.
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    /// Attempts and backoff for network errors and timeouts.
    pub retry: RetryConfig,
    pub attempt_timeout: Duration,
    /// Provider rate-limit answers tolerated per delivery. These waits do
    /// not count against `retry.max_attempts`.
    pub max_rate_limit_waits: u32,
    pub default_rate_limit_wait: Duration,
}

impl DeliveryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            retry: settings.to_retry_config(),
            attempt_timeout: Duration::from_secs(settings.attempt_timeout_secs),
            max_rate_limit_waits: settings.max_rate_limit_waits,
            default_rate_limit_wait: Duration::from_secs(settings.default_rate_limit_wait_secs),
        }
    }

    /// One attempt and no waiting, for best-effort sends.
    pub fn single_attempt(&self) -> Self {
        let mut policy = self.clone();
        policy.retry.max_attempts = 1;
        policy.max_rate_limit_waits = 0;
        policy
    }
}

/// A channel adapter plus the limits it is dispatched under.
pub struct ChannelHandle {
    pub channel: Arc<dyn NotificationChannel>,
    pub rate_limit: RateLimitConfig,
    pub policy: DeliveryPolicy,
}

struct ChannelSlot {
    channel: Arc<dyn NotificationChannel>,
    limiter: Arc<Mutex<RateLimiter>>,
    policy: DeliveryPolicy,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Every attempt's result, retryable failures included.
    pub results: Vec<DeliveryResult>,
    pub ledger: Vec<LedgerUpdate>,
    /// Notifications whose every channel reached a terminal state.
    pub settled_notifications: Vec<String>,
    pub stats: BTreeMap<ChannelId, ChannelStats>,
    /// True when the run stopped early with deliveries still pending.
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn permanent_failures(&self) -> Vec<DeliveryResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == crate::models::DeliveryOutcome::PermanentFailure)
            .cloned()
            .collect()
    }
}

pub struct Dispatcher {
    slots: BTreeMap<ChannelId, ChannelSlot>,
    hooks: HookChain,
}

impl Dispatcher {
    pub fn new(channels: Vec<ChannelHandle>, hooks: HookChain) -> Self {
        let slots = channels
            .into_iter()
            .map(|handle| {
                let id = handle.channel.id().clone();
                let slot = ChannelSlot {
                    channel: handle.channel,
                    limiter: Arc::new(Mutex::new(RateLimiter::new(handle.rate_limit))),
                    policy: handle.policy,
                };
                (id, slot)
            })
            .collect();
        Self { slots, hooks }
    }

    /// One adapter per enabled channel in the configuration.
    pub fn from_configs(configs: &[ChannelConfig], tz: Tz, client: Client, hooks: HookChain) -> Self {
        let handles = configs
            .iter()
            .filter(|config| config.enabled)
            .map(|config| ChannelHandle {
                channel: build_channel(config, tz, client.clone()),
                rate_limit: config.rate_limit(),
                policy: DeliveryPolicy::from_settings(&config.retry),
            })
            .collect();
        Self::new(handles, hooks)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.slots.keys().cloned().collect()
    }

    pub async fn dispatch(&self, notifications: Vec<ScheduledNotification>, cancel: CancellationToken) -> DispatchReport {
        self.run(notifications, cancel, false).await
    }

    /// Single attempt per channel, no retries.
    pub async fn dispatch_best_effort(
        &self,
        notification: ScheduledNotification,
        cancel: CancellationToken,
    ) -> DispatchReport {
        self.run(vec![notification], cancel, true).await
    }

    async fn run(
        &self,
        mut notifications: Vec<ScheduledNotification>,
        cancel: CancellationToken,
        best_effort: bool,
    ) -> DispatchReport {
        notifications.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time).then_with(|| a.id.cmp(&b.id)));

        let pending = PendingSet::new();
        let mut report = DispatchReport::default();
        let mut queues: BTreeMap<ChannelId, Vec<ScheduledNotification>> = BTreeMap::new();
        let mut targets: BTreeMap<String, BTreeSet<ChannelId>> = BTreeMap::new();

        for notification in &notifications {
            for channel in &notification.channels {
                let key = PendingKey::new(notification.id.clone(), channel.clone());
                if !pending.insert(key.clone()) {
                    debug!("Skipping duplicate delivery {} -> {}", notification.id, channel);
                    continue;
                }
                targets.entry(notification.id.clone()).or_default().insert(channel.clone());

                if !self.slots.contains_key(channel) {
                    warn!("Notification {} targets unknown channel {}", notification.id, channel);
                    pending.settle(&key, DeliveryState::Failed);
                    let error = format!("channel '{}' is not configured", channel);
                    report.ledger.push(LedgerUpdate {
                        notification_id: notification.id.clone(),
                        channel: channel.clone(),
                        state: DeliveryState::Failed,
                        attempts: 0,
                        last_error: Some(error.clone()),
                    });
                    report.results.push(DeliveryResult::failure(channel.clone(), &notification.id, 0, true, error));
                    report.stats.entry(channel.clone()).or_default().failed += 1;
                    continue;
                }
                queues.entry(channel.clone()).or_default().push(notification.clone());
            }
        }

        let mut tasks = JoinSet::new();
        for (channel_id, queue) in queues {
            let Some(slot) = self.slots.get(&channel_id) else {
                continue;
            };
            let worker = ChannelWorker {
                channel: slot.channel.clone(),
                limiter: slot.limiter.clone(),
                policy: if best_effort { slot.policy.single_attempt() } else { slot.policy.clone() },
                hooks: self.hooks.clone(),
                pending: pending.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(worker.run(queue));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.cancelled |= outcome.cancelled;
                    report.results.extend(outcome.results);
                    report.ledger.extend(outcome.ledger);
                    report.stats.entry(outcome.channel).or_default().merge(&outcome.stats);
                }
                Err(e) => error!("Channel worker stopped abnormally: {}", e),
            }
        }

        report.settled_notifications = targets
            .into_iter()
            .filter(|(id, channels)| {
                channels.iter().all(|channel| {
                    pending
                        .state(&PendingKey::new(id.clone(), channel.clone()))
                        .map(|state| state.is_terminal())
                        .unwrap_or(false)
                })
            })
            .map(|(id, _)| id)
            .collect();

        info!(
            "Dispatch finished: {} delivered, {} permanent failures, {} still pending{}",
            report.delivered(),
            report.permanent_failures().len(),
            pending.pending_len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        report
    }
}

struct WorkerOutcome {
    channel: ChannelId,
    results: Vec<DeliveryResult>,
    ledger: Vec<LedgerUpdate>,
    stats: ChannelStats,
    cancelled: bool,
}

struct ChannelWorker {
    channel: Arc<dyn NotificationChannel>,
    limiter: Arc<Mutex<RateLimiter>>,
    policy: DeliveryPolicy,
    hooks: HookChain,
    pending: PendingSet,
    cancel: CancellationToken,
}

/// FIFO head unless the limiter is exhausted, in which case the most urgent
/// entry (earliest among equals) goes next.
fn next_index(queue: &[ScheduledNotification], has_capacity: bool) -> usize {
    if has_capacity {
        return 0;
    }
    let mut best = 0;
    for (index, notification) in queue.iter().enumerate() {
        if notification.priority > queue[best].priority {
            best = index;
        }
    }
    best
}

impl ChannelWorker {
    async fn run(self, mut queue: Vec<ScheduledNotification>) -> WorkerOutcome {
        let channel_id = self.channel.id().clone();
        let mut outcome = WorkerOutcome {
            channel: channel_id.clone(),
            results: Vec::new(),
            ledger: Vec::new(),
            stats: ChannelStats::default(),
            cancelled: false,
        };
        let mut limiter = self.limiter.lock().await;

        while !queue.is_empty() {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let index = next_index(&queue, limiter.has_capacity());
            let notification = queue.remove(index);
            let key = PendingKey::new(notification.id.clone(), channel_id.clone());
            if !self.pending.is_pending(&key) {
                continue;
            }

            self.hooks.before_send(&notification, &channel_id).await;
            let message = OutboundMessage {
                notification_id: notification.id.clone(),
                idempotency_key: key.idempotency_key(),
                body: self.channel.render(&notification),
            };

            let Some(result) = self.deliver(&key, &message, &mut limiter, &mut outcome).await else {
                outcome.cancelled = true;
                let attempts = self.pending.attempts(&key);
                if attempts > 0 {
                    outcome.ledger.push(LedgerUpdate {
                        notification_id: notification.id.clone(),
                        channel: channel_id.clone(),
                        state: DeliveryState::Pending,
                        attempts,
                        last_error: Some("dispatch cancelled".to_string()),
                    });
                }
                break;
            };

            let state = if result.is_success() {
                outcome.stats.delivered += 1;
                DeliveryState::Delivered
            } else {
                outcome.stats.failed += 1;
                DeliveryState::Failed
            };
            let attempts = self.pending.settle(&key, state).unwrap_or(result.attempt);
            outcome.ledger.push(LedgerUpdate {
                notification_id: notification.id.clone(),
                channel: channel_id.clone(),
                state,
                attempts,
                last_error: result.error.clone(),
            });
            self.hooks.after_send(&notification, &result).await;
            outcome.results.push(result);
        }

        if outcome.cancelled {
            info!("Channel {} stopped early; remaining deliveries stay pending", channel_id);
        }
        outcome
    }

    /// Attempts one (notification, channel) pair until it settles. `None`
    /// means the run was cancelled first.
    async fn deliver(
        &self,
        key: &PendingKey,
        message: &OutboundMessage,
        limiter: &mut RateLimiter,
        outcome: &mut WorkerOutcome,
    ) -> Option<DeliveryResult> {
        let channel = &key.channel;
        let id = key.notification_id.as_str();
        let policy = &self.policy;
        let max_attempts = policy.retry.max_attempts.max(1);

        let mut failures = 0u32;
        let mut auth_failures = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = limiter.acquire() => {}
            }

            let attempt = self.pending.record_attempt(key).unwrap_or(1);
            outcome.stats.attempts += 1;

            let sent = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                sent = tokio::time::timeout(policy.attempt_timeout, self.channel.send(message)) => sent,
            };
            let error = match sent {
                Ok(Ok(())) => return Some(DeliveryResult::success(channel.clone(), id, attempt)),
                Ok(Err(e)) => e,
                Err(_) => DeliveryError::Timeout(policy.attempt_timeout),
            };

            let wait = match &error {
                DeliveryError::PermanentRejection(_) => None,
                DeliveryError::Auth(_) => {
                    auth_failures += 1;
                    failures += 1;
                    if auth_failures > 1 || failures >= max_attempts {
                        error!("Channel {} rejected its credentials; {} needs operator attention", channel, id);
                        None
                    } else {
                        Some(policy.retry.delay_for(failures))
                    }
                }
                DeliveryError::Network(_) | DeliveryError::Timeout(_) => {
                    failures += 1;
                    (failures < max_attempts).then(|| policy.retry.delay_for(failures))
                }
                DeliveryError::RateLimited { retry_after } => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > policy.max_rate_limit_waits {
                        None
                    } else {
                        outcome.stats.rate_limit_waits += 1;
                        Some(retry_after.unwrap_or(policy.default_rate_limit_wait))
                    }
                }
            };

            let Some(wait) = wait else {
                warn!("Delivery {} -> {} failed permanently on attempt {}: {}", id, channel, attempt, error);
                return Some(DeliveryResult::failure(channel.clone(), id, attempt, true, error.to_string()));
            };

            debug!("Delivery {} -> {} attempt {} failed, retrying in {:?}: {}", id, channel, attempt, wait, error);
            outcome
                .results
                .push(DeliveryResult::failure(channel.clone(), id, attempt, false, error.to_string()));

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
