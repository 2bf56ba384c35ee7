//! Pre/post delivery callbacks.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use crate::models::{ChannelId, DeliveryResult, ScheduledNotification};
use crate::utils::logging::log_delivery_attempt;

#[async_trait]
pub trait DispatchHook: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per (notification, channel) before the first attempt.
    async fn before_send(&self, _notification: &ScheduledNotification, _channel: &ChannelId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with the terminal result of a (notification, channel) pair.
    async fn after_send(&self, _notification: &ScheduledNotification, _result: &DeliveryResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks run in registration order. Each call runs on its own task, so a
/// hook that errors or panics is logged and the chain carries on.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn DispatchHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn DispatchHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn push(&mut self, hook: Arc<dyn DispatchHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_send(&self, notification: &ScheduledNotification, channel: &ChannelId) {
        for hook in &self.hooks {
            let context = format!("before {} -> {}", notification.id, channel);
            let (hook, notification, channel) = (hook.clone(), notification.clone(), channel.clone());
            isolated(hook.name().to_string(), context, async move {
                hook.before_send(&notification, &channel).await
            })
            .await;
        }
    }

    pub async fn after_send(&self, notification: &ScheduledNotification, result: &DeliveryResult) {
        for hook in &self.hooks {
            let context = format!("after {} -> {}", notification.id, result.channel);
            let (hook, notification, result) = (hook.clone(), notification.clone(), result.clone());
            isolated(hook.name().to_string(), context, async move {
                hook.after_send(&notification, &result).await
            })
            .await;
        }
    }
}

async fn isolated<F>(name: String, context: String, call: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Hook '{}' failed {}: {:#}", name, context, e),
        Err(e) => warn!("Hook '{}' panicked {}: {}", name, context, e),
    }
}

/// Writes each terminal delivery result to the log.
pub struct LoggingHook;

#[async_trait]
impl DispatchHook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    async fn after_send(&self, _notification: &ScheduledNotification, result: &DeliveryResult) -> anyhow::Result<()> {
        let outcome = match &result.error {
            Some(error) => format!("{:?} ({})", result.outcome, error),
            None => format!("{:?}", result.outcome),
        };
        log_delivery_attempt(result.channel.as_str(), &result.notification_id, result.attempt, &outcome);
        Ok(())
    }
}
