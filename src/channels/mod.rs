//! Notification channels.
//!
//! The set of channel kinds is closed (see [`ChannelKind`]); each configured
//! channel becomes one adapter behind [`NotificationChannel`]. Adapters
//! render the channel-neutral payload themselves at dispatch time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ChannelConfig, ChannelKind};
use crate::error::DeliveryError;
use crate::models::{ChannelId, ScheduledNotification};

pub mod line;
pub mod render;
pub mod webhook;

pub use line::LineChannel;
pub use webhook::{WebhookChannel, WebhookStyle};

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedMessage {
    Text(String),
    Json(Value),
    /// Text meant to be read aloud.
    Speech(String),
}

impl RenderedMessage {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) | Self::Speech(text) => text.clone(),
            Self::Json(value) => value.to_string(),
        }
    }
}

/// One rendered notification on its way to one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub notification_id: String,
    /// Stable across retries of the same (notification, channel) pair.
    pub idempotency_key: Uuid,
    pub body: RenderedMessage,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn id(&self) -> &ChannelId;

    fn render(&self, notification: &ScheduledNotification) -> RenderedMessage;

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Builds the adapter for one configured channel.
pub fn build_channel(config: &ChannelConfig, tz: Tz, client: Client) -> Arc<dyn NotificationChannel> {
    let id = ChannelId::new(config.id.clone());
    match &config.kind {
        ChannelKind::Slack { webhook_url } => {
            Arc::new(WebhookChannel::new(id, WebhookStyle::Slack, webhook_url.clone(), tz, client))
        }
        ChannelKind::Discord { webhook_url } => {
            Arc::new(WebhookChannel::new(id, WebhookStyle::Discord, webhook_url.clone(), tz, client))
        }
        ChannelKind::Voice { webhook_url } => {
            Arc::new(WebhookChannel::new(id, WebhookStyle::Voice, webhook_url.clone(), tz, client))
        }
        ChannelKind::Line { access_token, to, api_base } => Arc::new(LineChannel::new(
            id,
            access_token.clone(),
            to.clone(),
            api_base.clone(),
            tz,
            client,
        )),
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Sends a prepared request and classifies the answer. `also_ok` lists
/// non-2xx statuses the provider uses to mean "already accepted".
pub(crate) async fn send_request(request: RequestBuilder, also_ok: &[u16]) -> Result<(), DeliveryError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() || also_ok.contains(&status.as_u16()) {
        return Ok(());
    }

    let wait = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::from_status(status.as_u16(), &body, wait))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;

    fn config(kind: ChannelKind) -> ChannelConfig {
        ChannelConfig {
            id: "ops".to_string(),
            kind,
            rate_limit: None,
            retry: RetrySettings::default(),
            notify: None,
            enabled: true,
        }
    }

    #[test]
    fn test_build_channel_keeps_configured_id() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let kinds = [
            ChannelKind::Slack { webhook_url: "https://hooks.slack.com/services/x".into() },
            ChannelKind::Discord { webhook_url: "https://discord.com/api/webhooks/x".into() },
            ChannelKind::Voice { webhook_url: "https://maker.ifttt.com/trigger/x".into() },
            ChannelKind::Line { access_token: "t".into(), to: "U1".into(), api_base: None },
        ];
        for kind in kinds {
            let channel = build_channel(&config(kind), tz, Client::new());
            assert_eq!(channel.id().as_str(), "ops");
        }
    }

    #[test]
    fn test_rendered_message_text() {
        assert_eq!(RenderedMessage::Speech("hi".into()).text(), "hi");
        assert_eq!(RenderedMessage::Json(serde_json::json!({"a": 1})).text(), r#"{"a":1}"#);
    }
}
