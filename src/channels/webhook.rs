// Incoming-webhook channels: Slack, Discord and the voice-assistant bridge.
// None of these providers accept an idempotency token, so duplicate
// suppression relies on the dispatcher's pending set and the ledger.

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::{json, Value};

use super::render;
use super::{send_request, NotificationChannel, OutboundMessage, RenderedMessage};
use crate::error::DeliveryError;
use crate::models::{ChannelId, ScheduledNotification};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStyle {
    Slack,
    Discord,
    Voice,
}

pub struct WebhookChannel {
    id: ChannelId,
    style: WebhookStyle,
    url: String,
    tz: Tz,
    client: Client,
}

impl WebhookChannel {
    pub fn new(id: ChannelId, style: WebhookStyle, url: String, tz: Tz, client: Client) -> Self {
        Self { id, style, url, tz, client }
    }

    fn body(&self, message: &RenderedMessage) -> Value {
        match (self.style, message) {
            (_, RenderedMessage::Json(value)) => value.clone(),
            (WebhookStyle::Slack, other) => json!({ "text": other.text() }),
            (WebhookStyle::Discord, other) => json!({ "content": other.text() }),
            (WebhookStyle::Voice, other) => json!({ "value1": other.text() }),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn render(&self, notification: &ScheduledNotification) -> RenderedMessage {
        let payload = &notification.payload;
        match self.style {
            WebhookStyle::Slack => RenderedMessage::Json(render::slack_blocks(payload, &self.tz)),
            WebhookStyle::Discord => RenderedMessage::Json(render::discord_embed(payload, &self.tz)),
            WebhookStyle::Voice => RenderedMessage::Speech(render::spoken(payload, &self.tz)),
        }
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let request = self.client.post(&self.url).json(&self.body(&message.body));
        send_request(request, &[]).await
    }
}
