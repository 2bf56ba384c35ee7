// LINE Messaging API push channel.

use async_trait::async_trait;
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::json;

use super::render;
use super::{send_request, NotificationChannel, OutboundMessage, RenderedMessage};
use crate::error::DeliveryError;
use crate::models::{ChannelId, ScheduledNotification};

pub const DEFAULT_API_BASE: &str = "https://api.line.me";
const RETRY_KEY_HEADER: &str = "X-Line-Retry-Key";
/// LINE answers 409 when a retry key was already accepted.
const ALREADY_ACCEPTED: u16 = 409;

pub struct LineChannel {
    id: ChannelId,
    access_token: String,
    to: String,
    api_base: String,
    tz: Tz,
    client: Client,
}

impl LineChannel {
    pub fn new(
        id: ChannelId,
        access_token: String,
        to: String,
        api_base: Option<String>,
        tz: Tz,
        client: Client,
    ) -> Self {
        Self {
            id,
            access_token,
            to,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            tz,
            client,
        }
    }

    fn push_url(&self) -> String {
        format!("{}/v2/bot/message/push", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl NotificationChannel for LineChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn render(&self, notification: &ScheduledNotification) -> RenderedMessage {
        RenderedMessage::Text(render::plain_text(&notification.payload, &self.tz))
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let body = json!({
            "to": self.to,
            "messages": [{ "type": "text", "text": message.body.text() }]
        });
        let request = self
            .client
            .post(self.push_url())
            .bearer_auth(&self.access_token)
            .header(RETRY_KEY_HEADER, message.idempotency_key.to_string())
            .json(&body);
        send_request(request, &[ALREADY_ACCEPTED]).await
    }
}
