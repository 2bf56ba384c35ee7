// Google Calendar as the mirror target.
// Events pushed from the source carry their source id in a private
// extended property so they can be matched back on later passes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use super::TargetCalendar;
use crate::error::TargetError;
use crate::http_config::HttpConfig;
use crate::models::{DateRange, Event, EventTime, TargetEvent};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const SOURCE_ID_PROPERTY: &str = "eventrelay_source_id";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<String>,
}

impl GoogleTime {
    fn from_event_time(time: &EventTime) -> Self {
        match time {
            EventTime::Date(date) => Self {
                date: Some(date.format("%Y-%m-%d").to_string()),
                date_time: None,
            },
            EventTime::DateTime(dt) => Self {
                date: None,
                date_time: Some(dt.to_rfc3339()),
            },
        }
    }

    fn to_event_time(&self) -> Option<EventTime> {
        if let Some(dt) = &self.date_time {
            return DateTime::<FixedOffset>::parse_from_rfc3339(dt)
                .map(EventTime::DateTime)
                .map_err(|e| warn!("Unparseable dateTime '{}' from target: {}", dt, e))
                .ok();
        }
        self.date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map(EventTime::Date)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtendedProperties {
    #[serde(default)]
    private: HashMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    #[serde(default, skip_serializing)]
    id: String,
    #[serde(default, skip_serializing)]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<GoogleTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<GoogleTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extended_properties: Option<ExtendedProperties>,
}

impl GoogleEvent {
    /// Request body for an insert or full update. Google requires an end,
    /// so a missing one becomes the next day (all-day) or one hour later.
    fn from_event(event: &Event) -> Self {
        let end = event.end.unwrap_or(match event.start {
            EventTime::Date(date) => EventTime::Date(date.succ_opt().unwrap_or(date)),
            EventTime::DateTime(dt) => EventTime::DateTime(dt + Duration::hours(1)),
        });

        let mut private = HashMap::new();
        private.insert(SOURCE_ID_PROPERTY.to_string(), event.id.clone());

        Self {
            summary: Some(event.title.clone()),
            description: Some(event.description.clone()),
            location: Some(event.location.clone()),
            start: Some(GoogleTime::from_event_time(&event.start)),
            end: Some(GoogleTime::from_event_time(&end)),
            extended_properties: Some(ExtendedProperties { private }),
            ..Default::default()
        }
    }

    fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    fn into_target_event(self) -> TargetEvent {
        let source_event_id = self
            .extended_properties
            .as_ref()
            .and_then(|props| props.private.get(SOURCE_ID_PROPERTY).cloned());
        TargetEvent {
            target_id: self.id,
            source_event_id,
            title: self.summary,
            description: self.description.unwrap_or_default(),
            location: self.location.unwrap_or_default(),
            start: self.start.as_ref().and_then(GoogleTime::to_event_time),
            end: self.end.as_ref().and_then(GoogleTime::to_event_time),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventList {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

pub struct GoogleCalendarTarget {
    client: Client,
    api_base: String,
    calendar_id: String,
    access_token: String,
}

impl GoogleCalendarTarget {
    pub fn new(
        calendar_id: impl Into<String>,
        access_token: impl Into<String>,
        api_base: Option<String>,
    ) -> Result<Self, TargetError> {
        let client = HttpConfig::calendar_api()
            .build_client()
            .map_err(|e| TargetError::Network(format!("Failed to build client: {}", e)))?;
        Ok(Self {
            client,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            calendar_id: calendar_id.into(),
            access_token: access_token.into(),
        })
    }

    /// `{base}/calendars/{calendar_id}/events[/{event_id}]`, each segment
    /// percent-encoded.
    fn events_url(&self, event_id: Option<&str>) -> Result<Url, TargetError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| TargetError::Network(format!("Invalid API base '{}': {}", self.api_base, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TargetError::Network(format!("API base '{}' cannot take a path", self.api_base)))?;
            segments.pop_if_empty().push("calendars").push(&self.calendar_id).push("events");
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TargetError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = crate::utils::truncate_chars(&body, 200);
        Err(match code {
            401 | 403 => TargetError::Auth(format!("HTTP {}: {}", code, message)),
            429 | 500..=599 => TargetError::Network(format!("HTTP {}: {}", code, message)),
            _ => TargetError::Rejected { status: code, message },
        })
    }
}

#[async_trait]
impl TargetCalendar for GoogleCalendarTarget {
    async fn list_events(&self, range: DateRange) -> Result<Vec<TargetEvent>, TargetError> {
        let url = self.events_url(None)?;
        let time_min = range.start.to_rfc3339();
        let time_max = range.end.to_rfc3339();

        let mut events = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("maxResults", "250"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response = self.send(self.client.get(url.clone()).query(&query)).await?;
            let page: EventList = response.json().await?;

            events.extend(
                page.items
                    .into_iter()
                    .filter(|item| !item.is_cancelled())
                    .map(GoogleEvent::into_target_event),
            );

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!("Listed {} target events", events.len());
        Ok(events)
    }

    async fn upsert_event(&self, event: &Event, target_id: Option<String>) -> Result<TargetEvent, TargetError> {
        let body = GoogleEvent::from_event(event);
        let request = match target_id.as_deref() {
            Some(id) => self.client.put(self.events_url(Some(id))?),
            None => self.client.post(self.events_url(None)?),
        };

        let response = self.send(request.json(&body)).await?;
        let stored: GoogleEvent = response.json().await?;
        debug!("Target stored event {} as {}", event.id, stored.id);
        Ok(stored.into_target_event())
    }

    async fn delete_event(&self, target_id: &str) -> Result<(), TargetError> {
        let url = self.events_url(Some(target_id))?;
        match self.send(self.client.delete(url)).await {
            Ok(_) => Ok(()),
            Err(TargetError::Rejected { status: 404 | 410, .. }) => {
                debug!("Target event {} already gone", target_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
