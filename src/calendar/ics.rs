//! ICS feed source.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone};
use chrono_tz::Tz;
use icalendar::{Calendar as IcsCalendar, CalendarDateTime, Component, DatePerhapsTime, Event as IcsEvent, EventLike};
use log::{debug, info, warn};
use reqwest::Client;
use sha2::{Digest, Sha256};
use url::Url;

use super::EventSource;
use crate::error::FetchError;
use crate::http_config::HttpConfig;
use crate::models::{DateRange, Event, EventTime};
use crate::utils::normalize_whitespace;

/// Validates an ICS URL for security and format correctness
pub fn validate_ics_url_format(ics_url: &str) -> Result<(), String> {
    if ics_url.trim().is_empty() {
        return Err("ICS URL cannot be empty".to_string());
    }

    let parsed_url = Url::parse(ics_url).map_err(|e| format!("Invalid ICS URL format: {}", e))?;

    if parsed_url.scheme() != "https" {
        return Err(format!(
            "ICS URL must use HTTPS, not '{}://'",
            parsed_url.scheme()
        ));
    }

    let domain = parsed_url
        .host_str()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| format!("ICS URL '{}' has no host", ics_url))?;

    if domain == "localhost"
        || domain.starts_with("127.")
        || domain.starts_with("192.168.")
        || domain.starts_with("10.")
        || domain.starts_with("172.16.")
    {
        return Err("ICS URL cannot point to localhost or local network addresses".to_string());
    }

    let path = parsed_url.path();
    if !path.to_lowercase().ends_with(".ics") && !path.contains("/calendar") {
        warn!("ICS URL path does not look like a calendar feed: {}", parsed_url.path());
    }

    Ok(())
}

/// Converts an iCalendar start/end. Floating times and unknown TZIDs are
/// read in `default_tz`.
pub fn parse_ical_datetime(dt: &DatePerhapsTime, default_tz: &Tz) -> Option<EventTime> {
    match dt {
        DatePerhapsTime::Date(date) => Some(EventTime::Date(*date)),
        DatePerhapsTime::DateTime(dt) => {
            let fixed: Option<DateTime<FixedOffset>> = match dt {
                CalendarDateTime::Utc(dt) => Some((*dt).into()),
                CalendarDateTime::Floating(naive) => default_tz
                    .from_local_datetime(naive)
                    .earliest()
                    .map(|zoned| zoned.fixed_offset()),
                CalendarDateTime::WithTimezone { date_time, tzid } => {
                    let tz = Tz::from_str(tzid).unwrap_or_else(|_| {
                        warn!("Unrecognized timezone '{}', using {}", tzid, default_tz);
                        *default_tz
                    });
                    tz.from_local_datetime(date_time)
                        .earliest()
                        .map(|zoned| zoned.fixed_offset())
                }
            };
            fixed.map(EventTime::DateTime)
        }
    }
}

/// Parsed feed: events overlapping the range, plus how many VEVENTs had to
/// be skipped.
#[derive(Debug)]
pub struct ParsedFeed {
    pub events: Vec<Event>,
    pub skipped: usize,
}

pub fn parse_ics_data(ics_data: &str, tz: &Tz, range: &DateRange) -> Result<ParsedFeed, FetchError> {
    let calendar = IcsCalendar::from_str(ics_data)
        .map_err(|e| FetchError::network(format!("Failed to parse ICS data: {}", e)))?;

    let mut events = Vec::new();
    let mut skipped = 0;

    for component in &calendar.components {
        let Some(ics_event) = component.as_event() else {
            continue;
        };
        match convert_ics_event(ics_event, tz) {
            Some(event) => {
                if range.overlaps(&event, tz) {
                    events.push(event);
                }
            }
            None => skipped += 1,
        }
    }

    debug!("Parsed {} events in range, skipped {}", events.len(), skipped);
    Ok(ParsedFeed { events, skipped })
}

fn convert_ics_event(ics_event: &IcsEvent, tz: &Tz) -> Option<Event> {
    let start = ics_event.get_start().as_ref().and_then(|dt| parse_ical_datetime(dt, tz));
    let Some(start) = start else {
        warn!(
            "Skipping VEVENT without a usable DTSTART (uid {:?})",
            ics_event.get_uid()
        );
        return None;
    };
    let end = ics_event.get_end().as_ref().and_then(|dt| parse_ical_datetime(dt, tz));

    let title = normalize_whitespace(ics_event.get_summary().unwrap_or("Untitled Event"));

    let id = match ics_event.get_uid() {
        Some(uid) if !uid.trim().is_empty() => uid.trim().to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(title.as_bytes());
            hasher.update(format!("{:?}", start).as_bytes());
            format!("ics-{}", &hex::encode(hasher.finalize())[..16])
        }
    };

    Some(Event {
        id,
        title,
        description: ics_event.get_description().unwrap_or_default().trim().to_string(),
        location: normalize_whitespace(ics_event.get_location().unwrap_or_default()),
        start,
        end,
    })
}

/// Reads events from a published ICS feed.
pub struct IcsSource {
    url: String,
    client: Client,
    tz: Tz,
}

impl IcsSource {
    pub fn new(url: impl Into<String>, tz: Tz) -> Result<Self, FetchError> {
        let client = HttpConfig::ics_fetch()
            .build_client()
            .map_err(|e| FetchError::network(format!("Failed to build client: {}", e)))?;
        Ok(Self::with_client(url, tz, client))
    }

    pub fn with_client(url: impl Into<String>, tz: Tz, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            tz,
        }
    }

    async fn fetch_body(&self) -> Result<String, FetchError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("ICS feed answered HTTP {}", status.as_u16());
            return Err(match status.as_u16() {
                401 | 403 | 404 | 410 => FetchError::auth(message),
                _ => FetchError::network(message),
            });
        }

        let content = response.text().await?;

        let head = content.trim_start();
        if head.starts_with("<!DOCTYPE") || head.starts_with("<html") {
            return Err(FetchError::auth(
                "The feed returned HTML instead of a calendar; check the secret iCal address",
            ));
        }
        if !content.contains("BEGIN:VCALENDAR") {
            return Err(FetchError::network("Response is not an iCalendar document"));
        }
        Ok(content)
    }
}

#[async_trait]
impl EventSource for IcsSource {
    fn name(&self) -> &str {
        "ics"
    }

    async fn fetch(&self, range: DateRange) -> Result<Vec<Event>, FetchError> {
        let body = self.fetch_body().await?;
        info!("Fetched {} bytes of ICS data", body.len());

        let feed = parse_ics_data(&body, &self.tz, &range)?;
        if feed.skipped > 0 {
            return Err(FetchError::PartialData {
                reason: format!("{} calendar entries could not be read", feed.skipped),
                events: feed.events,
            });
        }
        Ok(feed.events)
    }
}
