use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{local_to_utc, Event, EventTime};
use crate::error::ConflictResolutionError;

/// Half-open instant range `[start, end)` requested from a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Whole local days from `today - back_days` up to and including
    /// `today + ahead_days`.
    pub fn around(today: NaiveDate, back_days: u32, ahead_days: u32, tz: &Tz) -> Self {
        let first = today - Duration::days(back_days as i64);
        let after_last = today + Duration::days(ahead_days as i64 + 1);
        Self {
            start: local_to_utc(tz, first, NaiveTime::default()),
            end: local_to_utc(tz, after_last, NaiveTime::default()),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether any part of `event` falls inside the range. An event ending
    /// exactly at `start` still counts.
    pub fn overlaps(&self, event: &Event, tz: &Tz) -> bool {
        let start = event.starts_at(tz);
        let end = event.end.map(|e| e.to_utc(tz)).unwrap_or(start);
        start < self.end && end >= self.start
    }
}

/// The target calendar's own copy of an event, possibly edited by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEvent {
    pub target_id: String,
    /// Source event id stamped on the copy when it was pushed.
    pub source_event_id: Option<String>,
    pub title: Option<String>,
    pub description: String,
    pub location: String,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
}

impl TargetEvent {
    /// The copy as an `Event` under `source_id`. Fails when fields the
    /// merge needs are missing on the target side.
    pub fn to_event(&self, source_id: &str) -> Result<Event, ConflictResolutionError> {
        let title = self.title.clone().ok_or_else(|| ConflictResolutionError::IncompleteTarget {
            target_id: self.target_id.clone(),
            field: "title",
        })?;
        let start = self.start.ok_or_else(|| ConflictResolutionError::IncompleteTarget {
            target_id: self.target_id.clone(),
            field: "start",
        })?;
        Ok(Event {
            id: source_id.to_string(),
            title,
            description: self.description.clone(),
            location: self.location.clone(),
            start,
            end: self.end,
        })
    }

    /// Hash comparable with `Event::content_hash`; `None` when incomplete.
    pub fn content_hash(&self) -> Option<String> {
        let id = self.source_event_id.as_deref().unwrap_or(&self.target_id);
        self.to_event(id).ok().map(|e| e.content_hash())
    }
}

impl From<&Event> for TargetEvent {
    fn from(event: &Event) -> Self {
        Self {
            target_id: String::new(),
            source_event_id: Some(event.id.clone()),
            title: Some(event.title.clone()),
            description: event.description.clone(),
            location: event.location.clone(),
            start: Some(event.start),
            end: event.end,
        }
    }
}
