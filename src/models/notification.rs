use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::{Event, EventTime, PassState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    DailySummary,
    EventAdded,
    EventUpdated,
    Reminder,
    ConflictReview,
    PassFailure,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailySummary => "daily-summary",
            Self::EventAdded => "event-added",
            Self::EventUpdated => "event-updated",
            Self::Reminder => "reminder",
            Self::ConflictReview => "conflict-review",
            Self::PassFailure => "pass-failure",
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            Self::DailySummary | Self::EventAdded => Priority::Normal,
            Self::EventUpdated | Self::Reminder | Self::ConflictReview => Priority::High,
            Self::PassFailure => Priority::Urgent,
        }
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily-summary" => Ok(Self::DailySummary),
            "event-added" => Ok(Self::EventAdded),
            "event-updated" => Ok(Self::EventUpdated),
            "reminder" => Ok(Self::Reminder),
            "conflict-review" => Ok(Self::ConflictReview),
            "pass-failure" => Ok(Self::PassFailure),
            other => Err(format!("unknown notification type '{}'", other)),
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Higher values pre-empt lower ones on a rate-limited channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=1 => Self::Low,
            2 => Self::Normal,
            3 => Self::High,
            _ => Self::Urgent,
        }
    }

    pub fn level(&self) -> i64 {
        *self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of an event a notification needs to talk about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLine {
    pub event_id: String,
    pub title: String,
    pub start: EventTime,
    pub end: Option<EventTime>,
    pub location: String,
}

impl EventLine {
    pub fn is_all_day(&self) -> bool {
        self.start.is_date()
    }
}

impl From<&Event> for EventLine {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id.clone(),
            title: event.title.clone(),
            start: event.start,
            end: event.end,
            location: event.location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Agenda {
    NoEvents,
    Events(Vec<EventLine>),
}

impl Agenda {
    /// All-day entries first, then timed entries by start; ids break ties.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>, tz: &Tz) -> Self {
        let mut lines: Vec<(bool, DateTime<Utc>, EventLine)> = events
            .into_iter()
            .map(|e| (!e.is_all_day(), e.starts_at(tz), EventLine::from(e)))
            .collect();
        if lines.is_empty() {
            return Self::NoEvents;
        }
        lines.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| if a.0 { a.1.cmp(&b.1) } else { std::cmp::Ordering::Equal })
                .then_with(|| a.2.event_id.cmp(&b.2.event_id))
        });
        Self::Events(lines.into_iter().map(|(_, _, line)| line).collect())
    }

    pub fn lines(&self) -> &[EventLine] {
        match self {
            Self::NoEvents => &[],
            Self::Events(lines) => lines,
        }
    }
}

/// Channel-neutral content; each channel renders it at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NotificationPayload {
    DailySummary {
        date: NaiveDate,
        agenda: Agenda,
    },
    EventAdded {
        event: EventLine,
    },
    EventUpdated {
        before: EventLine,
        after: EventLine,
    },
    Reminder {
        event: EventLine,
        minutes_before: u32,
    },
    ConflictReview {
        event: EventLine,
        reason: String,
    },
    PassFailure {
        pass_id: String,
        stage: PassState,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    /// Deterministic, so rescheduling the same thing lands on the same row.
    pub id: String,
    pub notification_type: NotificationType,
    pub event_id: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub priority: Priority,
    pub channels: BTreeSet<ChannelId>,
    pub payload: NotificationPayload,
}

impl ScheduledNotification {
    pub fn daily_summary_id(date: NaiveDate) -> String {
        format!("daily-summary:{}", date.format("%Y-%m-%d"))
    }

    pub fn reminder_id(event_id: &str, minutes_before: u32) -> String {
        format!("reminder:{}:{}", event_id, minutes_before)
    }

    pub fn event_added_id(event: &Event) -> String {
        format!("event-added:{}:{}", event.id, short_hash(&event.content_hash()))
    }

    pub fn event_updated_id(event: &Event) -> String {
        format!("event-updated:{}:{}", event.id, short_hash(&event.content_hash()))
    }

    pub fn conflict_review_id(event: &Event) -> String {
        format!("conflict-review:{}:{}", event.id, short_hash(&event.content_hash()))
    }

    pub fn pass_failure_id(pass_id: &str) -> String {
        format!("pass-failure:{}", pass_id)
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn timed(id: &str, start: &str) -> Event {
        Event::new(id, id.to_uppercase(), EventTime::DateTime(DateTime::parse_from_rfc3339(start).unwrap()))
    }

    fn all_day(id: &str) -> Event {
        Event::new(id, id.to_uppercase(), EventTime::Date(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()))
    }

    fn ids(agenda: &Agenda) -> Vec<&str> {
        agenda.lines().iter().map(|l| l.event_id.as_str()).collect()
    }

    #[test]
    fn test_agenda_ordering() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let events = vec![
            timed("late", "2025-09-01T18:00:00+09:00"),
            timed("b-early", "2025-09-01T08:00:00+09:00"),
            all_day("z-holiday"),
            timed("a-early", "2025-09-01T08:00:00+09:00"),
            all_day("birthday"),
        ];
        let agenda = Agenda::from_events(&events, &tz);
        assert_eq!(ids(&agenda), vec!["birthday", "z-holiday", "a-early", "b-early", "late"]);
    }

    #[test]
    fn test_empty_agenda_is_explicit_marker() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        let agenda = Agenda::from_events(std::iter::empty(), &tz);
        assert_eq!(agenda, Agenda::NoEvents);
    }

    #[test]
    fn test_priority_ordering_and_levels() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
            assert_eq!(Priority::from_level(p.level()), p);
        }
    }

    #[test]
    fn test_default_priorities() {
        assert_eq!(NotificationType::DailySummary.default_priority(), Priority::Normal);
        assert_eq!(NotificationType::Reminder.default_priority(), Priority::High);
        assert_eq!(NotificationType::PassFailure.default_priority(), Priority::Urgent);
    }

    #[test]
    fn test_notification_ids_are_deterministic() {
        let event = all_day("e1");
        assert_eq!(ScheduledNotification::reminder_id("e1", 15), "reminder:e1:15");
        assert_eq!(
            ScheduledNotification::event_added_id(&event),
            ScheduledNotification::event_added_id(&event.clone())
        );
        assert_eq!(
            ScheduledNotification::daily_summary_id(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()),
            "daily-summary:2025-09-01"
        );
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = NotificationPayload::DailySummary {
            date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            agenda: Agenda::NoEvents,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "daily-summary");
        assert_eq!(json["agenda"], "NoEvents");
        let back: NotificationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
