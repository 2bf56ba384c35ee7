use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Start or end of an event: a pure date means "all day".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTime {
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
}

impl EventTime {
    pub fn is_date(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// Instant this value denotes; dates are taken as local midnight in `tz`.
    pub fn to_utc(&self, tz: &Tz) -> DateTime<Utc> {
        match self {
            Self::DateTime(dt) => dt.with_timezone(&Utc),
            Self::Date(date) => local_to_utc(tz, *date, NaiveTime::default()),
        }
    }

    /// Calendar day this value falls on as seen in `tz`.
    pub fn date_in(&self, tz: &Tz) -> NaiveDate {
        match self {
            Self::Date(date) => *date,
            Self::DateTime(dt) => dt.with_timezone(tz).date_naive(),
        }
    }

    /// Offset-independent form used for hashing: the same instant written
    /// with two different offsets must hash identically.
    fn canonical(&self) -> String {
        match self {
            Self::Date(date) => format!("D:{}", date.format("%Y-%m-%d")),
            Self::DateTime(dt) => format!("T:{}", dt.with_timezone(&Utc).to_rfc3339()),
        }
    }
}

/// Resolves a local wall-clock time, taking the earlier instant on DST folds
/// and skipping forward an hour on DST gaps.
pub fn local_to_utc(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
    }
}

/// A normalized calendar entry as fetched from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    pub start: EventTime,
    #[serde(default)]
    pub end: Option<EventTime>,
}

impl Event {
    pub fn new(id: impl Into<String>, title: impl Into<String>, start: EventTime) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            location: String::new(),
            start,
            end: None,
        }
    }

    pub fn with_end(mut self, end: EventTime) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn is_all_day(&self) -> bool {
        self.start.is_date()
    }

    /// Hex SHA-256 over title, start, end, all-day flag, description and
    /// location. The id is deliberately not part of the digest.
    pub fn content_hash(&self) -> String {
        let start = self.start.canonical();
        let end = self.end.map(|e| e.canonical()).unwrap_or_default();
        let all_day = if self.is_all_day() { "1" } else { "0" };
        let parts = [
            self.title.as_str(),
            start.as_str(),
            end.as_str(),
            all_day,
            self.description.as_str(),
            self.location.as_str(),
        ];

        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn starts_at(&self, tz: &Tz) -> DateTime<Utc> {
        self.start.to_utc(tz)
    }

    /// Whether the event covers `day` in `tz`. All-day ends are exclusive,
    /// timed ends inclusive of their own day.
    pub fn occurs_on(&self, day: NaiveDate, tz: &Tz) -> bool {
        let first = self.start.date_in(tz);
        let last = match self.end {
            Some(EventTime::Date(end)) if end > first => end.pred_opt().unwrap_or(first),
            Some(end @ EventTime::DateTime(_)) => end.date_in(tz).max(first),
            _ => first,
        };
        first <= day && day <= last
    }

    /// True when a change would be noticed by a person reading their
    /// calendar: title, start, end, or the all-day flag.
    pub fn visibly_differs(&self, other: &Event) -> bool {
        self.title != other.title
            || self.start != other.start
            || self.end != other.end
            || self.is_all_day() != other.is_all_day()
    }
}
