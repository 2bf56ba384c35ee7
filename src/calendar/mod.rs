//! Source and target calendar seams.

use async_trait::async_trait;

use crate::error::{FetchError, TargetError};
use crate::models::{DateRange, Event, TargetEvent};

pub mod cache;
pub mod google;
pub mod ics;

pub use cache::{CachedFetch, FetchCache};
pub use google::GoogleCalendarTarget;
pub use ics::IcsSource;

/// Where events come from. A source that cannot vouch for the whole range
/// must return `FetchError::PartialData` rather than a short list.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, range: DateRange) -> Result<Vec<Event>, FetchError>;
}

/// The independently editable calendar events are mirrored into.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetCalendar: Send + Sync {
    async fn list_events(&self, range: DateRange) -> Result<Vec<TargetEvent>, TargetError>;

    /// Creates the event, or replaces `target_id` when given. Returns the
    /// copy as the target now stores it.
    async fn upsert_event(&self, event: &Event, target_id: Option<String>) -> Result<TargetEvent, TargetError>;

    /// Deleting something already gone is not an error.
    async fn delete_event(&self, target_id: &str) -> Result<(), TargetError>;
}
