pub mod changes;
pub mod delivery;
pub mod event;
pub mod notification;
pub mod report;
pub mod sync;
pub mod target;

pub use changes::{ChangeSummary, Coverage, EventChanges, UpdatedEvent};
pub use delivery::{DeliveryOutcome, DeliveryResult, DeliveryState, LedgerUpdate};
pub use event::{local_to_utc, Event, EventTime};
pub use notification::{
    Agenda, ChannelId, EventLine, NotificationPayload, NotificationType, Priority,
    ScheduledNotification,
};
pub use report::{ChannelStats, PassReport, PassState, ResolutionSummary};
pub use sync::{SyncAction, SyncLogEntry, SyncRecord, SyncStatus};
pub use target::{DateRange, TargetEvent};
