use serde::{Deserialize, Serialize};

use super::{Event, SyncRecord};

/// How much of the requested range the fetch could vouch for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coverage {
    Complete,
    Partial { reason: String },
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedEvent {
    pub old: Event,
    pub new: Event,
}

impl UpdatedEvent {
    pub fn is_visible(&self) -> bool {
        self.old.visibly_differs(&self.new)
    }
}

/// Outcome of one change-detection run.
///
/// On a complete fetch `added`, `updated`, `deleted` and `unchanged`
/// partition every id seen in the store or the fetch. On a partial fetch
/// stored ids the source did not return land in `retained` instead of
/// `deleted`. Stored events lying wholly outside the fetched range were
/// never asked for, so they go to `out_of_range` whatever the coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventChanges {
    pub added: Vec<Event>,
    pub updated: Vec<UpdatedEvent>,
    pub deleted: Vec<SyncRecord>,
    pub unchanged: Vec<Event>,
    pub retained: Vec<SyncRecord>,
    pub out_of_range: Vec<SyncRecord>,
    pub coverage: Coverage,
}

impl EventChanges {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            added: self.added.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
            unchanged: self.unchanged.len(),
        }
    }

    /// Every event believed to exist after this pass: fetched events plus,
    /// on a partial fetch, the stored snapshots the source left out.
    pub fn current_events(&self) -> Vec<Event> {
        self.added
            .iter()
            .chain(self.updated.iter().map(|u| &u.new))
            .chain(self.unchanged.iter())
            .chain(self.retained.iter().map(|r| &r.event))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}
