//! Change detection between the event store and a fresh fetch.

use std::collections::HashMap;

use chrono_tz::Tz;
use log::{debug, warn};

use crate::models::{Coverage, DateRange, Event, EventChanges, SyncRecord, UpdatedEvent};

/// Classifies every fetched and stored event id in one pass over each list.
///
/// Events are matched by id only; two events with identical content but
/// different ids are distinct. A stored event missing from the fetch is
/// reported as deleted only when `coverage` is complete and its snapshot
/// overlaps `range`, the window the fetch asked for.
pub fn detect_changes(
    stored: Vec<SyncRecord>,
    fetched: Vec<Event>,
    coverage: Coverage,
    range: &DateRange,
    tz: &Tz,
) -> EventChanges {
    let mut known: HashMap<String, SyncRecord> =
        stored.into_iter().map(|r| (r.event_id.clone(), r)).collect();

    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut unchanged = Vec::new();

    for event in last_copy_per_id(fetched) {
        match known.remove(&event.id) {
            None => added.push(event),
            Some(record) if record.content_hash != event.content_hash() => {
                updated.push(UpdatedEvent { old: record.event, new: event })
            }
            Some(_) => unchanged.push(event),
        }
    }

    let mut leftover: Vec<SyncRecord> = known.into_values().collect();
    leftover.sort_by(|a, b| a.event_id.cmp(&b.event_id));
    let (leftover, out_of_range): (Vec<SyncRecord>, Vec<SyncRecord>) =
        leftover.into_iter().partition(|r| range.overlaps(&r.event, tz));

    let (deleted, retained) = match &coverage {
        Coverage::Complete => (leftover, Vec::new()),
        Coverage::Partial { reason } => {
            if !leftover.is_empty() {
                warn!(
                    "Partial fetch ({}); not inferring deletion for {} stored events",
                    reason,
                    leftover.len()
                );
            }
            (Vec::new(), leftover)
        }
    };

    debug!(
        "Detected {} added, {} updated, {} deleted, {} unchanged",
        added.len(),
        updated.len(),
        deleted.len(),
        unchanged.len()
    );

    EventChanges {
        added,
        updated,
        deleted,
        unchanged,
        retained,
        out_of_range,
        coverage,
    }
}

/// Drops repeated ids, keeping the position of the first copy and the
/// content of the last.
fn last_copy_per_id(fetched: Vec<Event>) -> Vec<Event> {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(fetched.len());
    let mut events: Vec<Event> = Vec::with_capacity(fetched.len());
    for event in fetched {
        match slots.get(&event.id) {
            Some(&slot) => {
                warn!("Source returned event {} more than once; keeping the last copy", event.id);
                events[slot] = event;
            }
            None => {
                slots.insert(event.id.clone(), events.len());
                events.push(event);
            }
        }
    }
    events
}
