use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{ChannelId, DeliveryState};

/// Dedup key for one notification on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub notification_id: String,
    pub channel: ChannelId,
}

impl PendingKey {
    pub fn new(notification_id: impl Into<String>, channel: ChannelId) -> Self {
        Self {
            notification_id: notification_id.into(),
            channel,
        }
    }

    /// Same key, same UUID, on every attempt and every run.
    pub fn idempotency_key(&self) -> Uuid {
        let name = format!("{}|{}", self.notification_id, self.channel);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

/// Deliveries in flight, shared by all channel workers of one dispatch.
/// A key moves from pending to settled exactly once.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    pending: Arc<DashMap<PendingKey, u32>>,
    settled: Arc<DashMap<PendingKey, DeliveryState>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// False when the key is already pending or settled.
    pub fn insert(&self, key: PendingKey) -> bool {
        if self.settled.contains_key(&key) {
            return false;
        }
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(0);
                true
            }
        }
    }

    pub fn is_pending(&self, key: &PendingKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Counts an attempt; returns the running total, or `None` if the key is
    /// not pending.
    pub fn record_attempt(&self, key: &PendingKey) -> Option<u32> {
        self.pending.get_mut(key).map(|mut attempts| {
            *attempts += 1;
            *attempts
        })
    }

    /// Moves the key to its terminal state and returns the attempts made.
    pub fn settle(&self, key: &PendingKey, state: DeliveryState) -> Option<u32> {
        let (key, attempts) = self.pending.remove(key)?;
        self.settled.insert(key, state);
        Some(attempts)
    }

    pub fn state(&self, key: &PendingKey) -> Option<DeliveryState> {
        if self.pending.contains_key(key) {
            return Some(DeliveryState::Pending);
        }
        self.settled.get(key).map(|state| *state)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn attempts(&self, key: &PendingKey) -> u32 {
        self.pending.get(key).map(|a| *a).unwrap_or(0)
    }
}
