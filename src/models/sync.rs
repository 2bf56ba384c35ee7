use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Records in these states still owe the target calendar a push.
    pub fn needs_push(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync status '{}'", other)),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of one tracked event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub event_id: String,
    pub content_hash: String,
    pub sync_status: SyncStatus,
    pub target_system_id: Option<String>,
    /// Hash of the target-side content at the last reconciliation.
    pub target_hash: Option<String>,
    /// Snapshot of the event as last fetched.
    pub event: Event,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn pending(event: Event, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id.clone(),
            content_hash: event.content_hash(),
            sync_status: SyncStatus::Pending,
            target_system_id: None,
            target_hash: None,
            event,
            updated_at: now,
        }
    }

    /// Same record carried forward to a newer source version, keeping the
    /// target linkage.
    pub fn advance(&self, event: Event, status: SyncStatus, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id.clone(),
            content_hash: event.content_hash(),
            sync_status: status,
            target_system_id: self.target_system_id.clone(),
            target_hash: self.target_hash.clone(),
            event,
            updated_at: now,
        }
    }
}

/// Audit-log action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    Push,
    KeepTarget,
    Conflict,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Push => "PUSH",
            Self::KeepTarget => "KEEP_TARGET",
            Self::Conflict => "CONFLICT",
        }
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "PUSH" => Ok(Self::Push),
            "KEEP_TARGET" => Ok(Self::KeepTarget),
            "CONFLICT" => Ok(Self::Conflict),
            other => Err(format!("unknown sync action '{}'", other)),
        }
    }
}

/// One append-only audit row. Never read back for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_id: String,
    pub action: SyncAction,
    pub source: String,
    pub target: String,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

impl SyncLogEntry {
    pub fn new(
        event_id: impl Into<String>,
        action: SyncAction,
        source: &str,
        target: &str,
        status: SyncStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: event_id.into(),
            action,
            source: source.to_string(),
            target: target.to_string(),
            status,
            error_message: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}
