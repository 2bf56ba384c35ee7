use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangeSummary, ChannelId, DeliveryResult};

/// Stages of one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassState {
    Fetching,
    Detecting,
    Resolving,
    Persisting,
    Scheduling,
    Dispatching,
    Done,
    Failed,
}

impl PassState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetching => "FETCHING",
            Self::Detecting => "DETECTING",
            Self::Resolving => "RESOLVING",
            Self::Persisting => "PERSISTING",
            Self::Scheduling => "SCHEDULING",
            Self::Dispatching => "DISPATCHING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub attempts: u32,
    pub delivered: u32,
    pub failed: u32,
    pub rate_limit_waits: u32,
}

impl ChannelStats {
    pub fn merge(&mut self, other: &ChannelStats) {
        self.attempts += other.attempts;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.rate_limit_waits += other.rate_limit_waits;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    pub pushed: usize,
    pub kept_target: usize,
    pub manual_review: usize,
    pub push_failures: usize,
    pub target_deletes: usize,
}

/// Aggregate result of a pass, produced even when the pass fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PassState,
    /// Stage that failed, when `state` is `Failed`.
    pub failed_stage: Option<PassState>,
    pub error: Option<String>,
    pub partial_fetch: Option<String>,
    pub used_cache: bool,
    pub changes: ChangeSummary,
    pub resolution: ResolutionSummary,
    pub notifications_scheduled: usize,
    pub deliveries: Vec<DeliveryResult>,
    pub permanent_failures: Vec<DeliveryResult>,
    pub channel_stats: BTreeMap<ChannelId, ChannelStats>,
}

impl PassReport {
    pub fn new(pass_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id: pass_id.into(),
            started_at,
            finished_at: None,
            state: PassState::Fetching,
            failed_stage: None,
            error: None,
            partial_fetch: None,
            used_cache: false,
            changes: ChangeSummary::default(),
            resolution: ResolutionSummary::default(),
            notifications_scheduled: 0,
            deliveries: Vec::new(),
            permanent_failures: Vec::new(),
            channel_stats: BTreeMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == PassState::Done
    }

    pub fn delivered_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_success()).count()
    }
}
