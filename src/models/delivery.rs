use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

/// Outcome of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: ChannelId,
    pub notification_id: String,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn success(channel: ChannelId, notification_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            channel,
            notification_id: notification_id.into(),
            attempt,
            outcome: DeliveryOutcome::Success,
            error: None,
        }
    }

    pub fn failure(
        channel: ChannelId,
        notification_id: impl Into<String>,
        attempt: u32,
        permanent: bool,
        error: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            notification_id: notification_id.into(),
            attempt,
            outcome: if permanent {
                DeliveryOutcome::PermanentFailure
            } else {
                DeliveryOutcome::RetryableFailure
            },
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DeliveryOutcome::Success
    }
}

/// Per (notification, channel) state kept in the delivery ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery state '{}'", other)),
        }
    }
}

/// Ledger row change produced by a dispatch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUpdate {
    pub notification_id: String,
    pub channel: ChannelId,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_outcomes() {
        let ch = ChannelId::new("slack");
        let retry = DeliveryResult::failure(ch.clone(), "n1", 1, false, "timeout");
        assert_eq!(retry.outcome, DeliveryOutcome::RetryableFailure);
        let dead = DeliveryResult::failure(ch.clone(), "n1", 2, true, "HTTP 400");
        assert_eq!(dead.outcome, DeliveryOutcome::PermanentFailure);
        assert!(dead.error.is_some());

        let ok = DeliveryResult::success(ch, "n1", 3);
        assert!(ok.is_success());
        assert!(ok.error.is_none());
    }

    #[test]
    fn test_delivery_state_terminality() {
        assert!(!DeliveryState::Pending.is_terminal());
        assert!(DeliveryState::Delivered.is_terminal());
        assert!(DeliveryState::Failed.is_terminal());
        assert_eq!("failed".parse::<DeliveryState>().unwrap(), DeliveryState::Failed);
    }
}
