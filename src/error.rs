use std::time::Duration;

use thiserror::Error;

use crate::models::{Event, PassState};

/// Failure reported by an event source while fetching a date range.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Fetch timed out: {0}")]
    Timeout(String),

    /// The source answered, but could not vouch for the whole range.
    /// The events it did return are still usable; deletions are not.
    #[error("Partial data ({} events): {reason}", events.len())]
    PartialData { events: Vec<Event>, reason: String },
}

impl FetchError {
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Network and timeout failures are worth another attempt; auth needs a human.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout(err.to_string());
        }
        match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => Self::Auth(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolutionError {
    #[error("target event {target_id} has no {field}; cannot merge")]
    IncompleteTarget {
        target_id: String,
        field: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Corrupt stored record {event_id}: {reason}")]
    Corrupt { event_id: String, reason: String },
}

/// Failure of one send attempt to one channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected: {0}")]
    PermanentRejection(String),
}

impl DeliveryError {
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Self::PermanentRejection(msg.into())
    }

    /// Classifies a non-success HTTP status from a channel provider.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let detail = format!("HTTP {}: {}", status, crate::utils::truncate_chars(body, 200));
        match status {
            401 | 403 => Self::Auth(detail),
            429 => Self::RateLimited { retry_after },
            408 | 500..=599 => Self::Network(detail),
            _ => Self::PermanentRejection(detail),
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Target authentication error: {0}")]
    Auth(String),

    #[error("Target network error: {0}")]
    Network(String),

    #[error("Target rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Target circuit open; skipping remaining calls this pass")]
    CircuitOpen,
}

impl From<reqwest::Error> for TargetError {
    fn from(err: reqwest::Error) -> Self {
        match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => Self::Auth(err.to_string()),
            _ => Self::Network(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Unrecoverable failure of a synchronization pass.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Pass exceeded its {0:?} budget")]
    Timeout(Duration),
}

impl SyncError {
    pub fn is_pii_safe(&self) -> bool {
        match self {
            Self::Persistence(_) => false,
            Self::Fetch(_) | Self::Timeout(_) => true,
        }
    }

    pub fn to_safe_string(&self) -> String {
        if self.is_pii_safe() {
            self.to_string()
        } else {
            "Event store operation failed".to_string()
        }
    }
}

/// A pass error tagged with the stage where it happened.
#[derive(Error, Debug)]
#[error("pass failed during {stage}: {source}")]
pub struct PassFailure {
    pub stage: PassState,
    #[source]
    pub source: SyncError,
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(PersistenceError::Storage(err))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
