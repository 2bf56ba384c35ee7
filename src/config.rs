//! Configuration surface.
//!
//! Loaded once from TOML at startup, adjusted by a few environment
//! overrides, validated, then passed by value into the orchestrator.
//! Nothing here is global.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::calendar::ics::validate_ics_url_format;
use crate::conflict::{ConflictStrategy, MergePolicy};
use crate::error::ConfigError;
use crate::models::NotificationType;
use crate::utils::retry::RetryConfig;

pub const CONFIG_ENV: &str = "EVENTRELAY_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: Option<PathBuf>,
    pub timezone: String,
    pub retention_days: u32,
    pub source: SourceConfig,
    pub target: Option<TargetConfig>,
    pub conflict: ConflictConfig,
    pub schedule: ScheduleConfig,
    pub dispatch: DispatchConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            timezone: "Asia/Tokyo".to_string(),
            retention_days: 30,
            source: SourceConfig::default(),
            target: None,
            conflict: ConflictConfig::default(),
            schedule: ScheduleConfig::default(),
            dispatch: DispatchConfig::default(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub ics_url: Option<String>,
    pub lookback_days: u32,
    pub lookahead_days: u32,
    pub timeout_secs: u64,
    pub cache_path: Option<PathBuf>,
    pub cache_max_age_hours: u64,
    /// Fall back to the last complete fetch when the source stays down.
    /// Cached data is treated as partial coverage, so nothing is deleted.
    pub cache_fallback: bool,
    pub retry: RetrySettings,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            ics_url: None,
            lookback_days: 1,
            lookahead_days: 14,
            timeout_secs: 60,
            cache_path: None,
            cache_max_age_hours: 48,
            cache_fallback: false,
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 2000,
                ..RetrySettings::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub calendar_id: String,
    pub access_token: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_target_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,
}

fn default_target_timeout() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
    pub merge: MergePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local `HH:MM` at which each day's summary goes out.
    pub daily_summary_time: String,
    /// How many days of summaries to keep queued, today included.
    pub summary_days: u32,
    pub event_added_lookahead_hours: u64,
    pub reminder_offsets_minutes: Vec<u32>,
    pub reminder_horizon_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_summary_time: "06:00".to_string(),
            summary_days: 1,
            event_added_lookahead_hours: 24 * 7,
            reminder_offsets_minutes: vec![15, 60],
            reminder_horizon_hours: 48,
        }
    }
}

impl ScheduleConfig {
    pub fn summary_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.daily_summary_time, "%H:%M").map_err(|_| {
            ConfigError::invalid(format!(
                "daily_summary_time '{}' is not HH:MM",
                self.daily_summary_time
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub pass_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { pass_timeout_secs: 300 }
    }
}

/// Serializable retry knobs; converted into [`RetryConfig`] at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Ceiling for one attempt; expiry counts as a retryable failure.
    pub attempt_timeout_secs: u64,
    /// Rate-limit waits allowed per delivery, on top of `max_attempts`.
    pub max_rate_limit_waits: u32,
    pub default_rate_limit_wait_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout_secs: 30,
            max_rate_limit_waits: 5,
            default_rate_limit_wait_secs: 60,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }

    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(format!("{}: max_attempts must be at least 1", owner)));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(format!(
                "{}: backoff_multiplier must be >= 1.0",
                owner
            )));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::invalid(format!("{}: attempt_timeout_secs must be positive", owner)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_sends: u32,
    pub per_seconds: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.per_seconds)
    }
}

/// Closed set of delivery channel kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelKind {
    Slack {
        webhook_url: String,
    },
    Discord {
        webhook_url: String,
    },
    Line {
        access_token: String,
        to: String,
        #[serde(default)]
        api_base: Option<String>,
    },
    /// Voice-assistant bridge taking spoken text through a webhook.
    Voice {
        webhook_url: String,
    },
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Slack { .. } => "slack",
            Self::Discord { .. } => "discord",
            Self::Line { .. } => "line",
            Self::Voice { .. } => "voice",
        }
    }

    pub fn default_rate_limit(&self) -> RateLimitConfig {
        match self {
            Self::Voice { .. } => RateLimitConfig { max_sends: 10, per_seconds: 60 },
            Self::Slack { .. } | Self::Discord { .. } | Self::Line { .. } => {
                RateLimitConfig { max_sends: 30, per_seconds: 60 }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Notification types this channel receives; everything when absent.
    #[serde(default)]
    pub notify: Option<Vec<NotificationType>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChannelConfig {
    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.unwrap_or_else(|| self.kind.default_rate_limit())
    }

    pub fn accepts(&self, notification_type: NotificationType) -> bool {
        self.notify
            .as_ref()
            .map(|types| types.contains(&notification_type))
            .unwrap_or(true)
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventrelay")
        .join("config.toml")
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventrelay")
        .join("eventrelay.db")
}

impl Config {
    /// Reads `$EVENTRELAY_CONFIG` or the per-user default path, applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut config = if path.exists() || explicit.is_some() {
            info!("Loading configuration from {}", path.display());
            Self::from_file(&path)?
        } else {
            warn!("No config file at {}; using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(path) = std::env::var("EVENTRELAY_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("EVENTRELAY_ICS_URL") {
            self.source.ics_url = Some(url);
        }
        if let Ok(tz) = std::env::var("EVENTRELAY_TIMEZONE") {
            self.timezone = tz;
        }
        if let Ok(strategy) = std::env::var("EVENTRELAY_CONFLICT_STRATEGY") {
            self.conflict.strategy = strategy.parse().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        self.schedule.summary_time()?;

        if self.schedule.reminder_offsets_minutes.iter().any(|m| *m == 0) {
            return Err(ConfigError::invalid("reminder offsets must be positive"));
        }
        if self.dispatch.pass_timeout_secs == 0 {
            return Err(ConfigError::invalid("pass_timeout_secs must be positive"));
        }
        if self.source.timeout_secs == 0 {
            return Err(ConfigError::invalid("source timeout_secs must be positive"));
        }
        self.source.retry.validate("source")?;

        if let Some(url) = &self.source.ics_url {
            validate_ics_url_format(url).map_err(ConfigError::Invalid)?;
        }

        if let Some(target) = &self.target {
            if target.calendar_id.trim().is_empty() {
                return Err(ConfigError::invalid("target calendar_id is empty"));
            }
            if target.access_token.trim().is_empty() {
                return Err(ConfigError::invalid("target access_token is empty"));
            }
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(ConfigError::invalid("channel id is empty"));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate channel id '{}'", channel.id)));
            }
            let limit = channel.rate_limit();
            if limit.max_sends == 0 || limit.per_seconds == 0 {
                return Err(ConfigError::invalid(format!(
                    "channel '{}': rate limit must allow at least one send per window",
                    channel.id
                )));
            }
            channel.retry.validate(&format!("channel '{}'", channel.id))?;
        }
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::invalid(format!("unknown timezone '{}'", self.timezone)))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(default_database_path)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.source.cache_path.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("eventrelay")
                .join("fetch-cache.json")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
timezone = "Europe/Berlin"
retention_days = 14

[source]
ics_url = "https://calendar.example.com/feed.ics"
lookahead_days = 30

[target]
calendar_id = "primary"
access_token = "ya29.token"

[conflict]
strategy = "MERGE"

[conflict.merge]
title = "target"

[schedule]
daily_summary_time = "07:30"
reminder_offsets_minutes = [10]

[[channels]]
id = "team-slack"
kind = "slack"
webhook_url = "https://hooks.slack.com/services/T/B/X"
notify = ["daily-summary", "reminder"]

[[channels]]
id = "phone"
kind = "line"
access_token = "line-token"
to = "U1234"
rate_limit = { max_sends = 2, per_seconds = 60 }

[channels.retry]
max_attempts = 5
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tz().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.retention_days, 14);
        assert_eq!(config.source.lookahead_days, 30);
        assert_eq!(config.source.lookback_days, 1);
        assert_eq!(config.conflict.strategy, ConflictStrategy::Merge);
        assert_eq!(config.conflict.merge.title, crate::conflict::FieldRule::Target);
        assert_eq!(config.conflict.merge.description, crate::conflict::FieldRule::LongerText);
        assert_eq!(
            config.schedule.summary_time().unwrap(),
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );

        assert_eq!(config.channels.len(), 2);
        let slack = &config.channels[0];
        assert_eq!(slack.kind.name(), "slack");
        assert!(slack.accepts(NotificationType::Reminder));
        assert!(!slack.accepts(NotificationType::EventAdded));
        assert_eq!(slack.rate_limit(), RateLimitConfig { max_sends: 30, per_seconds: 60 });

        let line = &config.channels[1];
        assert_eq!(line.rate_limit().max_sends, 2);
        assert_eq!(line.retry.max_attempts, 5);
        assert_eq!(line.retry.backoff_multiplier, 2.0);
        assert!(line.accepts(NotificationType::EventAdded));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.schedule.reminder_offsets_minutes, vec![15, 60]);
        assert_eq!(config.source.cache_max_age_hours, 48);
        assert!(!config.source.cache_fallback);
        assert!(config.target.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.schedule.daily_summary_time = "6am".into();
        assert!(config.validate().is_err());

        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.channels[1].id = "team-slack".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")));

        let mut config = Config::default();
        config.source.ics_url = Some("http://localhost/feed.ics".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_channel_kind_is_parse_error() {
        let text = r#"
[[channels]]
id = "x"
kind = "carrier-pigeon"
"#;
        assert!(matches!(Config::from_toml_str(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("EVENTRELAY_TIMEZONE", "UTC");
        std::env::set_var("EVENTRELAY_CONFLICT_STRATEGY", "manual_review");
        let mut config = Config::default();
        let result = config.apply_env_overrides();
        std::env::remove_var("EVENTRELAY_TIMEZONE");
        std::env::remove_var("EVENTRELAY_CONFLICT_STRATEGY");

        result.unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.conflict.strategy, ConflictStrategy::ManualReview);
    }

    #[test]
    #[serial]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let loaded = Config::load();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(loaded.unwrap().channels.len(), 2);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_path_is_error() {
        std::env::set_var(CONFIG_ENV, "/nonexistent/eventrelay.toml");
        let loaded = Config::load();
        std::env::remove_var(CONFIG_ENV);
        assert!(matches!(loaded, Err(ConfigError::Io { .. })));
    }
}
