//! Decides which content prevails when an event changed both in the
//! source and, by hand, in the target calendar.

use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConflictResolutionError;
use crate::models::{Event, SyncRecord, TargetEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[default]
    SourceWins,
    TargetWins,
    Merge,
    ManualReview,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "SOURCE_WINS" => Ok(Self::SourceWins),
            "TARGET_WINS" => Ok(Self::TargetWins),
            "MERGE" => Ok(Self::Merge),
            "MANUAL_REVIEW" => Ok(Self::ManualReview),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

/// How a single text field is chosen when merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRule {
    Source,
    Target,
    /// Longer of the two, source on ties.
    LongerText,
    /// Source unless it is empty.
    NonEmpty,
}

impl FieldRule {
    fn pick(&self, source: &str, target: &str) -> String {
        let chosen = match self {
            Self::Source => source,
            Self::Target => target,
            Self::LongerText => {
                if target.chars().count() > source.chars().count() {
                    target
                } else {
                    source
                }
            }
            Self::NonEmpty => {
                if source.trim().is_empty() {
                    target
                } else {
                    source
                }
            }
        };
        chosen.to_string()
    }
}

/// Field-level winners for `MERGE`. Start, end and the all-day flag always
/// come from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergePolicy {
    pub title: FieldRule,
    pub description: FieldRule,
    pub location: FieldRule,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            title: FieldRule::Source,
            description: FieldRule::LongerText,
            location: FieldRule::NonEmpty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write this content to the target.
    Push(Event),
    /// Leave the target's version alone and record the source change.
    KeepTarget,
    /// Exclude from automatic push and ask a human.
    ManualReview { reason: String },
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    policy: MergePolicy,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy, policy: MergePolicy) -> Self {
        Self { strategy, policy }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolves one source event against its target-side copy.
    ///
    /// A conflict exists only when the target copy changed since the last
    /// reconciliation (its hash differs from the recorded `target_hash`)
    /// and it no longer matches the source. Everything else is a plain push.
    pub fn resolve(
        &self,
        source: &Event,
        target: Option<&TargetEvent>,
        record: Option<&SyncRecord>,
    ) -> Resolution {
        let Some(target) = target else {
            return Resolution::Push(source.clone());
        };

        let current = target.content_hash();
        let reconciled = record.and_then(|r| r.target_hash.as_deref());
        let target_edited = current.as_deref() != reconciled;
        let differs = current.as_deref() != Some(source.content_hash().as_str());

        if !target_edited || !differs {
            return Resolution::Push(source.clone());
        }

        debug!(
            "Event {} changed on both sides; applying {:?}",
            source.id, self.strategy
        );

        match self.strategy {
            ConflictStrategy::SourceWins => Resolution::Push(source.clone()),
            ConflictStrategy::TargetWins => Resolution::KeepTarget,
            ConflictStrategy::ManualReview => Resolution::ManualReview {
                reason: "edited in both calendars since the last sync".to_string(),
            },
            ConflictStrategy::Merge => match self.merge(source, target) {
                Ok(merged) => Resolution::Push(merged),
                Err(e) => {
                    warn!("Merge failed for {}: {}; needs manual review", source.id, e);
                    Resolution::ManualReview { reason: e.to_string() }
                }
            },
        }
    }

    /// Deterministic field-level merge. Applying it again to its own output
    /// with the same source yields the same event.
    pub fn merge(&self, source: &Event, target: &TargetEvent) -> Result<Event, ConflictResolutionError> {
        let target = target.to_event(&source.id)?;
        Ok(Event {
            id: source.id.clone(),
            title: self.policy.title.pick(&source.title, &target.title),
            description: self.policy.description.pick(&source.description, &target.description),
            location: self.policy.location.pick(&source.location, &target.location),
            start: source.start,
            end: source.end,
        })
    }
}
