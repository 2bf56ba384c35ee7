//! Last complete source fetch, kept on disk for degraded passes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::{DateRange, Event};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFetch {
    pub fetched_at: DateTime<Utc>,
    pub range: DateRange,
    pub events: Vec<Event>,
}

pub struct FetchCache {
    path: PathBuf,
    max_age: Duration,
}

impl FetchCache {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes through a temporary file so a crash never leaves half a cache.
    pub async fn store(&self, fetch: &CachedFetch) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        let json = serde_json::to_vec(fetch).context("serializing fetch cache")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        debug!("Cached {} events at {}", fetch.events.len(), self.path.display());
        Ok(())
    }

    /// The cached fetch if one exists and is younger than `max_age`.
    /// A missing, stale or unreadable cache yields `None`.
    pub async fn load_fresh(&self, now: DateTime<Utc>) -> Option<CachedFetch> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read fetch cache {}: {}", self.path.display(), e);
                return None;
            }
        };

        let cached: CachedFetch = match serde_json::from_slice(&bytes) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring corrupt fetch cache {}: {}", self.path.display(), e);
                return None;
            }
        };

        let age = (now - cached.fetched_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.max_age {
            debug!("Fetch cache is {}s old, ignoring", age.as_secs());
            return None;
        }
        Some(cached)
    }
}
