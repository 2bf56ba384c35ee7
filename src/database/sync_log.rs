use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::models::SyncLogEntry;

#[derive(FromRow)]
struct SyncLogRow {
    timestamp: DateTime<Utc>,
    event_id: String,
    action: String,
    source: String,
    target: String,
    status: String,
    error_message: Option<String>,
}

impl TryFrom<SyncLogRow> for SyncLogEntry {
    type Error = anyhow::Error;

    fn try_from(row: SyncLogRow) -> Result<Self> {
        Ok(SyncLogEntry {
            timestamp: row.timestamp,
            event_id: row.event_id,
            action: row.action.parse().map_err(|e: String| anyhow!(e))?,
            source: row.source,
            target: row.target,
            status: row.status.parse().map_err(|e: String| anyhow!(e))?,
            error_message: row.error_message,
        })
    }
}

pub(crate) async fn append(conn: &mut SqliteConnection, entry: &SyncLogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (timestamp, event_id, action, source, target, status, error_message)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.timestamp)
    .bind(&entry.event_id)
    .bind(entry.action.as_str())
    .bind(&entry.source)
    .bind(&entry.target)
    .bind(entry.status.as_str())
    .bind(&entry.error_message)
    .execute(&mut *conn)
    .await
    .context("Failed to append sync log entry")?;

    Ok(())
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncLogEntry>> {
    let rows = sqlx::query_as::<_, SyncLogRow>(
        r#"
        SELECT timestamp, event_id, action, source, target, status, error_message
        FROM sync_log
        ORDER BY timestamp DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SyncLogEntry::try_from).collect()
}

pub async fn for_event(pool: &SqlitePool, event_id: &str) -> Result<Vec<SyncLogEntry>> {
    let rows = sqlx::query_as::<_, SyncLogRow>(
        r#"
        SELECT timestamp, event_id, action, source, target, status, error_message
        FROM sync_log
        WHERE event_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SyncLogEntry::try_from).collect()
}
