use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use super::sync_log;
use crate::error::PersistenceError;
use crate::models::{SyncLogEntry, SyncRecord};

/// Everything one persisting step writes, committed in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    pub upserts: Vec<SyncRecord>,
    pub deletes: Vec<String>,
    pub log: Vec<SyncLogEntry>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.log.is_empty()
    }
}

#[derive(FromRow)]
struct SyncRecordRow {
    event_id: String,
    content_hash: String,
    sync_status: String,
    target_system_id: Option<String>,
    target_hash: Option<String>,
    event_data: String,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SyncRecordRow> for SyncRecord {
    type Error = PersistenceError;

    fn try_from(row: SyncRecordRow) -> Result<Self, Self::Error> {
        let sync_status = row.sync_status.parse().map_err(|reason| PersistenceError::Corrupt {
            event_id: row.event_id.clone(),
            reason,
        })?;
        let event = serde_json::from_str(&row.event_data).map_err(|e| PersistenceError::Corrupt {
            event_id: row.event_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(SyncRecord {
            event_id: row.event_id,
            content_hash: row.content_hash,
            sync_status,
            target_system_id: row.target_system_id,
            target_hash: row.target_hash,
            event,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_RECORDS: &str = r#"
    SELECT event_id, content_hash, sync_status, target_system_id, target_hash,
           event_data, updated_at
    FROM sync_records
"#;

pub async fn load_all(pool: &SqlitePool) -> Result<Vec<SyncRecord>> {
    let rows = sqlx::query_as::<_, SyncRecordRow>(&format!("{} ORDER BY event_id", SELECT_RECORDS))
        .fetch_all(pool)
        .await
        .context("Failed to load sync records")?;

    rows.into_iter()
        .map(|row| SyncRecord::try_from(row).map_err(anyhow::Error::from))
        .collect()
}

pub async fn get(pool: &SqlitePool, event_id: &str) -> Result<Option<SyncRecord>> {
    let row = sqlx::query_as::<_, SyncRecordRow>(&format!("{} WHERE event_id = ?", SELECT_RECORDS))
        .bind(event_id)
        .fetch_optional(pool)
        .await?;

    row.map(SyncRecord::try_from).transpose().map_err(anyhow::Error::from)
}

pub async fn commit(pool: &SqlitePool, batch: &StoreBatch) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await.context("Failed to begin store transaction")?;

    for record in &batch.upserts {
        upsert(&mut tx, record)
            .await
            .with_context(|| format!("Failed to write record {}", record.event_id))?;
    }

    for event_id in &batch.deletes {
        sqlx::query("DELETE FROM sync_records WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to delete record {}", event_id))?;
    }

    for entry in &batch.log {
        sync_log::append(&mut tx, entry).await?;
    }

    tx.commit().await.context("Failed to commit store transaction")?;
    Ok(())
}

async fn upsert(conn: &mut SqliteConnection, record: &SyncRecord) -> Result<()> {
    let event_data = serde_json::to_string(&record.event)?;

    sqlx::query(
        r#"
        INSERT INTO sync_records
            (event_id, content_hash, sync_status, target_system_id, target_hash, event_data, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(event_id) DO UPDATE SET
            content_hash = excluded.content_hash,
            sync_status = excluded.sync_status,
            target_system_id = excluded.target_system_id,
            target_hash = excluded.target_hash,
            event_data = excluded.event_data,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.event_id)
    .bind(&record.content_hash)
    .bind(record.sync_status.as_str())
    .bind(&record.target_system_id)
    .bind(&record.target_hash)
    .bind(event_data)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
