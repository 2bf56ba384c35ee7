use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePool, Row, Sqlite};

use crate::models::{
    ChannelId, DeliveryState, LedgerUpdate, ScheduledNotification, SyncLogEntry, SyncRecord,
};
use crate::utils::logging::log_database_operation;

pub mod notifications;
pub mod records;
pub mod sync_log;

pub use records::StoreBatch;

/// The event store. Only the orchestrator's persisting step writes
/// `sync_records`; the scheduler and dispatcher own the queue tables.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let db_exists = Sqlite::database_exists(&db_url)
            .await
            .context("Failed to check if database exists")?;
        if !db_exists {
            info!("Creating event store at {}", path.display());
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePool::connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        run_schema(&pool).await.context("Failed to run database schema")?;

        info!("Event store initialized");

        Ok(Database { pool })
    }

    // --- Record Delegates ---

    pub async fn load_records(&self) -> Result<Vec<SyncRecord>> {
        records::load_all(&self.pool).await
    }

    pub async fn get_record(&self, event_id: &str) -> Result<Option<SyncRecord>> {
        records::get(&self.pool, event_id).await
    }

    /// Applies record upserts, deletes and their audit rows atomically.
    pub async fn commit(&self, batch: &StoreBatch) -> Result<()> {
        let started = std::time::Instant::now();
        records::commit(&self.pool, batch).await?;
        log_database_operation("commit", "sync_records", started.elapsed().as_millis() as u64);
        Ok(())
    }

    // --- Audit Log Delegates ---

    pub async fn recent_sync_log(&self, limit: i64) -> Result<Vec<SyncLogEntry>> {
        sync_log::recent(&self.pool, limit).await
    }

    pub async fn sync_log_for_event(&self, event_id: &str) -> Result<Vec<SyncLogEntry>> {
        sync_log::for_event(&self.pool, event_id).await
    }

    // --- Notification Queue Delegates ---

    pub async fn enqueue_notifications(&self, batch: &[ScheduledNotification]) -> Result<usize> {
        notifications::enqueue(&self.pool, batch).await
    }

    pub async fn ledger_states(&self) -> Result<Vec<(String, ChannelId, DeliveryState)>> {
        notifications::ledger_states(&self.pool).await
    }

    pub async fn due_notifications(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledNotification>> {
        notifications::due(&self.pool, now).await
    }

    pub async fn apply_ledger_updates(&self, updates: &[LedgerUpdate]) -> Result<()> {
        notifications::apply_ledger_updates(&self.pool, updates).await
    }

    pub async fn remove_settled_notifications(&self) -> Result<u64> {
        notifications::remove_settled(&self.pool).await
    }

    pub async fn cancel_notifications_for_events(&self, event_ids: &[String]) -> Result<u64> {
        notifications::cancel_for_events(&self.pool, event_ids).await
    }

    // --- Maintenance ---

    /// Drops audit rows, settled ledger rows and stale queue rows older than
    /// `retention_days`. Sync records are state, not history, and are kept.
    pub async fn cleanup_old_data(&self, retention_days: u32) -> Result<CleanupReport> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut tx = self.pool.begin().await?;

        let sync_log_rows = sqlx::query("DELETE FROM sync_log WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("Failed to prune sync log")?
            .rows_affected();

        let ledger_rows =
            sqlx::query("DELETE FROM delivery_ledger WHERE status != 'pending' AND updated_at < ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .context("Failed to prune delivery ledger")?
                .rows_affected();

        let queue_rows = sqlx::query("DELETE FROM notification_queue WHERE scheduled_time < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .context("Failed to prune notification queue")?
            .rows_affected();

        sqlx::query(
            "DELETE FROM delivery_ledger WHERE status = 'pending' AND notification_id NOT IN \
             (SELECT notification_id FROM notification_queue)",
        )
        .execute(&mut *tx)
        .await
        .context("Failed to prune orphaned ledger rows")?;

        tx.commit().await?;

        let report = CleanupReport {
            sync_log_rows,
            ledger_rows,
            queue_rows,
        };
        info!(
            "Cleanup removed {} log rows, {} ledger rows, {} queued notifications",
            report.sync_log_rows, report.ledger_rows, report.queue_rows
        );
        Ok(report)
    }

    pub async fn storage_statistics(&self) -> Result<StorageStats> {
        let mut records_by_status = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT sync_status, COUNT(*) AS n FROM sync_records GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            records_by_status.insert(row.get::<String, _>("sync_status"), row.get::<i64, _>("n"));
        }

        let mut ledger_by_status = BTreeMap::new();
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM delivery_ledger GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for row in rows {
            ledger_by_status.insert(row.get::<String, _>("status"), row.get::<i64, _>("n"));
        }

        let sync_log_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_log")
            .fetch_one(&self.pool)
            .await?;
        let queued_notifications: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notification_queue")
                .fetch_one(&self.pool)
                .await?;

        Ok(StorageStats {
            records_by_status,
            sync_log_rows,
            queued_notifications,
            ledger_by_status,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sync_log_rows: u64,
    pub ledger_rows: u64,
    pub queue_rows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub records_by_status: BTreeMap<String, i64>,
    pub sync_log_rows: i64,
    pub queued_notifications: i64,
    pub ledger_by_status: BTreeMap<String, i64>,
}

async fn run_schema(pool: &SqlitePool) -> Result<()> {
    let schema = include_str!("schema.sql");

    let mut current_statement = String::new();
    for line in schema.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") || trimmed.is_empty() {
            continue;
        }

        current_statement.push_str(line);
        current_statement.push('\n');

        if trimmed.ends_with(';') {
            sqlx::query(&current_statement).execute(pool).await?;
            current_statement.clear();
        }
    }
    Ok(())
}
