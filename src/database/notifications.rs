use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::{FromRow, SqlitePool};

use crate::models::{
    ChannelId, DeliveryState, LedgerUpdate, NotificationType, Priority, ScheduledNotification,
};

#[derive(FromRow)]
struct DueRow {
    notification_id: String,
    notification_type: String,
    event_id: Option<String>,
    scheduled_time: DateTime<Utc>,
    priority: i64,
    payload: String,
    channel: String,
}

/// Inserts or refreshes queue rows and opens a pending ledger row per
/// channel. Delivered ledger rows are never reopened; failed ones are
/// reopened only because the scheduler chose to retarget them.
pub async fn enqueue(pool: &SqlitePool, batch: &[ScheduledNotification]) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    for notification in batch {
        let channels = serde_json::to_string(&notification.channels)?;
        let payload = serde_json::to_string(&notification.payload)?;

        sqlx::query(
            r#"
            INSERT INTO notification_queue
                (notification_id, notification_type, event_id, scheduled_time, priority, channels, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(notification_id) DO UPDATE SET
                scheduled_time = excluded.scheduled_time,
                priority = excluded.priority,
                channels = excluded.channels,
                payload = excluded.payload
            "#,
        )
        .bind(&notification.id)
        .bind(notification.notification_type.as_str())
        .bind(&notification.event_id)
        .bind(notification.scheduled_time)
        .bind(notification.priority.level())
        .bind(channels)
        .bind(payload)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to queue notification {}", notification.id))?;

        for channel in &notification.channels {
            sqlx::query(
                r#"
                INSERT INTO delivery_ledger (notification_id, channel, status, attempts, updated_at)
                VALUES (?, ?, 'pending', 0, ?)
                ON CONFLICT(notification_id, channel) DO UPDATE SET
                    status = 'pending',
                    attempts = 0,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                WHERE delivery_ledger.status = 'failed'
                "#,
            )
            .bind(&notification.id)
            .bind(channel.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    debug!("Queued {} notifications", batch.len());
    Ok(batch.len())
}

pub async fn ledger_states(pool: &SqlitePool) -> Result<Vec<(String, ChannelId, DeliveryState)>> {
    let rows: Vec<(String, String, String)> =
        sqlx::query_as("SELECT notification_id, channel, status FROM delivery_ledger")
            .fetch_all(pool)
            .await?;

    rows.into_iter()
        .map(|(id, channel, status)| {
            let state = status.parse().map_err(|e: String| anyhow!(e))?;
            Ok((id, ChannelId::new(channel), state))
        })
        .collect()
}

/// Notifications whose time has come, restricted to the channels that
/// still have a pending ledger row. Ordered by (scheduled_time, id).
pub async fn due(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<ScheduledNotification>> {
    let rows = sqlx::query_as::<_, DueRow>(
        r#"
        SELECT q.notification_id, q.notification_type, q.event_id, q.scheduled_time,
               q.priority, q.payload, l.channel
        FROM notification_queue q
        JOIN delivery_ledger l ON l.notification_id = q.notification_id
        WHERE q.scheduled_time <= ? AND l.status = 'pending'
        ORDER BY q.scheduled_time ASC, q.notification_id ASC, l.channel ASC
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut due: Vec<ScheduledNotification> = Vec::new();
    for row in rows {
        if let Some(last) = due.last_mut() {
            if last.id == row.notification_id {
                last.channels.insert(ChannelId::new(row.channel));
                continue;
            }
        }
        let notification_type: NotificationType =
            row.notification_type.parse().map_err(|e: String| anyhow!(e))?;
        let payload = serde_json::from_str(&row.payload)
            .with_context(|| format!("Corrupt payload for {}", row.notification_id))?;
        due.push(ScheduledNotification {
            id: row.notification_id,
            notification_type,
            event_id: row.event_id,
            scheduled_time: row.scheduled_time,
            priority: Priority::from_level(row.priority),
            channels: [ChannelId::new(row.channel)].into_iter().collect(),
            payload,
        });
    }
    Ok(due)
}

pub async fn apply_ledger_updates(pool: &SqlitePool, updates: &[LedgerUpdate]) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for update in updates {
        sqlx::query(
            r#"
            UPDATE delivery_ledger
            SET status = ?, attempts = attempts + ?, last_error = ?, updated_at = ?
            WHERE notification_id = ? AND channel = ?
            "#,
        )
        .bind(update.state.as_str())
        .bind(update.attempts as i64)
        .bind(&update.last_error)
        .bind(now)
        .bind(&update.notification_id)
        .bind(update.channel.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Deletes queue rows whose every channel has settled. Ledger rows stay
/// behind as the idempotency record.
pub async fn remove_settled(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM notification_queue
        WHERE NOT EXISTS (
            SELECT 1 FROM delivery_ledger l
            WHERE l.notification_id = notification_queue.notification_id
              AND l.status = 'pending'
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Withdraws undelivered notifications about events that no longer exist.
pub async fn cancel_for_events(pool: &SqlitePool, event_ids: &[String]) -> Result<u64> {
    if event_ids.is_empty() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut tx = pool.begin().await?;
    for event_id in event_ids {
        sqlx::query(
            r#"
            DELETE FROM delivery_ledger
            WHERE status = 'pending'
              AND notification_id IN (SELECT notification_id FROM notification_queue WHERE event_id = ?)
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

        removed += sqlx::query("DELETE FROM notification_queue WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::create_test_database;
    use crate::models::{EventLine, EventTime, NotificationPayload};
    use chrono::{Duration, NaiveDate};
    use std::collections::BTreeSet;

    fn reminder(event_id: &str, at: DateTime<Utc>, channels: &[&str]) -> ScheduledNotification {
        let line = EventLine {
            event_id: event_id.into(),
            title: "Standup".into(),
            start: EventTime::Date(NaiveDate::from_ymd_opt(2025, 9, 1).unwrap()),
            end: None,
            location: String::new(),
        };
        ScheduledNotification {
            id: ScheduledNotification::reminder_id(event_id, 15),
            notification_type: NotificationType::Reminder,
            event_id: Some(event_id.into()),
            scheduled_time: at,
            priority: Priority::High,
            channels: channels.iter().map(|c| ChannelId::new(*c)).collect::<BTreeSet<_>>(),
            payload: NotificationPayload::Reminder { event: line, minutes_before: 15 },
        }
    }

    #[tokio::test]
    async fn test_enqueue_twice_keeps_one_row_per_channel() {
        let db = create_test_database().await;
        let n = reminder("e1", Utc::now(), &["slack", "line"]);
        db.enqueue_notifications(&[n.clone()]).await.unwrap();
        db.enqueue_notifications(&[n]).await.unwrap();

        let states = db.ledger_states().await.unwrap();
        assert_eq!(states.len(), 2);
        let stats = db.storage_statistics().await.unwrap();
        assert_eq!(stats.queued_notifications, 1);
    }

    #[tokio::test]
    async fn test_due_groups_pending_channels() {
        let db = create_test_database().await;
        let now = Utc::now();
        db.enqueue_notifications(&[
            reminder("past", now - Duration::minutes(5), &["slack", "line"]),
            reminder("future", now + Duration::hours(2), &["slack"]),
        ])
        .await
        .unwrap();

        let due = db.due_notifications(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_id.as_deref(), Some("past"));
        assert_eq!(due[0].channels.len(), 2);
    }

    #[tokio::test]
    async fn test_delivered_rows_are_not_reopened() {
        let db = create_test_database().await;
        let n = reminder("e1", Utc::now() - Duration::minutes(1), &["slack"]);
        db.enqueue_notifications(&[n.clone()]).await.unwrap();
        db.apply_ledger_updates(&[LedgerUpdate {
            notification_id: n.id.clone(),
            channel: ChannelId::new("slack"),
            state: DeliveryState::Delivered,
            attempts: 1,
            last_error: None,
        }])
        .await
        .unwrap();
        assert_eq!(db.remove_settled_notifications().await.unwrap(), 1);

        db.enqueue_notifications(&[n]).await.unwrap();
        assert!(db.due_notifications(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_for_deleted_event() {
        let db = create_test_database().await;
        db.enqueue_notifications(&[reminder("gone", Utc::now(), &["slack"])])
            .await
            .unwrap();
        assert_eq!(db.cancel_notifications_for_events(&["gone".to_string()]).await.unwrap(), 1);
        assert!(db.due_notifications(Utc::now()).await.unwrap().is_empty());
        assert!(db.ledger_states().await.unwrap().is_empty());
    }
}
