use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::types::{NewNotification, NotificationRecord, NotificationStatus, StatusChange};

use super::{NotificationStore, classify_unapplied, ensure_terminal};

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_status(
        &self,
        transaction_id: &str,
    ) -> Result<Option<NotificationStatus>, AppError> {
        let row: Option<(NotificationStatus,)> =
            sqlx::query_as("SELECT status FROM notifications WHERE transaction_id = $1")
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(status,)| status))
    }
}

#[async_trait::async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, notification: NewNotification) -> Result<i64, AppError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (title, description, payload, transaction_id, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&notification.title)
        .bind(&notification.description)
        .bind(&notification.payload)
        .bind(&notification.transaction_id)
        .bind(notification.status.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<NotificationRecord>, AppError> {
        let record: Option<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT id, title, description, payload, transaction_id, status, created_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let record: Option<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT id, title, description, payload, transaction_id, status, created_at
            FROM notifications
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let records: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT id, title, description, payload, transaction_id, status, created_at
            FROM notifications
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_stale(
        &self,
        status: NotificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        // Served by idx_notifications_status_created_at
        let records: Vec<NotificationRecord> = sqlx::query_as(
            r#"
            SELECT id, title, description, payload, transaction_id, status, created_at
            FROM notifications
            WHERE status = $1 AND created_at < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_status_by_transaction_id(
        &self,
        transaction_id: &str,
        status: NotificationStatus,
    ) -> Result<StatusChange, AppError> {
        ensure_terminal(status)?;

        // A record inserted after the UPDATE took its snapshot reads back as
        // PROCESSING; one more attempt picks it up.
        for _ in 0..2 {
            let result = sqlx::query(
                r#"
                UPDATE notifications
                SET status = $1
                WHERE transaction_id = $2 AND status = 'PROCESSING'
                "#,
            )
            .bind(status.to_string())
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(StatusChange::Applied);
            }

            match self.current_status(transaction_id).await? {
                Some(NotificationStatus::Processing) => continue,
                current => return Ok(classify_unapplied(current, status)),
            }
        }

        tracing::warn!(
            transaction_id,
            requested = %status,
            "Record stayed PROCESSING across two conditional updates"
        );
        Ok(StatusChange::Missing)
    }
}
