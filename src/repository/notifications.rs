//! Notifications repository for database operations

use sqlx::{Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::notification::{NewNotification, Notification},
};

const NOTIFICATION_COLUMNS: &str =
    "id, member_id, loan_id, kind, channel, status, subject, payload, error, created_at, sent_at";

#[derive(Clone)]
pub struct NotificationsRepository {
    pool: Pool<Postgres>,
}

impl NotificationsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Insert a pending notification unless one already exists for the same
    /// loan, kind and channel. Concurrent claims resolve on the unique index.
    pub async fn claim(&self, notification: &NewNotification) -> AppResult<Option<Notification>> {
        let claimed = sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notifications (member_id, loan_id, kind, channel, status, subject, payload, created_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            ON CONFLICT (loan_id, kind, channel) DO NOTHING
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(notification.member_id)
        .bind(notification.loan_id)
        .bind(notification.kind)
        .bind(notification.channel)
        .bind(&notification.subject)
        .bind(&notification.payload)
        .bind(notification.created_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    pub async fn update(&self, notification: &Notification) -> AppResult<()> {
        let rows = sqlx::query("UPDATE notifications SET status = $2, error = $3, sent_at = $4 WHERE id = $1")
            .bind(notification.id)
            .bind(notification.status)
            .bind(&notification.error)
            .bind(notification.sent_at)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::Internal(format!("Notification {} vanished", notification.id)));
        }
        Ok(())
    }

    pub async fn for_loan(&self, loan_id: i32) -> AppResult<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE loan_id = $1 ORDER BY id"
        ))
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }
}
