//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use pushgate_common::types::{App, Notification, TokenFeedback, TokenFeedbackKind};

use crate::{Result, StatusUpdate, Store};

const NOTIFICATION_COLUMNS: &str = "id, app_id, tokens, payload, priority, expiry, collapse_key, \
     status, retries, deliver_after, error_code, error_description, sent_at, failed_at, created_at";

/// [`Store`] backed by a `sqlx` Postgres pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_apps(&self) -> Result<Vec<App>> {
        let apps: Vec<App> = sqlx::query_as(
            r#"
            SELECT id, name, provider, environment, certificate, password, auth_key,
                   client_id, client_secret, access_token, access_token_expires_at,
                   connections, enabled
            FROM apps
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(apps)
    }

    async fn fetch_due_notifications(
        &self,
        app: &App,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        // Rows locked by another daemon are skipped, never claimed twice.
        let query = format!(
            r#"
            UPDATE notifications
            SET processing = TRUE, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM notifications
                WHERE app_id = $1
                  AND status IN ('pending', 'retryable')
                  AND processing = FALSE
                  AND (deliver_after IS NULL OR deliver_after <= $2)
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );

        let mut notifications: Vec<Notification> = sqlx::query_as(&query)
            .bind(app.id)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        notifications.sort_by_key(|n| n.created_at);
        Ok(notifications)
    }

    async fn update_status(
        &self,
        notification: &Notification,
        update: &StatusUpdate,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1,
                retries = $2,
                deliver_after = $3,
                error_code = $4,
                error_description = $5,
                sent_at = CASE WHEN $1 = 'sent' THEN $6 ELSE sent_at END,
                failed_at = CASE WHEN $1 = 'failed' THEN $6 ELSE failed_at END,
                processing = FALSE,
                updated_at = NOW()
            WHERE id = $7
            "#,
        )
        .bind(update.status.to_string())
        .bind(update.retries)
        .bind(update.deliver_after)
        .bind(update.error_code)
        .bind(&update.error_description)
        .bind(update.at)
        .bind(notification.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_notification(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, app_id, tokens, payload, priority, expiry, collapse_key, status,
                 retries, deliver_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(notification.id)
        .bind(notification.app_id)
        .bind(&notification.tokens)
        .bind(&notification.payload)
        .bind(notification.priority)
        .bind(notification.expiry)
        .bind(&notification.collapse_key)
        .bind(notification.status.to_string())
        .bind(notification.retries)
        .bind(notification.deliver_after)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(notification_id = %notification.id, "Notification created");
        Ok(())
    }

    async fn update_app(&self, app: &App) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE apps
            SET access_token = $1, access_token_expires_at = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(&app.access_token)
        .bind(app.access_token_expires_at)
        .bind(app.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_token_feedback(&self, feedback: &TokenFeedback) -> Result<()> {
        let (kind, new_token) = match &feedback.kind {
            TokenFeedbackKind::Invalid => ("invalid", None),
            TokenFeedbackKind::Canonical { new_token } => ("canonical", Some(new_token.as_str())),
        };

        sqlx::query(
            r#"
            INSERT INTO token_feedback (app_id, token, kind, new_token, reason, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(feedback.app_id)
        .bind(&feedback.token)
        .bind(kind)
        .bind(new_token)
        .bind(&feedback.reason)
        .bind(feedback.observed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_stale_claims(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET processing = FALSE, updated_at = NOW() WHERE processing = TRUE",
        )
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            tracing::info!(released, "Released notification claims from a previous run");
        }
        Ok(released)
    }
}
