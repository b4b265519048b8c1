//! Redis store.
//!
//! Layout:
//! - `pushgate:apps` hash, app id -> app JSON
//! - `pushgate:notification:{id}` notification JSON
//! - `pushgate:app:{app_id}:due` sorted set of notification ids scored by due time (ms)
//! - `pushgate:app:{app_id}:claimed` set of ids currently held by the daemon
//! - `pushgate:app:{app_id}:feedback` list of token feedback JSON

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use pushgate_common::error::AppError;
use pushgate_common::types::{App, Notification, TokenFeedback};

use crate::{Result, StatusUpdate, Store};

const APPS_KEY: &str = "pushgate:apps";

fn notification_key(id: impl std::fmt::Display) -> String {
    format!("pushgate:notification:{}", id)
}

fn due_key(app_id: Uuid) -> String {
    format!("pushgate:app:{}:due", app_id)
}

fn claimed_key(app_id: Uuid) -> String {
    format!("pushgate:app:{}:claimed", app_id)
}

fn feedback_key(app_id: Uuid) -> String {
    format!("pushgate:app:{}:feedback", app_id)
}

/// Sorted-set score for a notification that may be picked up.
fn due_score(notification: &Notification) -> i64 {
    notification
        .deliver_after
        .unwrap_or(notification.created_at)
        .timestamp_millis()
}

/// [`Store`] backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Register or replace an app.
    pub async fn save_app(&self, app: &App) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(APPS_KEY, app.id.to_string(), serde_json::to_string(app)?)
            .await?;
        Ok(())
    }

    async fn load_notification(
        conn: &mut ConnectionManager,
        id: impl std::fmt::Display,
    ) -> Result<Option<Notification>> {
        let body: Option<String> = conn.get(notification_key(id)).await?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(AppError::from)
    }

    async fn save_notification(
        conn: &mut ConnectionManager,
        notification: &Notification,
    ) -> Result<()> {
        conn.set::<_, _, ()>(
            notification_key(notification.id),
            serde_json::to_string(notification)?,
        )
        .await?;
        if !notification.status.is_terminal() {
            conn.zadd::<_, _, _, ()>(
                due_key(notification.app_id),
                notification.id.to_string(),
                due_score(notification),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_apps(&self) -> Result<Vec<App>> {
        let mut conn = self.conn.clone();
        let bodies: Vec<String> = conn.hvals(APPS_KEY).await?;
        let mut apps = bodies
            .iter()
            .map(|b| serde_json::from_str::<App>(b))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    async fn fetch_due_notifications(
        &self,
        app: &App,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let mut conn = self.conn.clone();
        let due = due_key(app.id);
        let ids: Vec<String> = conn
            .zrangebyscore_limit(&due, "-inf", now.timestamp_millis(), 0, limit as isize)
            .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            // ZREM is the claim: only one caller sees it return 1.
            let removed: i64 = conn.zrem(&due, &id).await?;
            if removed != 1 {
                continue;
            }
            conn.sadd::<_, _, ()>(claimed_key(app.id), &id).await?;
            match Self::load_notification(&mut conn, &id).await? {
                Some(notification) => claimed.push(notification),
                None => {
                    tracing::warn!(notification_id = %id, "Due notification has no body, dropping");
                    conn.srem::<_, _, ()>(claimed_key(app.id), &id).await?;
                }
            }
        }

        Ok(claimed)
    }

    async fn update_status(
        &self,
        notification: &Notification,
        update: &StatusUpdate,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut stored = Self::load_notification(&mut conn, notification.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {}", notification.id)))?;
        update.apply(&mut stored);
        Self::save_notification(&mut conn, &stored).await?;
        conn.srem::<_, _, ()>(claimed_key(stored.app_id), stored.id.to_string())
            .await?;
        Ok(())
    }

    async fn create_notification(&self, notification: &Notification) -> Result<()> {
        let mut conn = self.conn.clone();
        Self::save_notification(&mut conn, notification).await
    }

    async fn update_app(&self, app: &App) -> Result<()> {
        self.save_app(app).await
    }

    async fn record_token_feedback(&self, feedback: &TokenFeedback) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(feedback_key(feedback.app_id), serde_json::to_string(feedback)?)
            .await?;
        Ok(())
    }

    async fn release_stale_claims(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut released = 0u64;

        for app in self.list_apps().await? {
            let key = claimed_key(app.id);
            let ids: Vec<String> = conn.smembers(&key).await?;
            for id in ids {
                if let Some(notification) = Self::load_notification(&mut conn, &id).await? {
                    Self::save_notification(&mut conn, &notification).await?;
                    released += 1;
                }
            }
            conn.del::<_, ()>(&key).await?;
        }

        if released > 0 {
            tracing::info!(released, "Released notification claims from a previous run");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushgate_common::types::DeliveryStatus;

    #[test]
    fn test_due_score_prefers_deliver_after() {
        let mut n = Notification::new(Uuid::new_v4(), vec!["t".into()], serde_json::json!({}));
        assert_eq!(due_score(&n), n.created_at.timestamp_millis());

        let later = n.created_at + chrono::Duration::seconds(30);
        n.deliver_after = Some(later);
        n.status = DeliveryStatus::Retryable;
        assert_eq!(due_score(&n), later.timestamp_millis());
    }

    #[test]
    fn test_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            due_key(id),
            "pushgate:app:00000000-0000-0000-0000-000000000000:due"
        );
        assert_eq!(
            notification_key(id),
            "pushgate:notification:00000000-0000-0000-0000-000000000000"
        );
    }
}
