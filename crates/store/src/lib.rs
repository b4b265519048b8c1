//! Persistence seam for the dispatch engine.
//!
//! The daemon only ever talks to a [`Store`]; which backend sits behind it is
//! decided once at startup by [`connect`] from the configured
//! [`StoreBackend`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pushgate_common::config::{AppConfig, StoreBackend};
use pushgate_common::error::AppError;
use pushgate_common::types::{App, DeliveryStatus, Notification, TokenFeedback};

pub mod memory;
pub mod postgres;
pub mod redis_store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, AppError>;

/// Notification and app repository consumed by the daemon.
#[async_trait]
pub trait Store: Send + Sync {
    /// Every registered app, enabled or not.
    async fn list_apps(&self) -> Result<Vec<App>>;

    /// Claim up to `limit` notifications of `app` that are pending or
    /// retryable and due at `now`, oldest first.
    ///
    /// Claimed notifications are not returned again until their status is
    /// updated, so a notification sits in at most one in-memory queue.
    async fn fetch_due_notifications(
        &self,
        app: &App,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;

    /// Persist a delivery outcome and release the claim.
    async fn update_status(&self, notification: &Notification, update: &StatusUpdate)
    -> Result<()>;

    /// Persist a new notification.
    async fn create_notification(&self, notification: &Notification) -> Result<()>;

    /// Persist refreshed app credentials.
    async fn update_app(&self, app: &App) -> Result<()>;

    /// Record an invalid or canonicalised device token.
    async fn record_token_feedback(&self, feedback: &TokenFeedback) -> Result<()>;

    /// Release claims left behind by a previous process. Returns how many.
    async fn release_stale_claims(&self) -> Result<u64>;

    /// Drop any session held on behalf of the calling context.
    async fn release_connection(&self) {}
}

/// A status transition written by [`Store::update_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: DeliveryStatus,
    pub retries: i32,
    pub deliver_after: Option<DateTime<Utc>>,
    pub error_code: Option<i32>,
    pub error_description: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn sent(notification: &Notification, at: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            retries: notification.retries,
            deliver_after: None,
            error_code: None,
            error_description: None,
            at,
        }
    }

    pub fn failed(
        notification: &Notification,
        error_code: Option<i32>,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            retries: notification.retries,
            deliver_after: None,
            error_code,
            error_description: Some(description.into()),
            at,
        }
    }

    pub fn retryable(
        retries: i32,
        deliver_after: DateTime<Utc>,
        description: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: DeliveryStatus::Retryable,
            retries,
            deliver_after: Some(deliver_after),
            error_code: None,
            error_description: Some(description.into()),
            at,
        }
    }

    /// Hand a claimed but undelivered notification back to the store.
    pub fn released(notification: &Notification, at: DateTime<Utc>) -> Self {
        Self {
            status: DeliveryStatus::Retryable,
            retries: notification.retries,
            deliver_after: Some(at),
            error_code: notification.error_code,
            error_description: notification.error_description.clone(),
            at,
        }
    }

    /// Apply the transition to an in-memory copy.
    pub fn apply(&self, notification: &mut Notification) {
        notification.status = self.status;
        notification.retries = self.retries;
        notification.deliver_after = self.deliver_after;
        notification.error_code = self.error_code;
        notification.error_description = self.error_description.clone();
        match self.status {
            DeliveryStatus::Sent => notification.sent_at = Some(self.at),
            DeliveryStatus::Failed => notification.failed_at = Some(self.at),
            DeliveryStatus::Pending | DeliveryStatus::Retryable => {}
        }
    }
}

/// Build the store selected by `config.store`.
pub async fn connect(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Postgres => {
            let pool = pushgate_common::db::connect_store_pool(config).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        StoreBackend::Redis => {
            let manager = pushgate_common::redis_pool::connect_store_redis(config).await?;
            Ok(Arc::new(RedisStore::new(manager)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_notification() -> Notification {
        Notification::new(Uuid::new_v4(), vec!["token".into()], serde_json::json!({}))
    }

    #[test]
    fn test_apply_sent() {
        let mut n = make_notification();
        let at = Utc::now();
        StatusUpdate::sent(&n, at).apply(&mut n);
        assert_eq!(n.status, DeliveryStatus::Sent);
        assert_eq!(n.sent_at, Some(at));
        assert!(n.deliver_after.is_none());
    }

    #[test]
    fn test_apply_retryable_then_failed() {
        let mut n = make_notification();
        let at = Utc::now();
        let later = at + chrono::Duration::seconds(4);
        StatusUpdate::retryable(1, later, "503 Service Unavailable", at).apply(&mut n);
        assert_eq!(n.status, DeliveryStatus::Retryable);
        assert_eq!(n.retries, 1);
        assert_eq!(n.deliver_after, Some(later));

        StatusUpdate::failed(&n, Some(8), "Invalid token (8)", at).apply(&mut n);
        assert_eq!(n.status, DeliveryStatus::Failed);
        assert_eq!(n.retries, 1);
        assert_eq!(n.error_code, Some(8));
        assert_eq!(n.failed_at, Some(at));
    }

    #[test]
    fn test_released_keeps_retry_count() {
        let mut n = make_notification();
        n.retries = 3;
        let at = Utc::now();
        let update = StatusUpdate::released(&n, at);
        assert_eq!(update.status, DeliveryStatus::Retryable);
        assert_eq!(update.retries, 3);
        assert_eq!(update.deliver_after, Some(at));
    }
}
