use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use pushgate_common::error::AppError;
use pushgate_common::types::{Notification, TokenFeedback};
use pushgate_store::{StatusUpdate, Store};

use crate::error::{DeliveryError, RetryableError};
use crate::retry::BackoffPolicy;

/// How one notification left a delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Delivered,
    Failed(DeliveryError),
    Retry(RetryableError),
    /// Some recipients failed permanently and the rest are worth retrying.
    PartiallyFailed {
        error: DeliveryError,
        retry_tokens: Vec<String>,
    },
}

/// Result of one dispatcher call, aligned with the batch members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub outcomes: Vec<Outcome>,
    pub feedback: Vec<TokenFeedback>,
}

/// An outcome learned after the dispatcher call that sent the notification
/// had already returned.
#[derive(Debug, Clone, PartialEq)]
pub struct LateOutcome {
    pub notification: Notification,
    pub outcome: Outcome,
    pub feedback: Option<TokenFeedback>,
}

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A status write the store refused. Kept until it lands, since the
/// notification stays claimed until then.
#[derive(Debug, Clone)]
struct ParkedWrite {
    notification: Notification,
    update: StatusUpdate,
}

/// Persists outcomes, applying the retry policy.
#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn Store>,
    backoff: BackoffPolicy,
    parked: Arc<Mutex<Vec<ParkedWrite>>>,
}

impl OutcomeRecorder {
    pub fn new(store: Arc<dyn Store>, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            backoff,
            parked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn record(
        &self,
        notification: &Notification,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        match outcome {
            Outcome::Delivered => {
                tracing::debug!(notification_id = %notification.id, "Notification delivered");
                self.write(notification, StatusUpdate::sent(notification, now))
                    .await
            }
            Outcome::Failed(error) => {
                tracing::error!(
                    notification_id = %notification.id,
                    code = ?error.code,
                    error = %error,
                    "Notification failed"
                );
                self.write(
                    notification,
                    StatusUpdate::failed(notification, error.code, &error.description, now),
                )
                .await
            }
            Outcome::Retry(error) => self.record_retry(notification, error, now).await,
            Outcome::PartiallyFailed {
                error,
                retry_tokens,
            } => {
                self.record_partial(notification, error, retry_tokens, now)
                    .await
            }
        }
    }

    async fn record_retry(
        &self,
        notification: &Notification,
        error: &RetryableError,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let attempt = u32::try_from(notification.retries).unwrap_or(0) + 1;
        if self.backoff.exhausted(attempt) {
            let description = format!(
                "Giving up after {} attempts: {}",
                attempt, error.description
            );
            tracing::error!(
                notification_id = %notification.id,
                attempts = attempt,
                error = %error,
                "Retries exhausted, notification failed"
            );
            return self
                .write(
                    notification,
                    StatusUpdate::failed(notification, None, description, now),
                )
                .await;
        }

        let deliver_after = error
            .retry_after
            .unwrap_or_else(|| self.backoff.next_attempt_at(attempt, now));
        tracing::warn!(
            notification_id = %notification.id,
            attempt,
            deliver_after = %deliver_after,
            error = %error,
            "Notification will be retried"
        );
        self.write(
            notification,
            StatusUpdate::retryable(
                i32::try_from(attempt).unwrap_or(i32::MAX),
                deliver_after,
                &error.description,
                now,
            ),
        )
        .await
    }

    async fn record_partial(
        &self,
        notification: &Notification,
        error: &DeliveryError,
        retry_tokens: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let attempt = u32::try_from(notification.retries).unwrap_or(0) + 1;
        let description = if self.backoff.exhausted(attempt) {
            format!("{}. Retries exhausted for the remaining recipients", error)
        } else {
            let mut follow_up =
                Notification::new(notification.app_id, retry_tokens.to_vec(), notification.payload.clone());
            follow_up.priority = notification.priority;
            follow_up.expiry = notification.expiry;
            follow_up.collapse_key = notification.collapse_key.clone();
            follow_up.retries = i32::try_from(attempt).unwrap_or(i32::MAX);
            follow_up.status = pushgate_common::types::DeliveryStatus::Retryable;
            follow_up.deliver_after = Some(self.backoff.next_attempt_at(attempt, now));
            if let Err(e) = self.store.create_notification(&follow_up).await {
                tracing::error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to create follow-up notification"
                );
                let description = format!(
                    "{}. Unavailable recipients could not be retried: {}",
                    error, e
                );
                self.write(
                    notification,
                    StatusUpdate::failed(notification, error.code, description, now),
                )
                .await?;
                return Err(e);
            }

            tracing::warn!(
                notification_id = %notification.id,
                follow_up_id = %follow_up.id,
                recipients = retry_tokens.len(),
                "Unavailable recipients moved to a follow-up notification"
            );
            format!(
                "{}. Unavailable recipients have been retried as notification {}",
                error, follow_up.id
            )
        };

        self.write(
            notification,
            StatusUpdate::failed(notification, error.code, description, now),
        )
        .await
    }

    /// Write a status update, retrying transient store errors a few times.
    ///
    /// A write that still fails is parked and retried by
    /// [`OutcomeRecorder::flush_parked`]; the error is returned either way.
    pub async fn write(
        &self,
        notification: &Notification,
        update: StatusUpdate,
    ) -> Result<(), AppError> {
        let mut attempt = 1;
        loop {
            match self.store.update_status(notification, &update).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < WRITE_ATTEMPTS => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        attempt,
                        error = %e,
                        "Status write failed, retrying"
                    );
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        notification_id = %notification.id,
                        status = ?update.status,
                        error = %e,
                        "Status write failed, parked for a later retry"
                    );
                    self.parked.lock().push(ParkedWrite {
                        notification: notification.clone(),
                        update,
                    });
                    return Err(e);
                }
            }
        }
    }

    /// Retry every parked status write once. Returns how many landed.
    ///
    /// Writes for notifications the store no longer knows are dropped.
    pub async fn flush_parked(&self) -> usize {
        let parked = std::mem::take(&mut *self.parked.lock());
        if parked.is_empty() {
            return 0;
        }

        let mut landed = 0;
        let mut still_parked = Vec::new();
        for write in parked {
            match self
                .store
                .update_status(&write.notification, &write.update)
                .await
            {
                Ok(()) => landed += 1,
                Err(AppError::NotFound(_)) => {
                    tracing::warn!(
                        notification_id = %write.notification.id,
                        "Dropping parked status write for a missing notification"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        notification_id = %write.notification.id,
                        error = %e,
                        "Parked status write failed again"
                    );
                    still_parked.push(write);
                }
            }
        }

        let remaining = still_parked.len();
        self.parked.lock().extend(still_parked);
        tracing::info!(landed, remaining, "Flushed parked status writes");
        landed
    }

    pub fn parked_writes(&self) -> usize {
        self.parked.lock().len()
    }

    /// Record a whole dispatcher report against the batch it came from.
    pub async fn record_report<'a>(
        &self,
        notifications: impl IntoIterator<Item = &'a Notification>,
        report: &DispatchReport,
        now: DateTime<Utc>,
    ) {
        for (notification, outcome) in notifications.into_iter().zip(&report.outcomes) {
            if let Err(e) = self.record(notification, outcome, now).await {
                tracing::error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to persist delivery outcome"
                );
            }
        }
        for feedback in &report.feedback {
            self.record_feedback(feedback).await;
        }
    }

    pub async fn record_late(&self, late: &LateOutcome, now: DateTime<Utc>) {
        if let Err(e) = self.record(&late.notification, &late.outcome, now).await {
            tracing::error!(
                notification_id = %late.notification.id,
                error = %e,
                "Failed to persist delivery outcome"
            );
        }
        if let Some(feedback) = &late.feedback {
            self.record_feedback(feedback).await;
        }
    }

    pub async fn record_feedback(&self, feedback: &TokenFeedback) {
        if let Err(e) = self.store.record_token_feedback(feedback).await {
            tracing::error!(app_id = %feedback.app_id, error = %e, "Failed to record token feedback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pushgate_common::types::{App, DeliveryStatus};
    use pushgate_store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` status writes, then behaves like `inner`.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures: AtomicUsize,
        transient: bool,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>, failures: usize, transient: bool) -> Self {
            Self {
                inner,
                failures: AtomicUsize::new(failures),
                transient,
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn list_apps(&self) -> pushgate_store::Result<Vec<App>> {
            self.inner.list_apps().await
        }

        async fn fetch_due_notifications(
            &self,
            app: &App,
            limit: usize,
            now: DateTime<Utc>,
        ) -> pushgate_store::Result<Vec<Notification>> {
            self.inner.fetch_due_notifications(app, limit, now).await
        }

        async fn update_status(
            &self,
            notification: &Notification,
            update: &StatusUpdate,
        ) -> pushgate_store::Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(if self.transient {
                    AppError::Database(sqlx::Error::PoolTimedOut)
                } else {
                    AppError::Internal("write refused".into())
                });
            }
            self.inner.update_status(notification, update).await
        }

        async fn create_notification(&self, notification: &Notification) -> pushgate_store::Result<()> {
            self.inner.create_notification(notification).await
        }

        async fn update_app(&self, app: &App) -> pushgate_store::Result<()> {
            self.inner.update_app(app).await
        }

        async fn record_token_feedback(&self, feedback: &TokenFeedback) -> pushgate_store::Result<()> {
            self.inner.record_token_feedback(feedback).await
        }

        async fn release_stale_claims(&self) -> pushgate_store::Result<u64> {
            self.inner.release_stale_claims().await
        }
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }

    fn recorder(store: Arc<MemoryStore>, max_attempts: u32) -> OutcomeRecorder {
        OutcomeRecorder::new(store, policy(max_attempts))
    }

    fn stored(store: &MemoryStore, tokens: Vec<String>) -> Notification {
        let n = Notification::new(Uuid::new_v4(), tokens, serde_json::json!({"alert": "hi"}));
        store.insert_notification(n.clone());
        n
    }

    #[tokio::test]
    async fn test_retry_then_sent() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), 10);
        let n = stored(&store, vec!["t".into()]);
        let t0 = Utc::now();

        recorder
            .record(&n, &Outcome::Retry(RetryableError::new("503 Service Unavailable")), t0)
            .await
            .unwrap();
        let after_retry = store.notification(n.id).unwrap();
        assert_eq!(after_retry.status, DeliveryStatus::Retryable);
        assert_eq!(after_retry.retries, 1);
        assert_eq!(after_retry.deliver_after, Some(t0 + chrono::Duration::seconds(2)));

        recorder
            .record(&after_retry, &Outcome::Delivered, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.notification(n.id).unwrap().status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), 10);
        let n = stored(&store, vec!["t".into()]);
        let hint = Utc::now() + chrono::Duration::minutes(7);

        let error = RetryableError::new("429 Too Many Requests").with_retry_after(Some(hint));
        recorder
            .record(&n, &Outcome::Retry(error), Utc::now())
            .await
            .unwrap();
        assert_eq!(store.notification(n.id).unwrap().deliver_after, Some(hint));
    }

    #[tokio::test]
    async fn test_retry_cap_becomes_failure() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), 3);
        let mut n = stored(&store, vec!["t".into()]);
        n.retries = 2;

        recorder
            .record(&n, &Outcome::Retry(RetryableError::new("timeout")), Utc::now())
            .await
            .unwrap();
        let failed = store.notification(n.id).unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(
            failed.error_description.as_deref(),
            Some("Giving up after 3 attempts: timeout")
        );
    }

    #[tokio::test]
    async fn test_partial_failure_creates_follow_up() {
        let store = Arc::new(MemoryStore::new());
        let recorder = recorder(store.clone(), 10);
        let n = stored(&store, vec!["a".into(), "b".into(), "c".into()]);

        let outcome = Outcome::PartiallyFailed {
            error: DeliveryError::new(None, "Failed to deliver to recipients 0, 2 (NotRegistered, Unavailable)"),
            retry_tokens: vec!["c".into()],
        };
        recorder.record(&n, &outcome, Utc::now()).await.unwrap();

        let all = store.notifications_for(n.app_id);
        assert_eq!(all.len(), 2);
        let follow_up = all.iter().find(|x| x.id != n.id).unwrap();
        assert_eq!(follow_up.tokens, vec!["c".to_string()]);
        assert_eq!(follow_up.status, DeliveryStatus::Retryable);
        assert_eq!(follow_up.retries, 1);

        let original = store.notification(n.id).unwrap();
        assert_eq!(original.status, DeliveryStatus::Failed);
        assert!(
            original
                .error_description
                .unwrap()
                .ends_with(&format!("retried as notification {}", follow_up.id))
        );
    }

    async fn claimed(store: &MemoryStore, app: &App) -> Notification {
        let n = Notification::new(app.id, vec!["t".into()], serde_json::json!({"alert": "hi"}));
        store.insert_notification(n.clone());
        let mut due = store
            .fetch_due_notifications(app, 10, Utc::now())
            .await
            .unwrap();
        assert!(store.is_claimed(n.id));
        due.remove(0)
    }

    fn make_app() -> App {
        App {
            id: Uuid::new_v4(),
            name: "flaky".to_string(),
            provider: pushgate_common::types::Provider::Wpns,
            environment: None,
            certificate: None,
            password: None,
            auth_key: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            access_token_expires_at: None,
            connections: 1,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let memory = Arc::new(MemoryStore::new());
        let app = make_app();
        let n = claimed(&memory, &app).await;
        let recorder = OutcomeRecorder::new(
            Arc::new(FlakyStore::new(memory.clone(), 1, true)),
            policy(10),
        );

        recorder.record(&n, &Outcome::Delivered, Utc::now()).await.unwrap();
        assert_eq!(memory.notification(n.id).unwrap().status, DeliveryStatus::Sent);
        assert!(!memory.is_claimed(n.id));
        assert_eq!(recorder.parked_writes(), 0);
    }

    #[tokio::test]
    async fn test_refused_write_is_parked_until_flushed() {
        let memory = Arc::new(MemoryStore::new());
        let app = make_app();
        let n = claimed(&memory, &app).await;
        let recorder = OutcomeRecorder::new(
            Arc::new(FlakyStore::new(memory.clone(), 1, false)),
            policy(10),
        );

        let report = DispatchReport {
            outcomes: vec![Outcome::Retry(RetryableError::new("503 Service Unavailable"))],
            feedback: Vec::new(),
        };
        recorder.record_report([&n], &report, Utc::now()).await;
        assert_eq!(recorder.parked_writes(), 1);
        assert!(memory.is_claimed(n.id));

        assert_eq!(recorder.flush_parked().await, 1);
        assert_eq!(recorder.parked_writes(), 0);
        assert!(!memory.is_claimed(n.id));
        let stored = memory.notification(n.id).unwrap();
        assert_eq!(stored.status, DeliveryStatus::Retryable);
        assert_eq!(stored.retries, 1);
    }

    #[tokio::test]
    async fn test_parked_write_for_missing_notification_is_dropped() {
        let memory = Arc::new(MemoryStore::new());
        let recorder = OutcomeRecorder::new(
            Arc::new(FlakyStore::new(memory.clone(), 1, false)),
            policy(10),
        );
        let ghost = Notification::new(Uuid::new_v4(), vec!["t".into()], serde_json::json!({}));

        assert!(recorder.record(&ghost, &Outcome::Delivered, Utc::now()).await.is_err());
        assert_eq!(recorder.parked_writes(), 1);
        assert_eq!(recorder.flush_parked().await, 0);
        assert_eq!(recorder.parked_writes(), 0);
    }
}
