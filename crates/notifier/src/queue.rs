//! Per-app in-memory queue between the feeder and a dispatcher loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use pushgate_common::types::Notification;

/// A notification while it sits in a queue.
#[derive(Debug, Clone)]
pub struct QueuePayload {
    pub notification: Notification,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt this payload represents (1 for a fresh notification).
    pub attempt: u32,
}

impl QueuePayload {
    pub fn new(notification: Notification) -> Self {
        let attempt = u32::try_from(notification.retries).unwrap_or(0) + 1;
        Self {
            notification,
            enqueued_at: Utc::now(),
            attempt,
        }
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey::of(&self.notification)
    }

    pub fn recipient_count(&self) -> usize {
        self.notification.tokens.len()
    }
}

/// Notifications with equal keys can share one multicast request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    payload: String,
    priority: Option<i32>,
    expiry: Option<i32>,
    collapse_key: Option<String>,
}

impl BatchKey {
    pub fn of(notification: &Notification) -> Self {
        Self {
            payload: notification.payload.to_string(),
            priority: notification.priority,
            expiry: notification.expiry,
            collapse_key: notification.collapse_key.clone(),
        }
    }
}

/// FIFO of [`QueuePayload`]s with an interruptible blocking pop.
///
/// Tracks payloads handed to workers but not yet settled so push mode can
/// tell when an app is fully drained.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    items: Mutex<VecDeque<QueuePayload>>,
    notify: Notify,
    in_flight: AtomicUsize,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: QueuePayload) {
        self.items.lock().push_back(payload);
        self.notify.notify_one();
    }

    pub fn push_all(&self, payloads: impl IntoIterator<Item = QueuePayload>) {
        let mut items = self.items.lock();
        let before = items.len();
        items.extend(payloads);
        let added = items.len() - before;
        drop(items);
        for _ in 0..added {
            self.notify.notify_one();
        }
    }

    /// Pop the oldest payload, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or cancellation.
    pub async fn pop(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<QueuePayload> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.items.lock().pop_front() {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                return Some(payload);
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Remove queued payloads sharing `key`, oldest first, while their
    /// combined recipients fit in `recipient_budget`.
    pub fn take_matching(&self, key: &BatchKey, recipient_budget: usize) -> Vec<QueuePayload> {
        let mut items = self.items.lock();
        let mut remaining = recipient_budget;
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(items.len());

        for payload in items.drain(..) {
            let count = payload.recipient_count();
            if count <= remaining && payload.batch_key() == *key {
                remaining -= count;
                taken.push(payload);
            } else {
                kept.push_back(payload);
            }
        }
        *items = kept;

        self.in_flight.fetch_add(taken.len(), Ordering::SeqCst);
        taken
    }

    /// Mark `count` popped payloads as settled.
    pub fn done(&self, count: usize) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<QueuePayload> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing being delivered.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.in_flight() == 0
    }

    pub fn contains(&self, notification_id: uuid::Uuid) -> bool {
        self.items
            .lock()
            .iter()
            .any(|p| p.notification.id == notification_id)
    }
}
