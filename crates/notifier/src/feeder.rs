//! Moves due notifications from the store into per-app queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use pushgate_common::config::AppConfig;
use pushgate_store::Store;

use crate::app_runner::AppRunner;

pub struct Feeder {
    store: Arc<dyn Store>,
    runner: Arc<AppRunner>,
    poll: Duration,
    batch_size: usize,
    watermark: usize,
    wake: Notify,
    cancel: CancellationToken,
}

impl Feeder {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Store>,
        runner: Arc<AppRunner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            runner,
            poll: config.push_poll,
            batch_size: config.batch_size.max(1),
            watermark: config.queue_watermark.max(1),
            wake: Notify::new(),
            cancel,
        }
    }

    /// Feed until [`Feeder::stop`] is called.
    pub async fn run(&self) {
        tracing::info!(poll_ms = self.poll.as_millis() as u64, "Feeder started");
        while !self.cancel.is_cancelled() {
            self.feed_once().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        tracing::info!("Feeder stopped");
    }

    /// Cut the current poll sleep short.
    pub fn wakeup(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// One pass over every live app. Returns how many notifications were
    /// queued.
    pub async fn feed_once(&self) -> usize {
        self.runner.flush_parked_writes().await;

        let mut queued = 0;
        for app in self.runner.live_apps().await {
            let Some(depth) = self.runner.queue_depth(app.id).await else {
                continue;
            };
            if depth >= self.watermark {
                tracing::debug!(app = %app.name, depth, "Queue above watermark, skipping");
                continue;
            }

            let limit = self.batch_size.min(self.watermark - depth);
            let now = Utc::now();
            let due = match self.store.fetch_due_notifications(&app, limit, now).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(app = %app.name, error = %e, "Failed to fetch due notifications");
                    continue;
                }
            };
            if due.is_empty() {
                continue;
            }

            let fetched = due.len();
            // The app may have been removed since the snapshot was taken.
            let rejected = self.runner.enqueue(app.id, due).await;
            let count = fetched - rejected.len();
            self.runner.release(&app, rejected).await;

            if count > 0 {
                tracing::debug!(app = %app.name, count, "Queued due notifications");
            }
            queued += count;
        }
        queued
    }
}
