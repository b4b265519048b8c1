//! Dispatcher seam and the per-app worker pool driving it.
//!
//! A [`DispatcherLoop`] owns one app's [`NotificationQueue`] and a set of
//! workers. Every worker holds its own [`Dispatcher`] (for the binary gateway
//! that means its own connection), pops payloads, optionally widens them into
//! a multicast [`Batch`], and hands the outcomes to the [`OutcomeRecorder`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pushgate_common::types::App;
use pushgate_store::StatusUpdate;

use crate::app_runner::DispatcherFactory;
use crate::batch::Batch;
use crate::delivery::{DispatchReport, LateOutcome, Outcome, OutcomeRecorder};
use crate::error::{DeliveryError, DispatchError, RetryableError};
use crate::queue::{NotificationQueue, QueuePayload};

/// Delivers batches to one provider.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver every member of `batch`. The report carries one outcome per
    /// member, in batch order.
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReport, DispatchError>;

    /// Recipients one provider request may carry.
    fn max_recipients(&self) -> usize {
        1
    }

    /// Outcomes learned after `dispatch` returned, e.g. asynchronous
    /// gateway error frames.
    fn take_late_outcomes(&self) -> Vec<LateOutcome> {
        Vec::new()
    }

    async fn shutdown(&self) {}
}

/// Worker behaviour shared by every pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub pop_timeout: Duration,
    pub batch_deliveries: bool,
}

/// Outcome counters for one pool.
#[derive(Debug, Default)]
pub struct LoopStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    partially_failed: AtomicU64,
    panics: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatsSnapshot {
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub partially_failed: u64,
    pub panics: u64,
}

impl LoopStats {
    fn observe(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Delivered => &self.delivered,
            Outcome::Failed(_) => &self.failed,
            Outcome::Retry(_) => &self.retried,
            Outcome::PartiallyFailed { .. } => &self.partially_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            partially_failed: self.partially_failed.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pool that can no longer deliver because its app is misconfigured.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolFault {
    pub pool_id: u64,
    pub error: String,
}

/// Faults reported by pool workers, keyed by app, for the runner to act on.
#[derive(Debug, Default)]
pub struct PoolFaults {
    faults: Mutex<HashMap<Uuid, PoolFault>>,
    notify: Notify,
}

impl PoolFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, app_id: Uuid, fault: PoolFault) {
        self.faults.lock().entry(app_id).or_insert(fault);
        self.notify.notify_one();
    }

    pub fn take(&self) -> HashMap<Uuid, PoolFault> {
        std::mem::take(&mut *self.faults.lock())
    }

    /// Resolves once a fault has been reported.
    pub async fn reported(&self) {
        self.notify.notified().await
    }
}

struct Worker {
    id: usize,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct WorkerContext {
    app_id: Uuid,
    app_name: String,
    pool_id: u64,
    faults: Arc<PoolFaults>,
    queue: Arc<NotificationQueue>,
    recorder: OutcomeRecorder,
    settings: WorkerSettings,
    stats: Arc<LoopStats>,
}

/// Worker pool for one app.
pub struct DispatcherLoop {
    id: u64,
    app: App,
    factory: Arc<dyn DispatcherFactory>,
    context: WorkerContext,
    workers: Vec<Worker>,
    next_worker_id: usize,
}

impl DispatcherLoop {
    /// Start `size` workers. Fails, with every started worker stopped again,
    /// when any dispatcher cannot be built.
    pub async fn start(
        app: App,
        factory: Arc<dyn DispatcherFactory>,
        recorder: OutcomeRecorder,
        settings: WorkerSettings,
        faults: Arc<PoolFaults>,
        size: usize,
    ) -> Result<Self, DispatchError> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let context = WorkerContext {
            app_id: app.id,
            app_name: app.name.clone(),
            pool_id: id,
            faults,
            queue: Arc::new(NotificationQueue::new()),
            recorder,
            settings,
            stats: Arc::new(LoopStats::default()),
        };
        let mut pool = Self {
            id,
            app,
            factory,
            context,
            workers: Vec::new(),
            next_worker_id: 0,
        };

        for _ in 0..size.max(1) {
            if let Err(e) = pool.add_worker().await {
                pool.stop().await;
                return Err(e);
            }
        }

        tracing::info!(app = %pool.app.name, workers = pool.size(), "Dispatcher pool started");
        Ok(pool)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn queue(&self) -> &Arc<NotificationQueue> {
        &self.context.queue
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> LoopStatsSnapshot {
        self.context.stats.snapshot()
    }

    pub async fn add_worker(&mut self) -> Result<(), DispatchError> {
        let cancel = CancellationToken::new();
        let dispatcher = self.factory.build(&self.app, cancel.clone()).await?;

        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let handle = tokio::spawn(run_worker(
            id,
            self.context.clone(),
            dispatcher,
            cancel.clone(),
        ));
        self.workers.push(Worker { id, cancel, handle });
        Ok(())
    }

    /// Stop the newest worker after it settles its current batch.
    pub async fn remove_worker(&mut self) -> bool {
        let Some(worker) = self.workers.pop() else {
            return false;
        };
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            tracing::error!(app = %self.app.name, worker = worker.id, error = %e, "Worker task failed");
        }
        true
    }

    /// Grow or shrink to `size` workers. Growth stops at the first dispatcher
    /// that cannot be built.
    pub async fn resize(&mut self, size: usize) -> Result<(), DispatchError> {
        let size = size.max(1);
        let from = self.size();
        while self.size() > size {
            self.remove_worker().await;
        }
        while self.size() < size {
            self.add_worker().await?;
        }
        if from != size {
            tracing::info!(app = %self.app.name, from, to = size, "Dispatcher pool resized");
        }
        Ok(())
    }

    /// Stop every worker and return whatever was still queued.
    pub async fn stop(&mut self) -> Vec<QueuePayload> {
        for worker in &self.workers {
            worker.cancel.cancel();
        }
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.handle.await {
                tracing::error!(app = %self.app.name, worker = worker.id, error = %e, "Worker task failed");
            }
        }
        let remaining = self.context.queue.drain();
        tracing::info!(
            app = %self.app.name,
            unsent = remaining.len(),
            "Dispatcher pool stopped"
        );
        remaining
    }
}

async fn run_worker(
    id: usize,
    ctx: WorkerContext,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
) {
    tracing::debug!(app = %ctx.app_name, worker = id, "Worker started");

    while !cancel.is_cancelled() {
        let Some(first) = ctx.queue.pop(ctx.settings.pop_timeout, &cancel).await else {
            record_late(&ctx, dispatcher.as_ref()).await;
            continue;
        };

        let mut payloads = vec![first];
        let max_recipients = dispatcher.max_recipients();
        if ctx.settings.batch_deliveries && max_recipients > 1 {
            let budget = max_recipients.saturating_sub(payloads[0].recipient_count());
            if budget > 0 {
                let key = payloads[0].batch_key();
                payloads.extend(ctx.queue.take_matching(&key, budget));
            }
        }

        let batch = Batch::new(payloads);
        let report = match deliver(&ctx, dispatcher.as_ref(), &batch).await {
            Delivery::Report(report) => report,
            Delivery::Misconfigured(error) => {
                release(&ctx, &batch).await;
                ctx.queue.done(batch.len());
                ctx.faults.report(
                    ctx.app_id,
                    PoolFault {
                        pool_id: ctx.pool_id,
                        error,
                    },
                );
                break;
            }
        };
        ctx.recorder
            .record_report(batch.notifications(), &report, Utc::now())
            .await;
        for outcome in &report.outcomes {
            ctx.stats.observe(outcome);
        }
        record_late(&ctx, dispatcher.as_ref()).await;
        ctx.queue.done(batch.len());
    }

    dispatcher.shutdown().await;
    record_late(&ctx, dispatcher.as_ref()).await;
    tracing::debug!(app = %ctx.app_name, worker = id, "Worker stopped");
}

enum Delivery {
    Report(DispatchReport),
    /// The app's credentials or settings were rejected. Nothing was sent.
    Misconfigured(String),
}

/// Run one dispatch, mapping errors and panics onto per-member outcomes.
async fn deliver(ctx: &WorkerContext, dispatcher: &dyn Dispatcher, batch: &Batch) -> Delivery {
    let report = match AssertUnwindSafe(dispatcher.dispatch(batch))
        .catch_unwind()
        .await
    {
        Ok(Ok(report)) if report.outcomes.len() == batch.len() => report,
        Ok(Ok(report)) => {
            tracing::error!(
                app = %ctx.app_name,
                outcomes = report.outcomes.len(),
                notifications = batch.len(),
                "Dispatcher report does not match the batch"
            );
            let mut retry = batch.retry_all(RetryableError::new(
                "Dispatcher returned an incomplete report",
            ));
            retry.feedback = report.feedback;
            retry
        }
        Ok(Err(DispatchError::Retryable(e))) => batch.retry_all(e),
        Ok(Err(DispatchError::Connection(e))) => {
            tracing::warn!(app = %ctx.app_name, error = %e, "Dispatch failed on connection error");
            batch.retry_all(RetryableError::new(e.to_string()))
        }
        Ok(Err(DispatchError::Delivery(e))) => batch.fail_all(e),
        Ok(Err(DispatchError::Configuration(e))) => {
            tracing::error!(app = %ctx.app_name, error = %e, "App configuration rejected, stopping worker");
            return Delivery::Misconfigured(e);
        }
        Ok(Err(e)) => {
            tracing::warn!(app = %ctx.app_name, error = %e, "Dispatch failed");
            batch.retry_all(RetryableError::new(e.to_string()))
        }
        Err(panic) => {
            ctx.stats.panics.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(panic.as_ref());
            tracing::error!(app = %ctx.app_name, panic = %message, "Dispatcher panicked");
            batch.fail_all(DeliveryError::new(
                None,
                format!("Dispatcher panicked: {}", message),
            ))
        }
    };
    Delivery::Report(report)
}

/// Hand an undelivered batch back to the store without counting an attempt.
async fn release(ctx: &WorkerContext, batch: &Batch) {
    let now = Utc::now();
    for notification in batch.notifications() {
        let _ = ctx
            .recorder
            .write(notification, StatusUpdate::released(notification, now))
            .await;
    }
}

async fn record_late(ctx: &WorkerContext, dispatcher: &dyn Dispatcher) {
    let late = dispatcher.take_late_outcomes();
    if late.is_empty() {
        return;
    }
    let now = Utc::now();
    for outcome in &late {
        ctx.stats.observe(&outcome.outcome);
        ctx.recorder.record_late(outcome, now).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
