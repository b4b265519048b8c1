//! Registry of running per-app dispatcher pools.
//!
//! Pool changes are serialised by one change lock, held by [`AppChanges`] for
//! as long as a caller needs a consistent view (a whole sync pass, say).
//! Every registry mutation also takes the registry write lock, so the feeder
//! (which enqueues under the read lock) can never push into a pool that is
//! being torn down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pushgate_common::config::{AppConfig, ApnsConfig, DispatcherDefaults, HttpConfig};
use pushgate_common::types::{App, Notification, Provider};
use pushgate_store::{StatusUpdate, Store};

use crate::connection::{Connector, build_client};
use crate::delivery::OutcomeRecorder;
use crate::delivery::adm::AdmDispatcher;
use crate::delivery::apns::{self, ApnsDispatcher};
use crate::delivery::feedback::FeedbackReceiver;
use crate::delivery::gcm::GcmDispatcher;
use crate::delivery::wpns::WpnsDispatcher;
use crate::dispatcher::{Dispatcher, DispatcherLoop, LoopStatsSnapshot, PoolFaults, WorkerSettings};
use crate::error::DispatchError;
use crate::queue::QueuePayload;
use crate::retry::BackoffPolicy;

/// Builds provider dispatchers for an app.
#[async_trait]
pub trait DispatcherFactory: Send + Sync {
    /// One dispatcher per worker. `cancel` fires when that worker stops.
    async fn build(
        &self,
        app: &App,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Dispatcher>, DispatchError>;

    /// Feedback channel reader for apps whose provider has one.
    fn feedback_receiver(&self, _app: &App) -> Result<Option<FeedbackReceiver>, DispatchError> {
        Ok(None)
    }
}

/// Dispatchers for the real provider networks.
pub struct ProviderDispatchers {
    store: Arc<dyn Store>,
    apns: ApnsConfig,
    http: HttpConfig,
    client: reqwest::Client,
}

impl ProviderDispatchers {
    pub fn new(config: &AppConfig, store: Arc<dyn Store>) -> Result<Self, DispatchError> {
        Ok(Self {
            store,
            apns: config.apns.clone(),
            http: config.http.clone(),
            client: build_client(&config.http)?,
        })
    }
}

#[async_trait]
impl DispatcherFactory for ProviderDispatchers {
    async fn build(
        &self,
        app: &App,
        cancel: CancellationToken,
    ) -> Result<Arc<dyn Dispatcher>, DispatchError> {
        Ok(match app.provider {
            Provider::Apns => {
                let endpoint = apns::gateway_endpoint(app, &self.apns);
                let connector = Connector::for_app(app, &endpoint.0)?;
                Arc::new(
                    ApnsDispatcher::connect(
                        app,
                        connector,
                        endpoint,
                        self.apns.clone(),
                        self.http.connect_timeout,
                        cancel,
                    )
                    .await?,
                )
            }
            Provider::Gcm => Arc::new(GcmDispatcher::new(
                app,
                self.client.clone(),
                self.http.gcm_endpoint.clone(),
            )?),
            Provider::Wpns => Arc::new(WpnsDispatcher::new(app, self.client.clone())),
            Provider::Adm => Arc::new(
                AdmDispatcher::connect(
                    app,
                    self.client.clone(),
                    self.http.adm_endpoint.clone(),
                    self.http.adm_token_endpoint.clone(),
                    self.store.clone(),
                )
                .await?,
            ),
        })
    }

    fn feedback_receiver(&self, app: &App) -> Result<Option<FeedbackReceiver>, DispatchError> {
        if app.provider != Provider::Apns {
            return Ok(None);
        }
        let endpoint = apns::feedback_endpoint(app, &self.apns);
        let connector = Connector::for_app(app, &endpoint.0)?;
        Ok(Some(FeedbackReceiver::new(
            app,
            connector,
            endpoint,
            self.apns.feedback_poll,
            self.http.connect_timeout,
            self.http.read_timeout,
            self.store.clone(),
        )))
    }
}

struct AppEntry {
    app: App,
    fingerprint: String,
    pool: DispatcherLoop,
    feedback: Option<(CancellationToken, JoinHandle<()>)>,
}

/// An app whose pool could not be started.
#[derive(Debug, Clone)]
struct Unavailable {
    app: App,
    attempts: u32,
    next_attempt: DateTime<Utc>,
    last_error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStatus {
    pub id: Uuid,
    pub name: String,
    pub provider: Provider,
    pub workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub stats: LoopStatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnavailableStatus {
    pub id: Uuid,
    pub name: String,
    pub attempts: u32,
    pub next_attempt: DateTime<Utc>,
    pub last_error: String,
}

/// Point-in-time view of every pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerStatus {
    pub apps: Vec<AppStatus>,
    pub unavailable: Vec<UnavailableStatus>,
    pub pools_started: u64,
    pub pools_stopped: u64,
    pub parked_writes: usize,
}

pub struct AppRunner {
    store: Arc<dyn Store>,
    factory: Arc<dyn DispatcherFactory>,
    recorder: OutcomeRecorder,
    settings: WorkerSettings,
    defaults: DispatcherDefaults,
    app_backoff: BackoffPolicy,
    changes: Mutex<()>,
    faults: Arc<PoolFaults>,
    apps: RwLock<HashMap<Uuid, AppEntry>>,
    unavailable: parking_lot::Mutex<HashMap<Uuid, Unavailable>>,
    pools_started: AtomicU64,
    pools_stopped: AtomicU64,
}

impl AppRunner {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn Store>,
        factory: Arc<dyn DispatcherFactory>,
    ) -> Self {
        Self {
            recorder: OutcomeRecorder::new(store.clone(), BackoffPolicy::from(&config.retry)),
            store,
            factory,
            settings: WorkerSettings {
                pop_timeout: config.pop_timeout,
                batch_deliveries: config.batch_deliveries,
            },
            defaults: config.dispatchers.clone(),
            app_backoff: BackoffPolicy::from(&config.app_retry),
            changes: Mutex::new(()),
            faults: Arc::new(PoolFaults::new()),
            apps: RwLock::new(HashMap::new()),
            unavailable: parking_lot::Mutex::new(HashMap::new()),
            pools_started: AtomicU64::new(0),
            pools_stopped: AtomicU64::new(0),
        }
    }

    /// Workers for `app`: its own `connections`, else the provider default.
    pub fn pool_size(&self, app: &App) -> usize {
        usize::try_from(app.connections)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.defaults.for_provider(app.provider))
    }

    /// Take the change lock. Pools only start, stop or resize while it is
    /// held, and faulted pools are retired before it is handed out.
    pub async fn changes(&self) -> AppChanges<'_> {
        let changes = AppChanges {
            runner: self,
            _guard: self.changes.lock().await,
        };
        changes.retire_faulted().await;
        changes
    }

    /// Start a pool for every enabled app in the store.
    pub async fn start(&self) -> Result<usize, DispatchError> {
        let apps = self.store.list_apps().await?;
        let changes = self.changes().await;
        let mut started = 0;
        for app in apps.into_iter().filter(|a| a.enabled) {
            if changes.add(app).await.is_ok() {
                started += 1;
            }
        }
        Ok(started)
    }

    /// See [`AppChanges::add`].
    pub async fn add(&self, app: App) -> Result<(), DispatchError> {
        self.changes().await.add(app).await
    }

    /// See [`AppChanges::remove`].
    pub async fn remove(&self, app_id: Uuid) -> bool {
        self.changes().await.remove(app_id).await
    }

    /// See [`AppChanges::resize`].
    pub async fn resize(&self, app: &App) -> Result<(), DispatchError> {
        self.changes().await.resize(app).await
    }

    fn mark_unavailable(&self, app: App, error: &str) {
        let mut unavailable = self.unavailable.lock();
        let attempts = unavailable.get(&app.id).map_or(0, |u| u.attempts) + 1;
        let next_attempt = self.app_backoff.next_attempt_at(attempts, Utc::now());
        tracing::error!(
            app = %app.name,
            attempts,
            next_attempt = %next_attempt,
            error = %error,
            "App unavailable, will retry"
        );
        unavailable.insert(
            app.id,
            Unavailable {
                app,
                attempts,
                next_attempt,
                last_error: error.to_string(),
            },
        );
    }

    /// Stop a pool that has left the registry and hand its queued
    /// notifications back to the store.
    async fn teardown(&self, mut entry: AppEntry) {
        if let Some((cancel, _)) = &entry.feedback {
            cancel.cancel();
        }

        let unsent = entry.pool.stop().await;
        self.release(&entry.app, unsent.into_iter().map(|p| p.notification))
            .await;

        if let Some((_, handle)) = entry.feedback.take()
            && let Err(e) = handle.await
        {
            tracing::error!(app = %entry.app.name, error = %e, "Feedback receiver task failed");
        }

        self.pools_stopped.fetch_add(1, Ordering::Relaxed);
        tracing::info!(app = %entry.app.name, "App stopped");
    }

    /// Hand claimed but undelivered notifications back to the store.
    pub(crate) async fn release(
        &self,
        app: &App,
        notifications: impl IntoIterator<Item = Notification>,
    ) {
        let now = Utc::now();
        let mut count = 0;
        for n in notifications {
            let _ = self
                .recorder
                .write(&n, StatusUpdate::released(&n, now))
                .await;
            count += 1;
        }
        if count > 0 {
            tracing::info!(app = %app.name, count, "Released queued notifications");
        }
    }

    /// Retry status writes the store refused earlier. Returns how many landed.
    pub async fn flush_parked_writes(&self) -> usize {
        self.recorder.flush_parked().await
    }

    /// Queue notifications for a running app. Returns the ones that could not
    /// be queued because the app has no pool.
    pub async fn enqueue(&self, app_id: Uuid, notifications: Vec<Notification>) -> Vec<Notification> {
        let apps = self.apps.read().await;
        match apps.get(&app_id) {
            Some(entry) => {
                entry
                    .pool
                    .queue()
                    .push_all(notifications.into_iter().map(QueuePayload::new));
                Vec::new()
            }
            None => notifications,
        }
    }

    pub async fn queue_depth(&self, app_id: Uuid) -> Option<usize> {
        self.apps
            .read()
            .await
            .get(&app_id)
            .map(|e| e.pool.queue().len())
    }

    /// Apps with a running pool.
    pub async fn live_apps(&self) -> Vec<App> {
        self.apps
            .read()
            .await
            .values()
            .map(|e| e.app.clone())
            .collect()
    }

    /// Retire faulted pools, then retry every unavailable app whose backoff
    /// has elapsed. Returns how many came up.
    pub async fn retry_unavailable(&self) -> usize {
        let changes = self.changes().await;
        let now = Utc::now();
        let due: Vec<App> = self
            .unavailable
            .lock()
            .values()
            .filter(|u| u.next_attempt <= now)
            .map(|u| u.app.clone())
            .collect();

        let mut started = 0;
        for app in due {
            tracing::info!(app = %app.name, "Retrying unavailable app");
            if changes.add(app).await.is_ok() {
                started += 1;
            }
        }
        started
    }

    /// Retry unavailable apps every `interval`, and retire faulted pools as
    /// soon as a fault is reported.
    pub fn spawn_retry_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = runner.faults.reported() => {
                        drop(runner.changes().await);
                        continue;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
                runner.retry_unavailable().await;
            }
        })
    }

    /// Stop every pool.
    pub async fn stop(&self) {
        let changes = self.changes().await;
        let ids: Vec<Uuid> = self.apps.read().await.keys().copied().collect();
        for id in ids {
            changes.remove(id).await;
        }
        self.unavailable.lock().clear();
        drop(changes);

        self.flush_parked_writes().await;
        let parked = self.recorder.parked_writes();
        if parked > 0 {
            tracing::error!(parked, "Stopped with status writes still parked");
        }
    }

    pub async fn status(&self) -> RunnerStatus {
        let mut apps: Vec<AppStatus> = self
            .apps
            .read()
            .await
            .values()
            .map(|e| AppStatus {
                id: e.app.id,
                name: e.app.name.clone(),
                provider: e.app.provider,
                workers: e.pool.size(),
                queued: e.pool.queue().len(),
                in_flight: e.pool.queue().in_flight(),
                stats: e.pool.stats(),
            })
            .collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));

        let unavailable = self
            .unavailable
            .lock()
            .values()
            .map(|u| UnavailableStatus {
                id: u.app.id,
                name: u.app.name.clone(),
                attempts: u.attempts,
                next_attempt: u.next_attempt,
                last_error: u.last_error.clone(),
            })
            .collect();

        RunnerStatus {
            apps,
            unavailable,
            pools_started: self.pools_started.load(Ordering::Relaxed),
            pools_stopped: self.pools_stopped.load(Ordering::Relaxed),
            parked_writes: self.recorder.parked_writes(),
        }
    }

    /// Every queue empty with nothing in flight.
    pub async fn is_idle(&self) -> bool {
        self.apps
            .read()
            .await
            .values()
            .all(|e| e.pool.queue().is_idle())
    }

    /// Wait until [`AppRunner::is_idle`] or `cancel` fires.
    pub async fn wait_idle(&self, poll: Duration, cancel: &CancellationToken) {
        while !self.is_idle().await {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    pub fn pools_started(&self) -> u64 {
        self.pools_started.load(Ordering::Relaxed)
    }

    pub fn pools_stopped(&self) -> u64 {
        self.pools_stopped.load(Ordering::Relaxed)
    }
}

/// Exclusive access to pool changes, from [`AppRunner::changes`].
pub struct AppChanges<'a> {
    runner: &'a AppRunner,
    _guard: MutexGuard<'a, ()>,
}

impl AppChanges<'_> {
    /// Start a pool for `app`, replacing any pool it already has. On failure
    /// the app is marked unavailable and retried with backoff.
    pub async fn add(&self, app: App) -> Result<(), DispatchError> {
        let runner = self.runner;
        self.remove_pool(app.id).await;

        let size = runner.pool_size(&app);
        let pool = match DispatcherLoop::start(
            app.clone(),
            runner.factory.clone(),
            runner.recorder.clone(),
            runner.settings.clone(),
            runner.faults.clone(),
            size,
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                runner.mark_unavailable(app, &e.to_string());
                return Err(e);
            }
        };

        let feedback = match runner.factory.feedback_receiver(&app) {
            Ok(Some(receiver)) => {
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(receiver.run(cancel.clone()));
                Some((cancel, handle))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(app = %app.name, error = %e, "Feedback receiver not started");
                None
            }
        };

        runner.unavailable.lock().remove(&app.id);
        runner.pools_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            app = %app.name,
            provider = %app.provider,
            workers = size,
            "App started"
        );

        let entry = AppEntry {
            fingerprint: app.fingerprint(),
            app,
            pool,
            feedback,
        };
        let displaced = runner.apps.write().await.insert(entry.app.id, entry);
        if let Some(displaced) = displaced {
            runner.teardown(displaced).await;
        }
        Ok(())
    }

    /// Stop the app's pool and hand its queued notifications back to the
    /// store. Returns whether anything was known about the app.
    pub async fn remove(&self, app_id: Uuid) -> bool {
        let was_unavailable = self.runner.unavailable.lock().remove(&app_id).is_some();
        self.remove_pool(app_id).await || was_unavailable
    }

    async fn remove_pool(&self, app_id: Uuid) -> bool {
        let entry = self.runner.apps.write().await.remove(&app_id);
        match entry {
            Some(entry) => {
                self.runner.teardown(entry).await;
                true
            }
            None => false,
        }
    }

    /// Apply a new pool size to a running app.
    pub async fn resize(&self, app: &App) -> Result<(), DispatchError> {
        let runner = self.runner;
        let size = runner.pool_size(app);
        let mut apps = runner.apps.write().await;
        let Some(entry) = apps.get_mut(&app.id) else {
            if let Some(waiting) = runner.unavailable.lock().get_mut(&app.id) {
                waiting.app.connections = app.connections;
            }
            return Ok(());
        };
        entry.app.connections = app.connections;
        entry.pool.resize(size).await
    }

    /// Every app the runner tracks, running or waiting to be retried, with
    /// the fingerprint it was started from.
    pub async fn known_apps(&self) -> HashMap<Uuid, (App, String)> {
        let runner = self.runner;
        let mut known: HashMap<Uuid, (App, String)> = runner
            .unavailable
            .lock()
            .values()
            .map(|u| (u.app.id, (u.app.clone(), u.app.fingerprint())))
            .collect();
        for entry in runner.apps.read().await.values() {
            known.insert(entry.app.id, (entry.app.clone(), entry.fingerprint.clone()));
        }
        known
    }

    /// Stop pools whose workers reported a configuration fault and mark
    /// their apps unavailable. Faults from pools already replaced are ignored.
    async fn retire_faulted(&self) {
        let runner = self.runner;
        for (app_id, fault) in runner.faults.take() {
            let entry = {
                let mut apps = runner.apps.write().await;
                match apps.get(&app_id) {
                    Some(entry) if entry.pool.id() == fault.pool_id => apps.remove(&app_id),
                    _ => None,
                }
            };
            let Some(entry) = entry else {
                continue;
            };
            let app = entry.app.clone();
            runner.teardown(entry).await;
            runner.mark_unavailable(app, &fault.error);
        }
    }
}
