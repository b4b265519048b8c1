//! Reconciles running pools with the apps in the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pushgate_common::error::AppError;
use pushgate_common::types::App;
use pushgate_store::Store;

use crate::app_runner::AppRunner;

/// Pool changes made by one [`Synchronizer::sync`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    /// Credentials changed: the old pool was stopped before the new one started.
    pub restarted: usize,
    pub resized: usize,
    /// Pools that could not start and are now retried by the runner.
    pub failed: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Synchronizer {
    store: Arc<dyn Store>,
    runner: Arc<AppRunner>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn Store>, runner: Arc<AppRunner>) -> Self {
        Self { store, runner }
    }

    /// Diff the store's enabled apps against the runner by id, credential
    /// fingerprint and pool size. Running it again without store changes
    /// makes no changes.
    ///
    /// Holds the runner's change lock throughout, so concurrent syncs (a
    /// reload signal during a periodic pass) apply one after the other.
    pub async fn sync(&self) -> Result<SyncReport, AppError> {
        let changes = self.runner.changes().await;
        let desired: HashMap<Uuid, App> = self
            .store
            .list_apps()
            .await?
            .into_iter()
            .filter(|a| a.enabled)
            .map(|a| (a.id, a))
            .collect();
        let known = changes.known_apps().await;
        let mut report = SyncReport::default();

        for (id, (app, _)) in &known {
            if !desired.contains_key(id) {
                tracing::info!(app = %app.name, "App removed or disabled");
                changes.remove(*id).await;
                report.removed += 1;
            }
        }

        for (id, app) in desired {
            match known.get(&id) {
                None => match changes.add(app).await {
                    Ok(()) => report.added += 1,
                    Err(_) => report.failed += 1,
                },
                Some((_, fingerprint)) if *fingerprint != app.fingerprint() => {
                    tracing::info!(app = %app.name, "App credentials changed, restarting pool");
                    changes.remove(id).await;
                    match changes.add(app).await {
                        Ok(()) => report.restarted += 1,
                        Err(_) => report.failed += 1,
                    }
                }
                Some((running, _))
                    if self.runner.pool_size(running) != self.runner.pool_size(&app) =>
                {
                    match changes.resize(&app).await {
                        Ok(()) => report.resized += 1,
                        Err(e) => {
                            tracing::error!(app = %app.name, error = %e, "Failed to resize pool");
                            report.failed += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        if report.is_empty() {
            tracing::debug!("Apps in sync");
        } else {
            tracing::info!(
                added = report.added,
                removed = report.removed,
                restarted = report.restarted,
                resized = report.resized,
                failed = report.failed,
                "Apps synchronised"
            );
        }
        Ok(report)
    }

    /// Re-run [`Synchronizer::sync`] every `interval` until cancelled.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sync().await {
                tracing::error!(error = %e, "Periodic sync failed");
            }
        }
    }
}
