use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pushgate_common::config::AppConfig;
use pushgate_notifier::{AppRunner, Feeder, ProviderDispatchers, Synchronizer};

const APP_RETRY_TICK: Duration = Duration::from_secs(1);
const IDLE_POLL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pushgate_notifier=info,pushgate_store=info".into());
    if config.pretty_logs {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }

    tracing::info!(store = ?config.store, push_mode = config.push_mode, "Pushgate starting...");

    let store = pushgate_store::connect(&config).await?;
    let released = store.release_stale_claims().await?;
    if released > 0 {
        tracing::info!(released, "Released claims left by a previous run");
    }

    let factory = Arc::new(ProviderDispatchers::new(&config, store.clone())?);
    let runner = Arc::new(AppRunner::new(&config, store.clone(), factory));
    let synchronizer = Arc::new(Synchronizer::new(store.clone(), runner.clone()));

    synchronizer.sync().await?;

    let shutdown = CancellationToken::new();
    let retry_loop = runner.spawn_retry_loop(APP_RETRY_TICK, shutdown.clone());
    store.release_connection().await;

    let feeder = Arc::new(Feeder::new(
        &config,
        store.clone(),
        runner.clone(),
        shutdown.child_token(),
    ));

    if config.push_mode {
        let queued = feeder.feed_once().await;
        tracing::info!(queued, "Push mode: delivering due notifications");
        tokio::select! {
            _ = runner.wait_idle(IDLE_POLL, &shutdown) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
        }
    } else {
        let feeder_task = tokio::spawn({
            let feeder = feeder.clone();
            async move { feeder.run().await }
        });
        let sync_task = config.sync_interval.map(|interval| {
            tokio::spawn(
                synchronizer
                    .clone()
                    .run_periodic(interval, shutdown.child_token()),
            )
        });

        wait_for_shutdown(&runner, &synchronizer, &feeder).await?;

        feeder.stop();
        let _ = feeder_task.await;
        shutdown.cancel();
        if let Some(task) = sync_task {
            let _ = task.await;
        }
    }

    shutdown.cancel();
    let _ = retry_loop.await;
    runner.stop().await;

    tracing::info!("Pushgate stopped.");
    Ok(())
}

/// Serve reload and status signals until asked to stop.
#[cfg(unix)]
async fn wait_for_shutdown(
    runner: &AppRunner,
    synchronizer: &Synchronizer,
    feeder: &Feeder,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut status = signal(SignalKind::user_defined2())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("Received SIGHUP, synchronising apps");
                if let Err(e) = synchronizer.sync().await {
                    tracing::error!(error = %e, "Sync failed");
                }
                feeder.wakeup();
            }
            _ = status.recv() => {
                let snapshot = runner.status().await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(status = %json, "Runner status"),
                    Err(e) => tracing::error!(error = %e, "Failed to serialise status"),
                }
            }
            _ = terminate.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Received shutdown signal, stopping gracefully...");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _runner: &AppRunner,
    _synchronizer: &Synchronizer,
    _feeder: &Feeder,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    Ok(())
}
