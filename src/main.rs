//! pulse-backend - background worker entry point
//!
//! Boots the splitting worker, execution worker, and timeout monitor against
//! a shared PostgreSQL pool. SIGINT/SIGTERM fan out through a watch channel;
//! each worker finishes its claimed batch and exits, while anything orphaned
//! by a hard kill is recovered later through lease expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use pulse_backend::broker::{BrokerAdapter, MockBroker, ZerodhaBroker};
use pulse_backend::config::Settings;
use pulse_backend::db::Database;
use pulse_backend::workers::{ExecutionWorker, SplittingWorker, TimeoutMonitor};
use pulse_backend::logging;

const CONNECT_ATTEMPTS: u32 = 10;

async fn connect_with_retry(settings: &Settings) -> anyhow::Result<Database> {
    let mut delay = Duration::from_secs(1);

    for attempt in 1..=CONNECT_ATTEMPTS {
        match Database::connect(&settings.store).await {
            Ok(db) => {
                info!(attempt, "Connected to PostgreSQL");
                return Ok(db);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                error!(
                    attempt,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "PostgreSQL connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e.into()),
        }
    }

    unreachable!("connect loop returns before exhausting attempts")
}

fn build_broker(settings: &Settings) -> anyhow::Result<Arc<dyn BrokerAdapter>> {
    if settings.broker.use_mock {
        info!(
            scenario = settings.broker.mock_scenario.as_str(),
            "Using mock broker"
        );
        return Ok(Arc::new(MockBroker::new(settings.broker.mock_scenario)));
    }

    let api_key = settings
        .broker
        .api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("BROKER_API_KEY required when BROKER_USE_MOCK=false"))?;
    let access_token = settings.broker.access_token.clone().ok_or_else(|| {
        anyhow::anyhow!("BROKER_ACCESS_TOKEN required when BROKER_USE_MOCK=false")
    })?;

    info!("Using Zerodha broker");
    let broker =
        ZerodhaBroker::new(api_key, access_token).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(Arc::new(broker))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let _guard = logging::init_logging(&settings);

    info!(
        service = %settings.service_name,
        environment = %settings.environment,
        "Starting pulse background workers"
    );

    let db = connect_with_retry(&settings).await?;
    db.ensure_schema().await?;

    let broker = build_broker(&settings)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let splitting = SplittingWorker::new(&db, settings.splitting_worker.clone());
    let execution = ExecutionWorker::new(
        &db,
        broker.clone(),
        settings.execution_worker.clone(),
        0,
    );
    let monitor = TimeoutMonitor::new(
        &db,
        settings.timeout_monitor.clone(),
        settings.execution_worker.executor_timeout_minutes,
    );

    let splitting_task = tokio::spawn(splitting.run(shutdown_rx.clone()));
    let execution_task = tokio::spawn(execution.run(shutdown_rx.clone()));
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));

    info!("All workers started");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("splitting_worker", splitting_task),
        ("execution_worker", execution_task),
        ("timeout_monitor", monitor_task),
    ] {
        if let Err(e) = task.await {
            error!(worker = name, error = %e, "Worker task join failed");
        }
    }

    info!("Pulse background workers stopped");
    Ok(())
}
