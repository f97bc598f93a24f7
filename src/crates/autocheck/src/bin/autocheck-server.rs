//! AutoCheck server binary
//!
//! Connects the message bus, the snapshot cache and the relational store,
//! loads the pile directory, then serves self-check traffic until shutdown.

use anyhow::Context;
use autocheck::bus::{AmqpBus, MessageBus};
use autocheck::check::{CheckEvent, OrchestratorDeps, SelfCheckOrchestrator};
use autocheck::config::AppConfig;
use autocheck::db::repositories::{DeviceRepository, SelfCheckRecordRepository};
use autocheck::db::{DataStore, SqlxConnector};
use autocheck::device::{DeviceDirectory, DeviceRegistry};
use autocheck::kv::{RedisSnapshotStore, SnapshotStore};
use autocheck::watcher::OnlineStatusWatcher;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "autocheck-server")]
#[command(about = "Remote self-check service for charging piles", version)]
struct Args {
    /// Configuration file (defaults to AUTOCHECK_CONFIG or config/autocheck.toml)
    #[arg(short, long, env = "AUTOCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Trigger a self-check for this device once startup completes; repeatable
    #[arg(long = "check", value_name = "EQUIP_NO")]
    checks: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    tracing::info!(version = autocheck::version(), "Starting autocheck server");

    // Key-value cache
    let redis = Arc::new(RedisSnapshotStore::new(config.redis.clone())?);
    redis.connect_async();
    if !redis
        .wait_for_connection(std::time::Duration::from_millis(config.redis.connect_timeout_ms))
        .await
    {
        tracing::warn!("Redis not reachable yet, module snapshots unavailable until it is");
    }

    // Message bus
    let amqp = Arc::new(AmqpBus::new(config.rabbitmq.clone()));
    amqp.connect_async();
    if !amqp.wait_for_connection(config.rabbitmq.connect_timeout()).await {
        tracing::warn!("RabbitMQ not reachable yet, commands will connect on demand");
    }

    // Relational store
    tracing::info!(master = %config.database.master.display_addr(), "Connecting to database");
    let store = Arc::new(
        DataStore::connect(config.database.clone(), Arc::new(SqlxConnector::new()))
            .await
            .context("failed to connect to the database")?,
    );
    SelfCheckRecordRepository::create_table(&store).await?;

    let registry = Arc::new(DeviceRegistry::new());
    match DeviceRepository::load_piles(&store).await {
        Ok(piles) => {
            tracing::info!(count = piles.len(), "Loaded pile directory");
            registry.extend(piles);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to load pile directory"),
    }

    let kv: Arc<dyn SnapshotStore> = redis.clone();
    let bus: Arc<dyn MessageBus> = amqp.clone();
    let devices: Arc<dyn DeviceDirectory> = registry.clone();

    let orchestrator = Arc::new(SelfCheckOrchestrator::new(
        OrchestratorDeps {
            bus,
            kv: Arc::clone(&kv),
            store: Arc::clone(&store),
            devices: Arc::clone(&devices),
        },
        config.selfcheck.clone(),
    ));
    orchestrator
        .subscribe()
        .await
        .context("failed to subscribe to self-check queues")?;
    let watchdog = orchestrator.spawn_watchdog();
    let event_log = spawn_event_log(&orchestrator);

    let watcher = Arc::new(OnlineStatusWatcher::new(kv, devices, &config.watcher));
    let watcher_task = if config.watcher.enabled {
        watcher.start()
    } else {
        None
    };

    for device_id in &args.checks {
        match orchestrator.trigger_check(device_id).await {
            Ok(request_id) => {
                tracing::info!(
                    device_id = %device_id,
                    request_id = request_id,
                    "Self-check triggered"
                )
            }
            Err(e) => {
                tracing::error!(device_id = %device_id, error = %e, "Failed to trigger self-check")
            }
        }
    }

    shutdown_signal().await;

    watcher.stop();
    if let Some(task) = watcher_task {
        task.abort();
    }
    watchdog.abort();
    event_log.abort();
    amqp.close().await;
    redis.disconnect().await;

    let stats = store.stats();
    tracing::info!(
        statements = stats.statements,
        slow_statements = stats.slow_statements,
        "Autocheck server shut down gracefully"
    );
    Ok(())
}

/// Log every self-check event
fn spawn_event_log(orchestrator: &Arc<SelfCheckOrchestrator>) -> tokio::task::JoinHandle<()> {
    let mut events = orchestrator.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CheckEvent::Result {
                    device_id,
                    request_id,
                    state,
                    result_code,
                    success_count,
                    fail_count,
                }) => tracing::info!(
                    device_id = %device_id,
                    request_id = request_id,
                    state = %state,
                    result_code = result_code,
                    success_count = success_count,
                    fail_count = fail_count,
                    "Self-check result"
                ),
                Ok(event) => tracing::debug!(event = ?event, "Self-check event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Event log lagging")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received CTRL-C signal, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM signal, shutting down"),
    }
}
