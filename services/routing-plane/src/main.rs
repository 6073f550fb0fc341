//! netfab routing plane
//!
//! Daemon that schedules logical routers onto hosting-device capacity and
//! keeps retrying backlogged routers until they find a home.

use std::sync::Arc;

use anyhow::Result;
use netfab_routing_plane::{
    builtin::{ApplianceConfigDriver, CapacityScheduler, LoggingDeviceManager, LoggingNotifier},
    config,
    registry::CapabilityRegistry,
    scheduler::{BacklogWorker, SchedulingCoordinator},
    store::BindingStore,
    translog::TransactionLog,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to NETFAB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting netfab routing plane");
    info!(db_path = %config.db_path, "Configuration loaded");

    // Open the binding store
    let store = match BindingStore::open(&config.db_path) {
        Ok(store) => {
            info!("Binding store opened");
            Arc::new(store)
        }
        Err(e) => {
            error!(error = %e, "Failed to open binding store");
            return Err(e.into());
        }
    };

    // Register built-in capabilities for the configured router types
    let registry = Arc::new(CapabilityRegistry::new());
    let scheduler = Arc::new(CapacityScheduler);
    let driver = Arc::new(ApplianceConfigDriver::new());
    for router_type in [&config.default_router_type, &config.hardware_router_type] {
        registry.register_scheduler(router_type, scheduler.clone());
        registry.register_driver(router_type, driver.clone());
    }
    registry.register_device_manager(Arc::new(LoggingDeviceManager));
    registry.register_notifier("cfg-agent", Arc::new(LoggingNotifier));

    let translog = Arc::new(TransactionLog::new(
        config.txn_log_enabled,
        config.txn_max_parent_records,
        config.txn_max_child_records,
    ));

    let coordinator = Arc::new(SchedulingCoordinator::new(
        store,
        registry,
        translog,
        &config.namespace_router_type,
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start backlog worker in background
    let backlog_worker = BacklogWorker::new(Arc::clone(&coordinator), config.backlog_interval);
    let backlog_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            backlog_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to the worker
    let _ = shutdown_tx.send(true);

    // Wait for the worker to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, backlog_handle).await {
        warn!(error = %e, "Backlog worker did not shut down in time");
    }

    info!("Routing plane shutdown complete");
    Ok(())
}
