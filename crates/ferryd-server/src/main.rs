// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ferryd Server - Transfer Agent Daemon
//!
//! The per-node transfer agent responsible for:
//! - Admitting queued transfer files against configured concurrency shares
//! - Spawning and supervising url-copy subprocesses
//! - Folding spooled copy-process reports back into the database
//! - Reaping copy processes that stopped reporting progress

use std::sync::Arc;
use tracing::{info, warn};

use ferryd_core::persistence::PostgresPersistence;
use ferryd_server::config::Config;
use ferryd_server::dispatcher::DispatcherConfig;
use ferryd_server::executor::ExecutorConfig;
use ferryd_server::reconciler::ReconcilerConfig;
use ferryd_server::runtime::ServerRuntime;
use ferryd_server::stall_monitor::StallMonitorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferryd_server=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        host = %config.host_alias,
        message_dir = %config.message_dir.display(),
        url_copy_bin = %config.url_copy_bin.display(),
        optimize_enabled = config.optimize_enabled,
        "Starting Ferryd Server"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    ferryd_core::migrations::run_postgres(&pool).await?;

    info!("Database schema verified");

    let persistence = Arc::new(PostgresPersistence::new(pool));

    // Start the runtime
    let runtime = ServerRuntime::builder()
        .persistence(persistence)
        .message_dir(&config.message_dir)
        .credential_dir(&config.credential_dir)
        .executor_config(ExecutorConfig {
            url_copy_bin: config.url_copy_bin.clone(),
            log_dir: config.log_dir.clone(),
            infosys: config.infosys.clone(),
            debug_level: config.debug_level,
            optimize_enabled: config.optimize_enabled,
        })
        .dispatcher_config(DispatcherConfig {
            poll_interval: config.dispatch_interval,
            drain_backoff: config.drain_backoff,
            fetch_limit: config.fetch_limit,
            chunk_workers: config.chunk_workers,
            host_alias: config.host_alias.clone(),
        })
        .reconciler_config(ReconcilerConfig {
            poll_interval: config.reconcile_interval,
            drain_limit: config.spool_drain_limit,
        })
        .stall_monitor_config(StallMonitorConfig {
            sweep_interval: config.stall_sweep_interval,
            stall_timeout: config.stall_timeout,
        })
        .build()?
        .start()
        .await?;

    info!(host = %config.host_alias, "Transfer agent ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Ferryd Server shut down");

    Ok(())
}
