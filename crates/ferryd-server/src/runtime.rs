// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for ferryd-server.
//!
//! This module provides [`ServerRuntime`] which allows embedding the
//! transfer agent into an existing tokio application instead of running
//! it as a standalone daemon.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ferryd_core::persistence::PostgresPersistence;
//! use ferryd_server::runtime::ServerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let persistence = Arc::new(PostgresPersistence::new(pool));
//!
//!     let runtime = ServerRuntime::builder()
//!         .persistence(persistence)
//!         .message_dir("/var/lib/ferryd")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use ferryd_core::{OptimizerRegistry, Persistence};

use crate::credentials::{CredentialStore, DirCredentialStore};
use crate::dispatcher::{DispatcherConfig, TransferDispatcher};
use crate::executor::{ExecutorConfig, TransferExecutor};
use crate::process_registry::ProcessRegistry;
use crate::reconciler::{ReconcilerConfig, StatusReconciler};
use crate::spool::{Producer, Subqueue};
use crate::stall_monitor::{StallMonitor, StallMonitorConfig};

/// Builder for creating a [`ServerRuntime`].
pub struct ServerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    message_dir: PathBuf,
    credential_dir: PathBuf,
    executor_config: ExecutorConfig,
    dispatcher_config: DispatcherConfig,
    reconciler_config: ReconcilerConfig,
    stall_monitor_config: StallMonitorConfig,
}

impl Default for ServerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            credentials: None,
            message_dir: PathBuf::from("/var/lib/ferryd"),
            credential_dir: PathBuf::from("/tmp"),
            executor_config: ExecutorConfig::default(),
            dispatcher_config: DispatcherConfig::default(),
            reconciler_config: ReconcilerConfig::default(),
            stall_monitor_config: StallMonitorConfig::default(),
        }
    }
}

impl ServerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the credential store.
    ///
    /// Default: a [`DirCredentialStore`] over the credential directory.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the spool directory shared with the copy processes.
    ///
    /// Default: `/var/lib/ferryd`
    pub fn message_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.message_dir = path.into();
        self
    }

    /// Set the directory delegated proxy certificates are read from.
    ///
    /// Only used when no explicit credential store is set.
    ///
    /// Default: `/tmp`
    pub fn credential_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_dir = path.into();
        self
    }

    /// Set the url-copy executor configuration.
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Set the dispatcher configuration.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Set the status reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = config;
        self
    }

    /// Set the stall monitor configuration.
    pub fn stall_monitor_config(mut self, config: StallMonitorConfig) -> Self {
        self.stall_monitor_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ServerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(DirCredentialStore::new(&self.credential_dir)));

        Ok(ServerRuntimeConfig {
            persistence,
            credentials,
            message_dir: self.message_dir,
            executor_config: self.executor_config,
            dispatcher_config: self.dispatcher_config,
            reconciler_config: self.reconciler_config,
            stall_monitor_config: self.stall_monitor_config,
        })
    }
}

/// Configuration for a [`ServerRuntime`].
pub struct ServerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    credentials: Arc<dyn CredentialStore>,
    message_dir: PathBuf,
    executor_config: ExecutorConfig,
    dispatcher_config: DispatcherConfig,
    reconciler_config: ReconcilerConfig,
    stall_monitor_config: StallMonitorConfig,
}

impl ServerRuntimeConfig {
    /// Start the runtime, spawning the dispatcher, reconciler and stall
    /// monitor tasks.
    pub async fn start(self) -> Result<ServerRuntime> {
        let registry = ProcessRegistry::new();
        let optimizer = Arc::new(OptimizerRegistry::new());

        let executor = Arc::new(TransferExecutor::new(
            self.persistence.clone(),
            optimizer,
            registry.clone(),
            Producer::new(&self.message_dir, Subqueue::Monitoring)?,
            self.executor_config,
        ));

        let dispatcher = TransferDispatcher::new(
            self.persistence.clone(),
            executor,
            self.credentials.clone(),
            self.dispatcher_config,
        );
        let dispatcher_shutdown = dispatcher.shutdown_handle();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let reconciler = StatusReconciler::new(
            self.persistence.clone(),
            registry.clone(),
            &self.message_dir,
            self.reconciler_config,
        )?;
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let stall_monitor = StallMonitor::new(
            registry.clone(),
            Producer::new(&self.message_dir, Subqueue::Status)?,
            self.stall_monitor_config,
        );
        let stall_shutdown = stall_monitor.shutdown_handle();
        let stall_handle = tokio::spawn(async move {
            stall_monitor.run().await;
        });

        info!(
            message_dir = %self.message_dir.display(),
            "ServerRuntime started"
        );

        Ok(ServerRuntime {
            dispatcher_handle,
            reconciler_handle,
            stall_handle,
            dispatcher_shutdown,
            reconciler_shutdown,
            stall_shutdown,
            registry,
        })
    }
}

/// A running transfer agent that can be embedded in an application.
///
/// The runtime manages:
/// - Transfer dispatcher offering queued files to the admission layer
/// - Status reconciler folding spooled copy-process reports into the database
/// - Stall monitor reaping copy processes that stopped reporting
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServerRuntime {
    dispatcher_handle: JoinHandle<()>,
    reconciler_handle: JoinHandle<()>,
    stall_handle: JoinHandle<()>,
    dispatcher_shutdown: Arc<Notify>,
    reconciler_shutdown: Arc<Notify>,
    stall_shutdown: Arc<Notify>,
    registry: ProcessRegistry,
}

impl ServerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ServerRuntimeBuilder {
        ServerRuntimeBuilder::new()
    }

    /// Get the registry of copy processes spawned by this runtime.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Gracefully shut down the runtime.
    ///
    /// This signals the dispatcher, reconciler and stall monitor to stop,
    /// then waits for them to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("ServerRuntime shutting down...");

        self.dispatcher_shutdown.notify_one();
        self.reconciler_shutdown.notify_one();
        self.stall_shutdown.notify_one();

        let mut panicked = 0;

        if let Err(e) = self.dispatcher_handle.await {
            error!("Transfer dispatcher task panicked: {}", e);
            panicked += 1;
        }

        if let Err(e) = self.reconciler_handle.await {
            error!("Status reconciler task panicked: {}", e);
            panicked += 1;
        }

        if let Err(e) = self.stall_handle.await {
            error!("Stall monitor task panicked: {}", e);
            panicked += 1;
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{panicked} worker tasks panicked"));
        }

        info!("ServerRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.dispatcher_handle.is_finished()
            && !self.reconciler_handle.is_finished()
            && !self.stall_handle.is_finished()
    }
}
