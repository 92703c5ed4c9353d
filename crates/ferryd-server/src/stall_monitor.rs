// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reaper for url-copy processes that stopped reporting progress.
//!
//! A transfer that neither finishes nor sends heartbeats keeps a slot
//! occupied forever. The stall monitor sweeps the process registry,
//! kills processes silent for longer than the configured timeout and
//! records a synthetic failure on the status spool so the reconciler
//! closes the transfer through the normal path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::messages::StatusMessage;
use crate::process_registry::ProcessRegistry;
use crate::spool::Producer;

/// Failure reason recorded for transfers killed by the stall monitor.
const STALL_REASON: &str = "Transfer has been forced-canceled because it was stalled";

/// Stall monitor configuration.
#[derive(Debug, Clone)]
pub struct StallMonitorConfig {
    /// Interval between registry sweeps
    pub sweep_interval: Duration,
    /// How long a process may stay silent before it is killed
    pub stall_timeout: Duration,
}

impl Default for StallMonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(360),
        }
    }
}

/// Background task that kills stalled url-copy processes.
pub struct StallMonitor {
    registry: ProcessRegistry,
    status: Producer,
    config: StallMonitorConfig,
    shutdown: Arc<Notify>,
}

impl StallMonitor {
    /// Create a new stall monitor.
    pub fn new(registry: ProcessRegistry, status: Producer, config: StallMonitorConfig) -> Self {
        Self {
            registry,
            status,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop.
    pub async fn run(self) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            stall_timeout_secs = self.config.stall_timeout.as_secs(),
            "Stall monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stall monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    let reaped = self.sweep().await;
                    if reaped > 0 {
                        info!(reaped, "Stall sweep complete");
                    }
                }
            }
        }

        info!("Stall monitor stopped");
    }

    /// Sweep the registry once. Returns how many transfers were reaped.
    async fn sweep(&self) -> usize {
        let mut reaped = 0;
        for entry in self.registry.stalled(self.config.stall_timeout) {
            warn!(
                job_id = %entry.job_id,
                file_id = entry.file_id,
                pid = entry.pid,
                silent_secs = entry.silent_for.as_secs(),
                "Transfer stalled, forcing it down"
            );

            // Registry entries always carry a real child pid. Refuse to
            // signal anything else so a corrupt entry can never take out
            // this process or a whole process group.
            if entry.pid > 0 && entry.pid != std::process::id() as i32 {
                match kill(Pid::from_raw(entry.pid), Signal::SIGKILL) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {
                        debug!(pid = entry.pid, "Stalled process already gone");
                    }
                    Err(e) => {
                        warn!(pid = entry.pid, error = %e, "Failed to kill stalled process");
                    }
                }
            } else {
                warn!(pid = entry.pid, "Refusing to signal suspicious pid");
            }

            let message = StatusMessage {
                job_id: entry.job_id.clone(),
                file_id: entry.file_id,
                vo_name: String::new(),
                source_se: String::new(),
                dest_se: String::new(),
                transfer_status: "FAILED".to_string(),
                transfer_message: STALL_REASON.to_string(),
                retry: true,
                process_id: entry.pid,
                timestamp: Utc::now(),
                filesize: 0,
                tx_duration: 0.0,
                throughput: 0.0,
            };

            match self.status.put(&message).await {
                Ok(()) => {
                    self.registry.remove(&entry.job_id, entry.file_id);
                    reaped += 1;
                }
                Err(e) => {
                    // Entry stays registered, the next sweep tries again.
                    error!(
                        job_id = %entry.job_id,
                        file_id = entry.file_id,
                        error = %e,
                        "Failed to record stalled transfer"
                    );
                }
            }
        }
        reaped
    }
}
