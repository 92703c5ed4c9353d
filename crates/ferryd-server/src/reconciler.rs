// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spool consumer turning url-copy reports into database state.
//!
//! Copy processes never talk to the database. They drop status, log and
//! progress messages on the local spool and this task folds them in:
//! terminal states, retries, whole-process failures, log locations and
//! throughput markers. Messages are claimed, applied and acked; a claim
//! whose database write fails is released so a later cycle retries it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use ferryd_core::persistence::{LogRecord, ProgressMarker};
use ferryd_core::{Persistence, TransferState};

use crate::error::Result;
use crate::messages::{LogMessage, ProgressMessage, StateMessage, StatusMessage};
use crate::process_registry::ProcessRegistry;
use crate::spool::{Consumer, Producer, Subqueue};

/// Delay before the next cycle when the database is unreachable.
const UNHEALTHY_BACKOFF: Duration = Duration::from_secs(10);

/// Pause before retrying a failed bulk write.
const DB_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Message fragments that mean the whole copy process is gone, not just
/// the file the message is about.
const PROCESS_FATAL_MARKERS: [&str; 4] = [
    "Transfer terminate handler called",
    "Transfer process died",
    "because it was stalled",
    "canceled because it was not responding",
];

fn is_process_fatal(message: &str) -> bool {
    PROCESS_FATAL_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}

/// Status reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Idle delay between spool scans
    pub poll_interval: Duration,
    /// Maximum messages claimed per subqueue per cycle
    pub drain_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            drain_limit: 500,
        }
    }
}

/// Background task that applies spooled url-copy reports to the database.
pub struct StatusReconciler {
    db: Arc<dyn Persistence>,
    registry: ProcessRegistry,
    status: Consumer,
    logs: Consumer,
    progress: Consumer,
    monitoring: Producer,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl StatusReconciler {
    /// Create a new reconciler over the spool rooted at `message_dir`.
    pub fn new(
        db: Arc<dyn Persistence>,
        registry: ProcessRegistry,
        message_dir: &Path,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        Ok(Self {
            db,
            registry,
            status: Consumer::new(message_dir, Subqueue::Status)?,
            logs: Consumer::new(message_dir, Subqueue::Logs)?,
            progress: Consumer::new(message_dir, Subqueue::Stalled)?,
            monitoring: Producer::new(message_dir, Subqueue::Monitoring)?,
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconcile loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            drain_limit = self.config.drain_limit,
            "Status reconciler started"
        );

        // Claims left behind by a previous process become visible again.
        for consumer in [&self.status, &self.logs, &self.progress] {
            match consumer.recover().await {
                Ok(0) => {}
                Ok(requeued) => info!(requeued, "Recovered in-flight spool messages"),
                Err(e) => warn!(error = %e, "Spool recovery failed"),
            }
        }

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    delay = match self.cycle().await {
                        Ok(next) => next,
                        Err(e) => {
                            error!(error = %e, "Reconcile cycle failed");
                            self.config.poll_interval
                        }
                    };
                }
            }
        }

        info!("Status reconciler stopped");
    }

    /// One reconcile cycle. Returns the delay until the next one.
    async fn cycle(&self) -> Result<Duration> {
        match self.db.health_check_db().await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Database unhealthy, leaving spool untouched");
                return Ok(UNHEALTHY_BACKOFF);
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed, leaving spool untouched");
                return Ok(UNHEALTHY_BACKOFF);
            }
        }

        let statuses = self.drain_status().await?;
        let logs = self.drain_logs().await?;
        let markers = self.drain_progress().await?;
        if statuses + logs + markers > 0 {
            debug!(statuses, logs, markers, "Reconcile cycle complete");
        }

        Ok(self.config.poll_interval)
    }

    async fn drain_status(&self) -> Result<usize> {
        let claims = self
            .status
            .drain::<StatusMessage>(self.config.drain_limit)
            .await?;
        let count = claims.len();
        for claimed in claims {
            match self.apply_status(&claimed.message).await {
                Ok(()) => claimed.ack().await?,
                Err(e) => {
                    warn!(
                        job_id = %claimed.message.job_id,
                        file_id = claimed.message.file_id,
                        error = %e,
                        "Status update failed, requeueing message"
                    );
                    claimed.release().await?;
                }
            }
        }
        Ok(count)
    }

    /// Fold one status message into the database.
    ///
    /// Any error returned here leaves the message claimed so the caller
    /// can release it. Applying the same message twice must stay safe.
    async fn apply_status(&self, m: &StatusMessage) -> ferryd_core::Result<()> {
        // Every report is a sign of life for the stall monitor.
        self.registry.touch(&m.job_id, m.file_id);

        // Keep-alive only, nothing to persist.
        if m.transfer_status == "UPDATE" {
            return Ok(());
        }

        if m.process_id > 0 && is_process_fatal(&m.transfer_message) {
            warn!(
                job_id = %m.job_id,
                pid = m.process_id,
                reason = %m.transfer_message,
                "Copy process died, failing every transfer it served"
            );
            let failed = self
                .db
                .terminate_reuse_process(&m.job_id, m.process_id, &m.transfer_message)
                .await?;
            self.registry.remove_pid(m.process_id);
            self.db
                .update_job_transfer_status(&m.job_id, TransferState::Failed.as_str())
                .await?;
            for file_id in failed {
                self.publish_state(m, file_id, TransferState::Failed.as_str())
                    .await;
            }
            return Ok(());
        }

        let state: TransferState = match m.transfer_status.parse() {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    job_id = %m.job_id,
                    file_id = m.file_id,
                    status = %m.transfer_status,
                    "Discarding message with unknown transfer status"
                );
                return Ok(());
            }
        };

        if state.is_terminal() {
            self.registry.remove(&m.job_id, m.file_id);
        }

        if state == TransferState::Failed && m.retry {
            let budget = self.db.retry_budget(&m.job_id).await?;
            let used = self.db.current_retry_count(&m.job_id, m.file_id).await?;
            if used < budget {
                let attempt = used + 1;
                self.db
                    .set_retry_transfer(&m.job_id, m.file_id, attempt, &m.transfer_message)
                    .await?;
                info!(
                    job_id = %m.job_id,
                    file_id = m.file_id,
                    attempt,
                    budget,
                    "Transfer requeued for retry"
                );
                self.publish_state(m, m.file_id, TransferState::Submitted.as_str())
                    .await;
                return Ok(());
            }
        }

        let updated = self
            .db
            .update_file_transfer_status(
                &m.job_id,
                m.file_id,
                state.as_str(),
                &m.transfer_message,
                m.process_id,
                m.filesize,
                m.tx_duration,
                m.throughput,
            )
            .await?;
        if !updated {
            if state.is_terminal() && state != TransferState::Canceled {
                warn!(
                    job_id = %m.job_id,
                    file_id = m.file_id,
                    status = state.as_str(),
                    "Transfer already settled in a different state"
                );
            }
            return Ok(());
        }

        self.db
            .update_job_transfer_status(&m.job_id, state.as_str())
            .await?;
        if !m.job_id.is_empty() && m.file_id > 0 {
            self.publish_state(m, m.file_id, state.as_str()).await;
        }
        Ok(())
    }

    async fn publish_state(&self, m: &StatusMessage, file_id: i64, state: &str) {
        let retry_counter = self
            .db
            .current_retry_count(&m.job_id, file_id)
            .await
            .unwrap_or(0);
        let note = StateMessage {
            job_id: m.job_id.clone(),
            file_id,
            state: state.to_string(),
            vo_name: m.vo_name.clone(),
            source_se: m.source_se.clone(),
            dest_se: m.dest_se.clone(),
            retry_counter,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.monitoring.put(&note).await {
            warn!(job_id = %m.job_id, file_id, error = %e, "Failed to publish state change");
        }
    }

    async fn drain_logs(&self) -> Result<usize> {
        let claims = self
            .logs
            .drain::<LogMessage>(self.config.drain_limit)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let records: Vec<LogRecord> = claims
            .iter()
            .map(|claimed| LogRecord {
                job_id: claimed.message.job_id.clone(),
                file_id: claimed.message.file_id,
                host: claimed.message.host.clone(),
                log_path: claimed.message.log_path.clone(),
                debug_log: claimed.message.debug_log,
                timestamp: claimed.message.timestamp,
            })
            .collect();

        if let Err(first) = self.db.update_log_paths(&records).await {
            warn!(error = %first, "Log path update failed, retrying once");
            if let Err(second) = self.db.update_log_paths(&records).await {
                warn!(error = %second, "Log path update failed twice, requeueing batch");
                for claimed in claims {
                    claimed.release().await?;
                }
                return Ok(0);
            }
        }

        let count = claims.len();
        for claimed in claims {
            claimed.ack().await?;
        }
        Ok(count)
    }

    async fn drain_progress(&self) -> Result<usize> {
        let claims = self
            .progress
            .drain::<ProgressMessage>(self.config.drain_limit)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        for claimed in &claims {
            self.registry
                .touch(&claimed.message.job_id, claimed.message.file_id);
        }

        let markers: Vec<ProgressMarker> = claims
            .iter()
            .map(|claimed| ProgressMarker {
                job_id: claimed.message.job_id.clone(),
                file_id: claimed.message.file_id,
                pid: claimed.message.process_id,
                throughput: claimed.message.throughput,
                transferred: claimed.message.transferred,
                timestamp: claimed.message.timestamp,
            })
            .collect();

        if let Err(first) = self.db.update_transfer_progress(&markers).await {
            warn!(error = %first, "Progress update failed, retrying once");
            tokio::time::sleep(DB_RETRY_PAUSE).await;
            if let Err(second) = self.db.update_transfer_progress(&markers).await {
                // Markers are superseded by the next report, dropping a
                // batch loses nothing durable.
                warn!(error = %second, "Progress update failed twice, dropping batch");
            }
        }

        let count = claims.len();
        for claimed in claims {
            claimed.ack().await?;
        }
        Ok(count)
    }
}
