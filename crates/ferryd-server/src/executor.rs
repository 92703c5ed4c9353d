// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission, parameter resolution and subprocess spawn for one transfer.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use ferryd_core::persistence::ShareConfig;
use ferryd_core::protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_NOSTREAMS, DEFAULT_TIMEOUT};
use ferryd_core::{
    CoreError, OptimizerRegistry, Persistence, ProtocolResolver, TransferFile, TransferScheduler,
    UserProtocol,
};

use crate::copy_command::CopyCommand;
use crate::error::Result;
use crate::messages::StateMessage;
use crate::process_registry::ProcessRegistry;
use crate::spool::Producer;

/// What happened to one candidate transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Admitted, spawned and marked ACTIVE.
    Started,
    /// Denied admission; the file stays queued for a later cycle.
    Denied,
    /// Another node claimed the file first.
    TakenElsewhere,
    /// The subprocess could not be started; the file was reverted for
    /// re-scheduling.
    SpawnFailed,
}

/// Knobs the executor needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Path of the url-copy executable.
    pub url_copy_bin: PathBuf,
    /// Directory url-copy processes log into.
    pub log_dir: PathBuf,
    /// BDII endpoint handed to url-copy processes.
    pub infosys: String,
    /// Debug verbosity forwarded to url-copy processes, 0 disables.
    pub debug_level: u8,
    /// Whether the feedback optimizer drives protocol parameters.
    pub optimize_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url_copy_bin: PathBuf::from("ferryd-url-copy"),
            log_dir: PathBuf::from("/var/log/ferryd"),
            infosys: "lcg-bdii.cern.ch:2170".to_string(),
            debug_level: 0,
            optimize_enabled: true,
        }
    }
}

enum ParamsOutcome {
    Persisted,
    TakenElsewhere,
}

/// Runs one admitted candidate end to end: admission decision, protocol
/// parameter persistence, url-copy spawn and post-spawn bookkeeping.
pub struct TransferExecutor {
    db: Arc<dyn Persistence>,
    scheduler: TransferScheduler,
    resolver: ProtocolResolver,
    registry: ProcessRegistry,
    monitoring: Producer,
    config: ExecutorConfig,
}

impl TransferExecutor {
    /// Create an executor over the shared persistence and optimizer.
    pub fn new(
        db: Arc<dyn Persistence>,
        optimizer: Arc<OptimizerRegistry>,
        registry: ProcessRegistry,
        monitoring: Producer,
        config: ExecutorConfig,
    ) -> Self {
        let scheduler = TransferScheduler::new(db.clone(), optimizer, config.optimize_enabled);
        let resolver = ProtocolResolver::new(db.clone());
        Self {
            db,
            scheduler,
            resolver,
            registry,
            monitoring,
            config,
        }
    }

    /// Try to run one candidate transfer.
    ///
    /// Admission denial is a normal outcome, not an error; the only `Err`
    /// returns here are infrastructure failures (DB down and similar),
    /// which the caller logs and survives.
    pub async fn execute(&self, file: &TransferFile, proxy: &Path) -> Result<ExecuteOutcome> {
        let outcome = self.scheduler.schedule(file).await?;
        if !outcome.allowed {
            debug!(
                job_id = %file.job_id,
                file_id = file.file_id,
                source_se = %file.source_se,
                dest_se = %file.dest_se,
                "Transfer denied admission"
            );
            return Ok(ExecuteOutcome::Denied);
        }

        let mut cmd = CopyCommand::from_transfer(&self.config.url_copy_bin, file);

        match self.apply_protocol(file, &outcome.shares, &mut cmd).await? {
            ParamsOutcome::Persisted => {}
            ParamsOutcome::TakenElsewhere => return Ok(ExecuteOutcome::TakenElsewhere),
        }

        cmd.set_monitoring(true);
        cmd.set_debug_level(self.config.debug_level);
        cmd.set_proxy(proxy);
        cmd.set_infosystem(&self.config.infosys);
        cmd.set_log_dir(&self.config.log_dir);

        self.spawn_and_track(file, &cmd).await
    }

    /// Pick the effective protocol parameters, write them onto the argv
    /// and persist them, holding the file's credit (READY) on success.
    async fn apply_protocol(
        &self,
        file: &TransferFile,
        shares: &[ShareConfig],
        cmd: &mut CopyCommand,
    ) -> Result<ParamsOutcome> {
        // Submitter-pinned parameters bypass link configuration entirely.
        if let Some(user) = file
            .internal_file_params
            .as_deref()
            .and_then(UserProtocol::parse)
        {
            cmd.set_protocol(
                user.nostreams.unwrap_or(DEFAULT_NOSTREAMS),
                user.timeout.unwrap_or(DEFAULT_TIMEOUT),
                user.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            );
            cmd.set_strict_copy(user.strict_copy);
            cmd.set_ipv4(user.ipv4);
            cmd.set_ipv6(user.ipv6);
            cmd.set_manual_config(true);
            let raw = file.internal_file_params.as_deref().unwrap_or_default();
            return self.persist_fixed(file, raw).await;
        }

        if let Some(protocol) = self.resolver.resolve(file, shares).await? {
            cmd.set_protocol(protocol.nostreams, protocol.timeout, protocol.buffer_size);
            return if protocol.is_auto() {
                cmd.set_auto_tuned(true);
                self.persist_tuned(file, protocol.nostreams, protocol.timeout, protocol.buffer_size)
                    .await
            } else {
                cmd.set_manual_config(true);
                self.persist_fixed(file, &protocol.params_string()).await
            };
        }

        // No link configuration anywhere for this pair.
        if self.config.optimize_enabled {
            let snapshot = self
                .db
                .fetch_optimization_config(&file.source_se, &file.dest_se)
                .await?;
            let nostreams = if snapshot.nostreams > 0 {
                snapshot.nostreams
            } else {
                DEFAULT_NOSTREAMS
            };
            let timeout = if snapshot.timeout > 0 {
                snapshot.timeout
            } else {
                DEFAULT_TIMEOUT
            };
            let buffer_size = snapshot.buffer_size.max(0);
            cmd.set_protocol(nostreams, timeout, buffer_size);
            cmd.set_auto_tuned(true);
            self.persist_tuned(file, nostreams, timeout, buffer_size).await
        } else {
            cmd.set_protocol(DEFAULT_NOSTREAMS, DEFAULT_TIMEOUT, DEFAULT_BUFFER_SIZE);
            cmd.set_manual_config(true);
            let params = format!(
                "nostreams:{DEFAULT_NOSTREAMS},timeout:{DEFAULT_TIMEOUT},buffersize:{DEFAULT_BUFFER_SIZE}"
            );
            self.persist_fixed(file, &params).await
        }
    }

    async fn persist_tuned(
        &self,
        file: &TransferFile,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<ParamsOutcome> {
        let result = self
            .db
            .set_allowed(
                &file.job_id,
                file.file_id,
                &file.source_se,
                &file.dest_se,
                nostreams,
                timeout,
                buffer_size,
            )
            .await;
        self.map_claim(file, result)
    }

    async fn persist_fixed(&self, file: &TransferFile, params: &str) -> Result<ParamsOutcome> {
        let result = self
            .db
            .set_allowed_no_optimize(&file.job_id, file.file_id, params)
            .await;
        self.map_claim(file, result)
    }

    fn map_claim(
        &self,
        file: &TransferFile,
        result: std::result::Result<(), CoreError>,
    ) -> Result<ParamsOutcome> {
        match result {
            Ok(()) => Ok(ParamsOutcome::Persisted),
            Err(CoreError::TransferNotFound { .. }) => {
                info!(
                    job_id = %file.job_id,
                    file_id = file.file_id,
                    "Transfer no longer pending, picked by another node"
                );
                Ok(ParamsOutcome::TakenElsewhere)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Spawn the url-copy process and record the spawn outcome.
    async fn spawn_and_track(
        &self,
        file: &TransferFile,
        cmd: &CopyCommand,
    ) -> Result<ExecuteOutcome> {
        debug!(
            job_id = %file.job_id,
            file_id = file.file_id,
            program = %cmd.program().display(),
            args = ?cmd.args(),
            "Spawning url-copy"
        );

        let mut command = tokio::process::Command::new(cmd.program());
        command
            .args(cmd.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // The child is detached on purpose: exit and crash are observed
        // through the message spool, never by waiting here.
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    job_id = %file.job_id,
                    file_id = file.file_id,
                    error = %e,
                    "Failed to spawn url-copy, reverting transfer for re-scheduling"
                );
                self.db
                    .fork_failed_revert_state(&file.job_id, file.file_id)
                    .await?;
                return Ok(ExecuteOutcome::SpawnFailed);
            }
        };

        let Some(pid) = child.id() else {
            warn!(
                job_id = %file.job_id,
                file_id = file.file_id,
                "url-copy exited before its pid could be read, reverting transfer"
            );
            self.db
                .fork_failed_revert_state(&file.job_id, file.file_id)
                .await?;
            return Ok(ExecuteOutcome::SpawnFailed);
        };
        let pid = pid as i32;

        let updated = self
            .db
            .update_file_transfer_status(&file.job_id, file.file_id, "ACTIVE", "", pid, 0, 0.0, 0.0)
            .await?;
        self.db
            .update_job_transfer_status(&file.job_id, "ACTIVE")
            .await?;

        if !updated {
            warn!(
                job_id = %file.job_id,
                file_id = file.file_id,
                "Transfer not updated, probably picked by another node"
            );
            return Ok(ExecuteOutcome::Started);
        }

        self.db.set_pid(&file.job_id, file.file_id, pid).await?;
        self.registry.register(&file.job_id, file.file_id, pid);

        info!(
            job_id = %file.job_id,
            file_id = file.file_id,
            pid,
            vo = %file.vo_name,
            source_se = %file.source_se,
            dest_se = %file.dest_se,
            "Transfer started"
        );

        let retry_counter = self
            .db
            .current_retry_count(&file.job_id, file.file_id)
            .await
            .unwrap_or(0);
        let notification = StateMessage {
            job_id: file.job_id.clone(),
            file_id: file.file_id,
            state: "ACTIVE".to_string(),
            vo_name: file.vo_name.clone(),
            source_se: file.source_se.clone(),
            dest_se: file.dest_se.clone(),
            retry_counter,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.monitoring.put(&notification).await {
            warn!(
                job_id = %file.job_id,
                file_id = file.file_id,
                error = %e,
                "Failed to publish state notification"
            );
        }

        Ok(ExecuteOutcome::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::{Consumer, Subqueue};
    use ferryd_core::persistence::{MockPersistence, OptimizerSnapshot, ShareConfig};

    const SRC: &str = "gsiftp://src-exec.example.org";
    const DST: &str = "gsiftp://dst-exec.example.org";

    struct Harness {
        db: Arc<MockPersistence>,
        registry: ProcessRegistry,
        executor: TransferExecutor,
        monitoring: Consumer,
        _spool: tempfile::TempDir,
    }

    fn harness(config: ExecutorConfig) -> Harness {
        let spool = tempfile::tempdir().unwrap();
        let db = Arc::new(MockPersistence::new());
        let registry = ProcessRegistry::new();
        let producer = Producer::new(spool.path(), Subqueue::Monitoring).unwrap();
        let monitoring = Consumer::new(spool.path(), Subqueue::Monitoring).unwrap();
        let executor = TransferExecutor::new(
            db.clone(),
            Arc::new(OptimizerRegistry::new()),
            registry.clone(),
            producer,
            config,
        );
        Harness {
            db,
            registry,
            executor,
            monitoring,
            _spool: spool,
        }
    }

    fn spawnable_config() -> ExecutorConfig {
        ExecutorConfig {
            url_copy_bin: PathBuf::from("/bin/true"),
            ..ExecutorConfig::default()
        }
    }

    async fn seed_file(db: &MockPersistence) -> (TransferFile, i64) {
        db.add_job("job-exec", 3).await;
        let mut file = MockPersistence::sample_file("job-exec", "atlas", SRC, DST);
        let file_id = db.add_file(file.clone()).await;
        file.file_id = file_id;
        (file, file_id)
    }

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.url_copy_bin, PathBuf::from("ferryd-url-copy"));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/ferryd"));
        assert_eq!(config.infosys, "lcg-bdii.cern.ch:2170");
        assert_eq!(config.debug_level, 0);
        assert!(config.optimize_enabled);
    }

    #[tokio::test]
    async fn test_started_transfer_goes_active_and_is_registered() {
        let h = harness(spawnable_config());
        let (file, file_id) = seed_file(&h.db).await;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::Started);
        assert_eq!(h.db.file_state(file_id).await.as_deref(), Some("ACTIVE"));
        assert!(h.db.file_pid(file_id).await.is_some());
        assert_eq!(h.registry.len(), 1);

        let notifications = h.monitoring.drain::<StateMessage>(10).await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].message.state, "ACTIVE");
        assert_eq!(notifications[0].message.file_id, file_id);
    }

    #[tokio::test]
    async fn test_denied_transfer_stays_submitted() {
        let h = harness(spawnable_config());
        let (file, file_id) = seed_file(&h.db).await;
        h.db.add_share_config(ShareConfig {
            source: SRC.to_string(),
            destination: DST.to_string(),
            vo: "atlas".to_string(),
            active: 0,
        })
        .await;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::Denied);
        assert_eq!(h.db.file_state(file_id).await.as_deref(), Some("SUBMITTED"));
        assert!(h.registry.is_empty());
        assert!(h.monitoring.drain::<StateMessage>(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_claimed_transfer_is_left_alone() {
        let h = harness(spawnable_config());
        h.db.add_job("job-exec", 3).await;
        let mut file = MockPersistence::sample_file("job-exec", "atlas", SRC, DST);
        file.file_state = "READY".to_string();
        let file_id = h.db.add_file(file.clone()).await;
        file.file_id = file_id;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::TakenElsewhere);
        assert_eq!(h.db.file_state(file_id).await.as_deref(), Some("READY"));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_reverts_to_submitted() {
        let h = harness(ExecutorConfig {
            url_copy_bin: PathBuf::from("/nonexistent/ferryd-url-copy"),
            ..ExecutorConfig::default()
        });
        let (file, file_id) = seed_file(&h.db).await;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::SpawnFailed);
        assert_eq!(h.db.file_state(file_id).await.as_deref(), Some("SUBMITTED"));
        assert!(h.registry.is_empty());
        assert!(h.monitoring.drain::<StateMessage>(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submitter_params_pin_the_stored_string() {
        let h = harness(spawnable_config());
        h.db.add_job("job-exec", 3).await;
        let mut file = MockPersistence::sample_file("job-exec", "atlas", SRC, DST);
        file.internal_file_params = Some("nostreams:4,timeout:3600,buffersize:0,strict".to_string());
        let file_id = h.db.add_file(file.clone()).await;
        file.file_id = file_id;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::Started);
        assert_eq!(
            h.db.file_params(file_id).await.as_deref(),
            Some("nostreams:4,timeout:3600,buffersize:0,strict")
        );
    }

    #[tokio::test]
    async fn test_optimizer_disabled_falls_back_to_defaults() {
        let h = harness(ExecutorConfig {
            url_copy_bin: PathBuf::from("/bin/true"),
            optimize_enabled: false,
            ..ExecutorConfig::default()
        });
        let (file, file_id) = seed_file(&h.db).await;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::Started);
        assert_eq!(
            h.db.file_params(file_id).await.as_deref(),
            Some("nostreams:4,timeout:3600,buffersize:0")
        );
    }

    #[tokio::test]
    async fn test_tuned_snapshot_drives_the_auto_path() {
        let h = harness(spawnable_config());
        let (file, file_id) = seed_file(&h.db).await;
        h.db.set_optimizer_snapshot(
            SRC,
            DST,
            OptimizerSnapshot {
                nostreams: 8,
                buffer_size: 1048576,
                timeout: 7200,
                num_samples: 25,
                success_rate: 95.0,
                throughput: 120.0,
            },
        )
        .await;

        let outcome = h
            .executor
            .execute(&file, Path::new("/tmp/proxy"))
            .await
            .unwrap();

        assert_eq!(outcome, ExecuteOutcome::Started);
        assert_eq!(
            h.db.file_params(file_id).await.as_deref(),
            Some("nostreams:8,timeout:7200,buffersize:1048576")
        );
    }
}
