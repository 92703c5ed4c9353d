// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock persistence for testing.
//!
//! An in-memory implementation of the persistence contract that mirrors the
//! Postgres guard semantics (terminal-once status writes, retry counters,
//! READY holding credit) without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::CoreError;

use super::{
    LinkConfig, LogRecord, OptimizerSnapshot, Persistence, ProgressMarker, QueuePair, SeLimits,
    ShareConfig, TransferFile,
};

/// Mock job state.
#[derive(Debug, Clone)]
struct MockJob {
    job_state: String,
    retry_max: i32,
}

/// Mock file state. Wraps the wire record with the columns only the
/// reconciliation paths touch.
#[derive(Debug, Clone)]
struct MockFile {
    file: TransferFile,
    retry_count: i32,
    reason: Option<String>,
    log_file: Option<String>,
    debug_log: bool,
    throughput: f64,
    transferred: i64,
}

#[derive(Debug, Default)]
struct MockState {
    jobs: HashMap<String, MockJob>,
    files: HashMap<i64, MockFile>,
    link_configs: HashMap<(String, String), LinkConfig>,
    share_configs: HashMap<(String, String, String), ShareConfig>,
    se_limits: HashMap<String, SeLimits>,
    group_members: HashMap<String, String>,
    optimizer: HashMap<(String, String), OptimizerSnapshot>,
    drained_hosts: HashMap<String, bool>,
}

/// Mock persistence for testing.
pub struct MockPersistence {
    state: Arc<Mutex<MockState>>,
    next_file_id: AtomicI64,
    /// If true, every operation fails with a transient database error.
    pub fail_by_default: bool,
    /// If true, only status and retry writes fail. Useful for exercising
    /// message requeue paths while reads keep working.
    pub fail_status_updates: bool,
}

impl Default for MockPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPersistence {
    /// Create a new empty mock.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            next_file_id: AtomicI64::new(1),
            fail_by_default: false,
            fail_status_updates: false,
        }
    }

    /// Create a mock where every operation fails.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    fn forced_failure(&self) -> Result<(), CoreError> {
        if self.fail_by_default {
            return Err(CoreError::DatabaseError {
                operation: "mock".to_string(),
                details: "forced failure".to_string(),
            });
        }
        Ok(())
    }

    fn forced_write_failure(&self) -> Result<(), CoreError> {
        self.forced_failure()?;
        if self.fail_status_updates {
            return Err(CoreError::DatabaseError {
                operation: "mock".to_string(),
                details: "forced status write failure".to_string(),
            });
        }
        Ok(())
    }

    /// A file record with sane defaults that tests can tweak before adding.
    pub fn sample_file(job_id: &str, vo: &str, source_se: &str, dest_se: &str) -> TransferFile {
        TransferFile {
            file_id: 0,
            job_id: job_id.to_string(),
            file_state: "SUBMITTED".to_string(),
            source_surl: format!("{source_se}/path/file"),
            dest_surl: format!("{dest_se}/path/file"),
            source_se: source_se.to_string(),
            dest_se: dest_se.to_string(),
            vo_name: vo.to_string(),
            user_dn: "/DC=ch/CN=tester".to_string(),
            cred_id: "cred-1".to_string(),
            checksum: None,
            checksum_method: None,
            source_space_token: None,
            dest_space_token: None,
            overwrite: false,
            pin_lifetime: -1,
            bringonline_token: None,
            file_metadata: None,
            job_metadata: None,
            user_filesize: 0,
            internal_file_params: None,
            pid: None,
        }
    }

    /// Register a job.
    pub async fn add_job(&self, job_id: &str, retry_max: i32) {
        let mut state = self.state.lock().await;
        state.jobs.insert(
            job_id.to_string(),
            MockJob {
                job_state: "SUBMITTED".to_string(),
                retry_max,
            },
        );
    }

    /// Register a file, assigning it the next id. Returns the id.
    pub async fn add_file(&self, mut file: TransferFile) -> i64 {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        file.file_id = file_id;
        let mut state = self.state.lock().await;
        state.files.insert(
            file_id,
            MockFile {
                file,
                retry_count: 0,
                reason: None,
                log_file: None,
                debug_log: false,
                throughput: 0.0,
                transferred: 0,
            },
        );
        file_id
    }

    /// Register a link configuration row.
    pub async fn add_link_config(&self, config: LinkConfig) {
        let mut state = self.state.lock().await;
        state
            .link_configs
            .insert((config.source.clone(), config.destination.clone()), config);
    }

    /// Register a share row.
    pub async fn add_share_config(&self, config: ShareConfig) {
        let mut state = self.state.lock().await;
        state.share_configs.insert(
            (
                config.source.clone(),
                config.destination.clone(),
                config.vo.clone(),
            ),
            config,
        );
    }

    /// Register per-SE caps.
    pub async fn add_se_limits(&self, limits: SeLimits) {
        let mut state = self.state.lock().await;
        state.se_limits.insert(limits.se.clone(), limits);
    }

    /// Put an SE into a group.
    pub async fn add_group_member(&self, se: &str, group: &str) {
        let mut state = self.state.lock().await;
        state.group_members.insert(se.to_string(), group.to_string());
    }

    /// Pin the optimizer snapshot returned for a pair.
    pub async fn set_optimizer_snapshot(
        &self,
        source_se: &str,
        dest_se: &str,
        snapshot: OptimizerSnapshot,
    ) {
        let mut state = self.state.lock().await;
        state
            .optimizer
            .insert((source_se.to_string(), dest_se.to_string()), snapshot);
    }

    /// Mark a host as draining.
    pub async fn set_drain(&self, host: &str, drain: bool) {
        let mut state = self.state.lock().await;
        state.drained_hosts.insert(host.to_string(), drain);
    }

    /// Current state string of a file, if it exists.
    pub async fn file_state(&self, file_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state.files.get(&file_id).map(|f| f.file.file_state.clone())
    }

    /// Stored protocol parameter string of a file.
    pub async fn file_params(&self, file_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state
            .files
            .get(&file_id)
            .and_then(|f| f.file.internal_file_params.clone())
    }

    /// Stored failure reason of a file.
    pub async fn file_reason(&self, file_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state.files.get(&file_id).and_then(|f| f.reason.clone())
    }

    /// Stored log path of a file.
    pub async fn file_log(&self, file_id: i64) -> Option<String> {
        let state = self.state.lock().await;
        state.files.get(&file_id).and_then(|f| f.log_file.clone())
    }

    /// Stored throughput and transferred bytes of a file.
    pub async fn file_progress(&self, file_id: i64) -> Option<(f64, i64)> {
        let state = self.state.lock().await;
        state
            .files
            .get(&file_id)
            .map(|f| (f.throughput, f.transferred))
    }

    /// Stored pid of a file.
    pub async fn file_pid(&self, file_id: i64) -> Option<i32> {
        let state = self.state.lock().await;
        state.files.get(&file_id).and_then(|f| f.file.pid)
    }

    /// Current aggregate state of a job.
    pub async fn job_state(&self, job_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.jobs.get(job_id).map(|j| j.job_state.clone())
    }
}

fn is_terminal(state: &str) -> bool {
    matches!(state, "FINISHED" | "FAILED" | "CANCELED")
}

fn holds_credit(state: &str) -> bool {
    matches!(state, "ACTIVE" | "READY")
}

#[async_trait]
impl Persistence for MockPersistence {
    async fn get_queues(&self) -> Result<Vec<QueuePair>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        let mut seen = std::collections::HashSet::new();
        let mut queues = Vec::new();
        for entry in state.files.values() {
            if entry.file.file_state != "SUBMITTED" {
                continue;
            }
            let key = (
                entry.file.source_se.clone(),
                entry.file.dest_se.clone(),
                entry.file.vo_name.clone(),
            );
            if seen.insert(key.clone()) {
                queues.push(QueuePair {
                    source_se: key.0,
                    dest_se: key.1,
                    vo_name: key.2,
                });
            }
        }
        Ok(queues)
    }

    async fn get_ready_transfers(
        &self,
        queues: &[QueuePair],
        limit: i64,
    ) -> Result<HashMap<String, Vec<TransferFile>>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        let mut grouped: HashMap<String, Vec<TransferFile>> = HashMap::new();
        for queue in queues {
            let mut files: Vec<TransferFile> = state
                .files
                .values()
                .filter(|f| {
                    f.file.file_state == "SUBMITTED"
                        && f.file.source_se == queue.source_se
                        && f.file.dest_se == queue.dest_se
                        && f.file.vo_name == queue.vo_name
                })
                .map(|f| f.file.clone())
                .collect();
            files.sort_by_key(|f| f.file_id);
            files.truncate(limit as usize);
            if !files.is_empty() {
                grouped
                    .entry(queue.vo_name.clone())
                    .or_default()
                    .extend(files);
            }
        }
        Ok(grouped)
    }

    async fn get_link_config(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<LinkConfig>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .link_configs
            .get(&(source.to_string(), destination.to_string()))
            .cloned())
    }

    async fn get_share_config(
        &self,
        source: &str,
        destination: &str,
        vo: &str,
    ) -> Result<Option<ShareConfig>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .share_configs
            .get(&(source.to_string(), destination.to_string(), vo.to_string()))
            .cloned())
    }

    async fn vos_with_dedicated_share(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Vec<String>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .share_configs
            .values()
            .filter(|s| {
                s.source == source && s.destination == destination && s.vo != super::PUBLIC_VO
            })
            .map(|s| s.vo.clone())
            .collect())
    }

    async fn get_group_for_se(&self, se: &str) -> Result<Option<String>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state.group_members.get(se).cloned())
    }

    async fn check_group_exists(&self, name: &str) -> Result<bool, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state.group_members.values().any(|g| g == name))
    }

    async fn get_se_limits(&self, se: &str) -> Result<Option<SeLimits>, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state.se_limits.get(se).cloned())
    }

    async fn count_active_on_pair(
        &self,
        source_se: &str,
        dest_se: &str,
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.source_se == source_se
                    && f.file.dest_se == dest_se
            })
            .count() as i64)
    }

    async fn count_active_from_source(&self, source_se: &str) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| holds_credit(&f.file.file_state) && f.file.source_se == source_se)
            .count() as i64)
    }

    async fn count_active_to_dest(&self, dest_se: &str) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| holds_credit(&f.file.file_state) && f.file.dest_se == dest_se)
            .count() as i64)
    }

    async fn count_active_on_pair_for_vo(
        &self,
        source_se: &str,
        dest_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.source_se == source_se
                    && f.file.dest_se == dest_se
                    && f.file.vo_name == vo
            })
            .count() as i64)
    }

    async fn count_active_from_source_for_vo(
        &self,
        source_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.source_se == source_se
                    && f.file.vo_name == vo
            })
            .count() as i64)
    }

    async fn count_active_to_dest_for_vo(
        &self,
        dest_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.dest_se == dest_se
                    && f.file.vo_name == vo
            })
            .count() as i64)
    }

    async fn count_active_on_pair_public(
        &self,
        source_se: &str,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.source_se == source_se
                    && f.file.dest_se == dest_se
                    && !dedicated.contains(&f.file.vo_name)
            })
            .count() as i64)
    }

    async fn count_active_from_source_public(
        &self,
        source_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.source_se == source_se
                    && !dedicated.contains(&f.file.vo_name)
            })
            .count() as i64)
    }

    async fn count_active_to_dest_public(
        &self,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .files
            .values()
            .filter(|f| {
                holds_credit(&f.file.file_state)
                    && f.file.dest_se == dest_se
                    && !dedicated.contains(&f.file.vo_name)
            })
            .count() as i64)
    }

    async fn fetch_optimization_config(
        &self,
        source_se: &str,
        dest_se: &str,
    ) -> Result<OptimizerSnapshot, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .optimizer
            .get(&(source_se.to_string(), dest_se.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn init_optimizer(
        &self,
        source_se: &str,
        dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError> {
        self.forced_failure()?;
        let mut state = self.state.lock().await;
        state
            .optimizer
            .entry((source_se.to_string(), dest_se.to_string()))
            .or_insert(OptimizerSnapshot {
                nostreams,
                buffer_size,
                timeout,
                num_samples: 0,
                success_rate: 0.0,
                throughput: 0.0,
            });
        Ok(())
    }

    async fn set_allowed(
        &self,
        job_id: &str,
        file_id: i64,
        _source_se: &str,
        _dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError> {
        let params = format!("nostreams:{nostreams},timeout:{timeout},buffersize:{buffer_size}");
        self.set_allowed_no_optimize(job_id, file_id, &params).await
    }

    async fn set_allowed_no_optimize(
        &self,
        job_id: &str,
        file_id: i64,
        params: &str,
    ) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        let entry = state
            .files
            .get_mut(&file_id)
            .filter(|f| f.file.job_id == job_id && f.file.file_state == "SUBMITTED")
            .ok_or(CoreError::TransferNotFound { file_id })?;
        entry.file.file_state = "READY".to_string();
        entry.file.internal_file_params = Some(params.to_string());
        Ok(())
    }

    async fn update_file_transfer_status(
        &self,
        job_id: &str,
        file_id: i64,
        state_name: &str,
        reason: &str,
        pid: i32,
        filesize: i64,
        _duration_secs: f64,
        throughput: f64,
    ) -> Result<bool, CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        let Some(entry) = state.files.get_mut(&file_id) else {
            return Ok(false);
        };
        if entry.file.job_id != job_id
            || is_terminal(&entry.file.file_state)
            || entry.file.file_state == state_name
        {
            return Ok(false);
        }
        entry.file.file_state = state_name.to_string();
        if !reason.is_empty() {
            entry.reason = Some(reason.to_string());
        }
        if pid > 0 {
            entry.file.pid = Some(pid);
        }
        if filesize > 0 {
            entry.file.user_filesize = filesize;
        }
        if throughput > 0.0 {
            entry.throughput = throughput;
        }
        Ok(true)
    }

    async fn update_job_transfer_status(
        &self,
        job_id: &str,
        state_name: &str,
    ) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        let files: Vec<String> = state
            .files
            .values()
            .filter(|f| f.file.job_id == job_id)
            .map(|f| f.file.file_state.clone())
            .collect();

        let job_state = if files.is_empty() {
            state_name.to_string()
        } else if files.iter().any(|s| !is_terminal(s)) {
            if files.iter().any(|s| holds_credit(s)) {
                "ACTIVE".to_string()
            } else {
                "SUBMITTED".to_string()
            }
        } else if files.iter().any(|s| s == "FAILED") {
            "FAILED".to_string()
        } else if files.iter().any(|s| s == "CANCELED") {
            "CANCELED".to_string()
        } else {
            "FINISHED".to_string()
        };

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        job.job_state = job_state;
        Ok(())
    }

    async fn fork_failed_revert_state(
        &self,
        job_id: &str,
        file_id: i64,
    ) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .files
            .get_mut(&file_id)
            .filter(|f| f.file.job_id == job_id && f.file.file_state == "READY")
        {
            entry.file.file_state = "SUBMITTED".to_string();
            entry.file.pid = None;
        }
        Ok(())
    }

    async fn set_pid(&self, job_id: &str, file_id: i64, pid: i32) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        let entry = state
            .files
            .get_mut(&file_id)
            .filter(|f| f.file.job_id == job_id)
            .ok_or(CoreError::TransferNotFound { file_id })?;
        entry.file.pid = Some(pid);
        Ok(())
    }

    async fn set_retry_transfer(
        &self,
        job_id: &str,
        file_id: i64,
        retry: i32,
        reason: &str,
    ) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.files.get_mut(&file_id).filter(|f| {
            f.file.job_id == job_id && !is_terminal(&f.file.file_state) && f.retry_count < retry
        }) {
            entry.file.file_state = "SUBMITTED".to_string();
            entry.retry_count = retry;
            entry.reason = Some(reason.to_string());
            entry.file.pid = None;
        }
        Ok(())
    }

    async fn retry_budget(&self, job_id: &str) -> Result<i32, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        state
            .jobs
            .get(job_id)
            .map(|j| j.retry_max)
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    async fn current_retry_count(&self, job_id: &str, file_id: i64) -> Result<i32, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        state
            .files
            .get(&file_id)
            .filter(|f| f.file.job_id == job_id)
            .map(|f| f.retry_count)
            .ok_or(CoreError::TransferNotFound { file_id })
    }

    async fn terminate_reuse_process(
        &self,
        job_id: &str,
        pid: i32,
        message: &str,
    ) -> Result<Vec<i64>, CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        let mut failed = Vec::new();
        for entry in state.files.values_mut() {
            if entry.file.job_id == job_id
                && entry.file.pid == Some(pid)
                && !is_terminal(&entry.file.file_state)
            {
                entry.file.file_state = "FAILED".to_string();
                entry.reason = Some(message.to_string());
                failed.push(entry.file.file_id);
            }
        }
        failed.sort_unstable();
        Ok(failed)
    }

    async fn update_transfer_progress(
        &self,
        markers: &[ProgressMarker],
    ) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        for marker in markers {
            if let Some(entry) = state
                .files
                .get_mut(&marker.file_id)
                .filter(|f| f.file.job_id == marker.job_id && f.file.file_state == "ACTIVE")
            {
                entry.throughput = marker.throughput;
                entry.transferred = marker.transferred;
            }
        }
        Ok(())
    }

    async fn update_log_paths(&self, records: &[LogRecord]) -> Result<(), CoreError> {
        self.forced_write_failure()?;
        let mut state = self.state.lock().await;
        for record in records {
            if let Some(entry) = state
                .files
                .get_mut(&record.file_id)
                .filter(|f| f.file.job_id == record.job_id)
            {
                entry.log_file = Some(record.log_path.clone());
                entry.debug_log = record.debug_log;
            }
        }
        Ok(())
    }

    async fn drain_requested(&self, host: &str) -> Result<bool, CoreError> {
        self.forced_failure()?;
        let state = self.state.lock().await;
        Ok(state.drained_hosts.get(host).copied().unwrap_or(false))
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        self.forced_failure()?;
        Ok(true)
    }
}
