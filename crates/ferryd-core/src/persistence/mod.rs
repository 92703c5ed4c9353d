// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for ferryd-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! The database is the only synchronization point between scheduler nodes;
//! every component reads and writes through the [`Persistence`] trait.

pub mod mock;
pub mod postgres;

pub use self::mock::MockPersistence;
pub use self::postgres::PostgresPersistence;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Placeholder used on one side of a link or share row meaning
/// "any counterpart".
pub const ANY: &str = "*";

/// Placeholder subject of the catch-all default rows; a `((*), *)` row is
/// the default outbound configuration applied to every storage element.
pub const WILDCARD: &str = "(*)";

/// VO name of the shared pool used by VOs without a dedicated share.
pub const PUBLIC_VO: &str = "public";

/// Lifecycle state of a single transfer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Queued, waiting for admission.
    Submitted,
    /// Admitted by the scheduler, about to be spawned.
    Ready,
    /// A copy subprocess is running for this file.
    Active,
    /// Terminal success.
    Finished,
    /// Terminal failure.
    Failed,
    /// Terminal cancellation.
    Canceled,
}

impl TransferState {
    /// The database representation of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Whether this state is terminal (the file leaves the pending set).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(Self::Submitted),
            "READY" => Ok(Self::Ready),
            "ACTIVE" => Ok(Self::Active),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(CoreError::ValidationError {
                field: "file_state".to_string(),
                message: format!("unknown transfer state '{}'", other),
            }),
        }
    }
}

/// A distinct (source, destination, VO) queue with pending work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct QueuePair {
    /// Source storage element.
    pub source_se: String,
    /// Destination storage element.
    pub dest_se: String,
    /// Submitting virtual organization.
    pub vo_name: String,
}

/// A queued transfer file as fetched for scheduling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransferFile {
    /// Database file identifier, unique across jobs.
    pub file_id: i64,
    /// Job this file belongs to.
    pub job_id: String,
    /// Current lifecycle state (see [`TransferState`]).
    pub file_state: String,
    /// Source URL.
    pub source_surl: String,
    /// Destination URL.
    pub dest_surl: String,
    /// Source storage element (protocol + host).
    pub source_se: String,
    /// Destination storage element (protocol + host).
    pub dest_se: String,
    /// Submitting virtual organization.
    pub vo_name: String,
    /// Distinguished name of the submitting user.
    pub user_dn: String,
    /// Delegated credential identifier.
    pub cred_id: String,
    /// Requested checksum value, if any.
    pub checksum: Option<String>,
    /// Checksum verification mode.
    pub checksum_method: Option<String>,
    /// Source space token.
    pub source_space_token: Option<String>,
    /// Destination space token.
    pub dest_space_token: Option<String>,
    /// Whether an existing destination file may be overwritten.
    pub overwrite: bool,
    /// Pin lifetime in seconds, negative when not requested.
    pub pin_lifetime: i32,
    /// Bring-online token from staging, if any.
    pub bringonline_token: Option<String>,
    /// Submitter-supplied file metadata, passed through to the copy process.
    pub file_metadata: Option<String>,
    /// Submitter-supplied job metadata, passed through to the copy process.
    pub job_metadata: Option<String>,
    /// Expected file size in bytes, 0 when unknown.
    pub user_filesize: i64,
    /// Submitter-supplied protocol parameters (`nostreams:N,timeout:N,...`).
    pub internal_file_params: Option<String>,
    /// PID of the copy subprocess once spawned.
    #[sqlx(default)]
    pub pid: Option<i32>,
}

/// Protocol parameters configured for one link.
///
/// A value of -1 in any numeric field means "automatic": the resolver
/// substitutes the live optimizer value for it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LinkConfig {
    /// Source side name (SE, group, `*` or `(*)`).
    pub source: String,
    /// Destination side name (SE, group, `*` or `(*)`).
    pub destination: String,
    /// Administrative alias for the link.
    pub symbolic_name: String,
    /// Whether the link is enabled ("on"/"off").
    pub state: String,
    /// Number of TCP streams, -1 for automatic.
    pub nostreams: i32,
    /// TCP buffer size in bytes, -1 for automatic, 0 for unset.
    pub tcp_buffer_size: i32,
    /// Transfer timeout in seconds, -1 for automatic.
    pub urlcopy_timeout: i32,
    /// Auto-tuning mode ("on", "off" or "all").
    pub auto_tuning: String,
}

/// Concurrency share granted to one VO on one link.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShareConfig {
    /// Source side name (SE, group, `*` or `(*)`).
    pub source: String,
    /// Destination side name (SE, group, `*` or `(*)`).
    pub destination: String,
    /// VO the share belongs to, or `public`.
    pub vo: String,
    /// Maximum concurrently active transfers for this share.
    pub active: i32,
}

/// Per-SE concurrency caps, each direction independently optional.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeLimits {
    /// Storage element the limits apply to.
    pub se: String,
    /// Cap on transfers into this SE, unset when absent.
    pub inbound_max_active: Option<i32>,
    /// Cap on transfers out of this SE, unset when absent.
    pub outbound_max_active: Option<i32>,
}

/// Tuned parameters and recent outcome aggregates for one pair.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct OptimizerSnapshot {
    /// Tuned number of TCP streams.
    pub nostreams: i32,
    /// Tuned TCP buffer size in bytes.
    pub buffer_size: i32,
    /// Tuned transfer timeout in seconds.
    pub timeout: i32,
    /// Number of samples observed for the pair in the recent window.
    pub num_samples: i64,
    /// Success rate over the recent window, 0..=100.
    pub success_rate: f64,
    /// Mean throughput over the recent window, MB/s.
    pub throughput: f64,
}

/// Throughput/progress marker reported by a running copy process.
#[derive(Debug, Clone)]
pub struct ProgressMarker {
    /// Job the marker belongs to.
    pub job_id: String,
    /// File the marker belongs to.
    pub file_id: i64,
    /// PID of the reporting copy process.
    pub pid: i32,
    /// Instantaneous throughput, MB/s.
    pub throughput: f64,
    /// Bytes transferred so far.
    pub transferred: i64,
    /// When the marker was produced.
    pub timestamp: DateTime<Utc>,
}

/// Log-file location reported by a copy process.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Job the log belongs to.
    pub job_id: String,
    /// File the log belongs to.
    pub file_id: i64,
    /// Host the copy process ran on.
    pub host: String,
    /// Absolute path of the transfer log file.
    pub log_path: String,
    /// Whether a debug-level log was written.
    pub debug_log: bool,
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
}

/// Persistence interface used by the scheduler, the executor and the
/// reconciler.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Queue / dispatch
    // ========================================================================

    /// Distinct (source, destination, VO) triples with queued files.
    async fn get_queues(&self) -> Result<Vec<QueuePair>, CoreError>;

    /// Fetch up to `limit` SUBMITTED files per queue, grouped by VO.
    async fn get_ready_transfers(
        &self,
        queues: &[QueuePair],
        limit: i64,
    ) -> Result<HashMap<String, Vec<TransferFile>>, CoreError>;

    // ========================================================================
    // Configuration lookups
    // ========================================================================

    async fn get_link_config(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<LinkConfig>, CoreError>;

    async fn get_share_config(
        &self,
        source: &str,
        destination: &str,
        vo: &str,
    ) -> Result<Option<ShareConfig>, CoreError>;

    /// VOs holding a dedicated (non-public) share on the given row names.
    async fn vos_with_dedicated_share(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Vec<String>, CoreError>;

    /// Group an SE is a member of, if any.
    async fn get_group_for_se(&self, se: &str) -> Result<Option<String>, CoreError>;

    /// Whether the given name denotes an SE group.
    async fn check_group_exists(&self, name: &str) -> Result<bool, CoreError>;

    async fn get_se_limits(&self, se: &str) -> Result<Option<SeLimits>, CoreError>;

    // ========================================================================
    // Live credit counts
    // ========================================================================

    async fn count_active_on_pair(&self, source_se: &str, dest_se: &str)
    -> Result<i64, CoreError>;

    async fn count_active_from_source(&self, source_se: &str) -> Result<i64, CoreError>;

    async fn count_active_to_dest(&self, dest_se: &str) -> Result<i64, CoreError>;

    async fn count_active_on_pair_for_vo(
        &self,
        source_se: &str,
        dest_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError>;

    async fn count_active_from_source_for_vo(
        &self,
        source_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError>;

    async fn count_active_to_dest_for_vo(&self, dest_se: &str, vo: &str)
    -> Result<i64, CoreError>;

    /// Active transfers on the pair charged to the public pool, i.e. whose
    /// VO is not in `dedicated`.
    async fn count_active_on_pair_public(
        &self,
        source_se: &str,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError>;

    async fn count_active_from_source_public(
        &self,
        source_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError>;

    async fn count_active_to_dest_public(
        &self,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError>;

    // ========================================================================
    // Optimizer state
    // ========================================================================

    /// Tuned parameter triple and recent outcome aggregates for a pair.
    async fn fetch_optimization_config(
        &self,
        source_se: &str,
        dest_se: &str,
    ) -> Result<OptimizerSnapshot, CoreError>;

    /// Seed the optimizer history for a pair seen for the first time.
    async fn init_optimizer(
        &self,
        source_se: &str,
        dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError>;

    // ========================================================================
    // Executor writes
    // ========================================================================

    /// Persist auto-tuned protocol parameters and move the file to READY.
    #[allow(clippy::too_many_arguments)]
    async fn set_allowed(
        &self,
        job_id: &str,
        file_id: i64,
        source_se: &str,
        dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError>;

    /// Persist literal protocol parameters and move the file to READY.
    async fn set_allowed_no_optimize(
        &self,
        job_id: &str,
        file_id: i64,
        params: &str,
    ) -> Result<(), CoreError>;

    /// Update the state of one file.
    ///
    /// Returns false when no row changed, meaning another scheduler node
    /// already picked the file up.
    #[allow(clippy::too_many_arguments)]
    async fn update_file_transfer_status(
        &self,
        job_id: &str,
        file_id: i64,
        state: &str,
        reason: &str,
        pid: i32,
        filesize: i64,
        duration_secs: f64,
        throughput: f64,
    ) -> Result<bool, CoreError>;

    /// Recompute and persist the aggregate job state.
    async fn update_job_transfer_status(&self, job_id: &str, state: &str)
    -> Result<(), CoreError>;

    /// Revert a READY file to SUBMITTED after a failed subprocess spawn.
    async fn fork_failed_revert_state(&self, job_id: &str, file_id: i64)
    -> Result<(), CoreError>;

    /// Record the copy subprocess PID for a file.
    async fn set_pid(&self, job_id: &str, file_id: i64, pid: i32) -> Result<(), CoreError>;

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Schedule one more attempt for a failed file.
    async fn set_retry_transfer(
        &self,
        job_id: &str,
        file_id: i64,
        retry: i32,
        reason: &str,
    ) -> Result<(), CoreError>;

    /// Retry budget configured for a job.
    async fn retry_budget(&self, job_id: &str) -> Result<i32, CoreError>;

    /// Attempts already consumed by a file.
    async fn current_retry_count(&self, job_id: &str, file_id: i64) -> Result<i32, CoreError>;

    /// Fail every non-terminal file served by the given copy process.
    ///
    /// Returns the ids of the files that were failed.
    async fn terminate_reuse_process(
        &self,
        job_id: &str,
        pid: i32,
        message: &str,
    ) -> Result<Vec<i64>, CoreError>;

    /// Bulk-persist throughput/progress markers.
    async fn update_transfer_progress(
        &self,
        markers: &[ProgressMarker],
    ) -> Result<(), CoreError>;

    /// Bulk-persist transfer log locations.
    async fn update_log_paths(&self, records: &[LogRecord]) -> Result<(), CoreError>;

    // ========================================================================
    // Host state
    // ========================================================================

    /// Whether drain has been requested for the given host.
    async fn drain_requested(&self, host: &str) -> Result<bool, CoreError>;

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_state_round_trip() {
        for state in [
            TransferState::Submitted,
            TransferState::Ready,
            TransferState::Active,
            TransferState::Finished,
            TransferState::Failed,
            TransferState::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<TransferState>().unwrap(), state);
        }
    }

    #[test]
    fn test_transfer_state_terminal() {
        assert!(!TransferState::Submitted.is_terminal());
        assert!(!TransferState::Ready.is_terminal());
        assert!(!TransferState::Active.is_terminal());
        assert!(TransferState::Finished.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Canceled.is_terminal());
    }

    #[test]
    fn test_transfer_state_parse_rejects_unknown() {
        let err = "RUNNING".parse::<TransferState>().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
