// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence operations for ferryd-core.
//!
//! Provides all durable storage access for transfer jobs and files, link and
//! share configuration, live credit counts and optimizer state.

#![allow(dead_code)] // Fields and functions used in tests and by the server crate

use std::collections::HashMap;

use sqlx::PgPool;

use crate::error::CoreError;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

use super::{
    LinkConfig, LogRecord, OptimizerSnapshot, Persistence, ProgressMarker, QueuePair, SeLimits,
    ShareConfig, TransferFile,
};

// ============================================================================
// Queue Operations
// ============================================================================

/// Distinct (source, destination, VO) triples with queued files.
pub async fn get_queues(pool: &PgPool) -> Result<Vec<QueuePair>, CoreError> {
    let queues = sqlx::query_as::<_, QueuePair>(
        r#"
        SELECT DISTINCT source_se, dest_se, vo_name
        FROM transfer_files
        WHERE file_state = 'SUBMITTED'
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(queues)
}

const TRANSFER_FILE_COLUMNS: &str = r#"
    f.file_id, f.job_id, f.file_state, f.source_surl, f.dest_surl,
    f.source_se, f.dest_se, f.vo_name, j.user_dn, j.cred_id,
    f.checksum, f.checksum_method, j.source_space_token, j.dest_space_token,
    j.overwrite_flag AS overwrite, f.pin_lifetime, f.bringonline_token,
    f.file_metadata, j.job_metadata, f.user_filesize, f.internal_file_params,
    f.pid
"#;

/// Fetch up to `limit` SUBMITTED files per queue, grouped by VO.
pub async fn get_ready_transfers(
    pool: &PgPool,
    queues: &[QueuePair],
    limit: i64,
) -> Result<HashMap<String, Vec<TransferFile>>, CoreError> {
    let query = format!(
        r#"
        SELECT {TRANSFER_FILE_COLUMNS}
        FROM transfer_files f
        JOIN transfer_jobs j ON f.job_id = j.job_id
        WHERE f.source_se = $1 AND f.dest_se = $2 AND f.vo_name = $3
          AND f.file_state = 'SUBMITTED'
        ORDER BY j.submit_time, f.file_id
        LIMIT $4
        "#
    );

    let mut grouped: HashMap<String, Vec<TransferFile>> = HashMap::new();
    for queue in queues {
        let files = sqlx::query_as::<_, TransferFile>(&query)
            .bind(&queue.source_se)
            .bind(&queue.dest_se)
            .bind(&queue.vo_name)
            .bind(limit)
            .fetch_all(pool)
            .await?;

        if !files.is_empty() {
            grouped
                .entry(queue.vo_name.clone())
                .or_default()
                .extend(files);
        }
    }

    Ok(grouped)
}

// ============================================================================
// Configuration Lookups
// ============================================================================

/// Link configuration row for the exact (source, destination) names.
pub async fn get_link_config(
    pool: &PgPool,
    source: &str,
    destination: &str,
) -> Result<Option<LinkConfig>, CoreError> {
    let config = sqlx::query_as::<_, LinkConfig>(
        r#"
        SELECT source, destination, symbolic_name, state,
               nostreams, tcp_buffer_size, urlcopy_timeout, auto_tuning
        FROM link_config
        WHERE source = $1 AND destination = $2
        "#,
    )
    .bind(source)
    .bind(destination)
    .fetch_optional(pool)
    .await?;

    Ok(config)
}

/// Share row for the exact (source, destination, vo) triple.
pub async fn get_share_config(
    pool: &PgPool,
    source: &str,
    destination: &str,
    vo: &str,
) -> Result<Option<ShareConfig>, CoreError> {
    let config = sqlx::query_as::<_, ShareConfig>(
        r#"
        SELECT source, destination, vo, active
        FROM share_config
        WHERE source = $1 AND destination = $2 AND vo = $3
        "#,
    )
    .bind(source)
    .bind(destination)
    .bind(vo)
    .fetch_optional(pool)
    .await?;

    Ok(config)
}

/// VOs holding a dedicated (non-public) share on the given row names.
pub async fn vos_with_dedicated_share(
    pool: &PgPool,
    source: &str,
    destination: &str,
) -> Result<Vec<String>, CoreError> {
    let vos = sqlx::query_scalar::<_, String>(
        r#"
        SELECT vo FROM share_config
        WHERE source = $1 AND destination = $2 AND vo <> 'public'
        "#,
    )
    .bind(source)
    .bind(destination)
    .fetch_all(pool)
    .await?;

    Ok(vos)
}

/// Group the SE is a member of, if any.
pub async fn get_group_for_se(pool: &PgPool, se: &str) -> Result<Option<String>, CoreError> {
    let group = sqlx::query_scalar::<_, String>(
        r#"
        SELECT group_name FROM se_group_members WHERE member_se = $1
        "#,
    )
    .bind(se)
    .fetch_optional(pool)
    .await?;

    Ok(group)
}

/// Whether the given name denotes an SE group.
pub async fn check_group_exists(pool: &PgPool, name: &str) -> Result<bool, CoreError> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS(SELECT 1 FROM se_group_members WHERE group_name = $1)
        "#,
    )
    .bind(name)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Per-SE concurrency caps, if configured.
pub async fn get_se_limits(pool: &PgPool, se: &str) -> Result<Option<SeLimits>, CoreError> {
    let limits = sqlx::query_as::<_, SeLimits>(
        r#"
        SELECT se, inbound_max_active, outbound_max_active
        FROM se_limits
        WHERE se = $1
        "#,
    )
    .bind(se)
    .fetch_optional(pool)
    .await?;

    Ok(limits)
}

// ============================================================================
// Live Credit Counts
// ============================================================================
//
// READY files hold credit too: they are admitted and about to spawn, so
// counting only ACTIVE would over-admit within a single dispatch cycle.

/// Admitted transfers on the exact (source, destination) pair.
pub async fn count_active_on_pair(
    pool: &PgPool,
    source_se: &str,
    dest_se: &str,
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND dest_se = $2 AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers leaving the source SE, any destination.
pub async fn count_active_from_source(pool: &PgPool, source_se: &str) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(source_se)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers arriving at the destination SE, any source.
pub async fn count_active_to_dest(pool: &PgPool, dest_se: &str) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE dest_se = $1 AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(dest_se)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers on the pair charged to one VO.
pub async fn count_active_on_pair_for_vo(
    pool: &PgPool,
    source_se: &str,
    dest_se: &str,
    vo: &str,
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND dest_se = $2 AND vo_name = $3
          AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .bind(vo)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers leaving the source SE charged to one VO.
pub async fn count_active_from_source_for_vo(
    pool: &PgPool,
    source_se: &str,
    vo: &str,
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND vo_name = $2 AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(source_se)
    .bind(vo)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers arriving at the destination SE charged to one VO.
pub async fn count_active_to_dest_for_vo(
    pool: &PgPool,
    dest_se: &str,
    vo: &str,
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE dest_se = $1 AND vo_name = $2 AND file_state IN ('ACTIVE', 'READY')
        "#,
    )
    .bind(dest_se)
    .bind(vo)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Active transfers on the pair charged to the public pool.
pub async fn count_active_on_pair_public(
    pool: &PgPool,
    source_se: &str,
    dest_se: &str,
    dedicated: &[String],
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND dest_se = $2
          AND file_state IN ('ACTIVE', 'READY')
          AND NOT (vo_name = ANY($3))
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .bind(dedicated)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers leaving the source SE charged to the public pool.
pub async fn count_active_from_source_public(
    pool: &PgPool,
    source_se: &str,
    dedicated: &[String],
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE source_se = $1 AND file_state IN ('ACTIVE', 'READY')
          AND NOT (vo_name = ANY($2))
        "#,
    )
    .bind(source_se)
    .bind(dedicated)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Admitted transfers arriving at the destination SE charged to the public pool.
pub async fn count_active_to_dest_public(
    pool: &PgPool,
    dest_se: &str,
    dedicated: &[String],
) -> Result<i64, CoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE dest_se = $1 AND file_state IN ('ACTIVE', 'READY')
          AND NOT (vo_name = ANY($2))
        "#,
    )
    .bind(dest_se)
    .bind(dedicated)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

// ============================================================================
// Optimizer State
// ============================================================================

/// Tuned parameter triple and recent outcome aggregates for a pair.
///
/// The triple comes from the best-throughput history row; the aggregates
/// (sample count, success rate, mean throughput) from terminal transfers on
/// the pair within the last hour. CANCELED files carry no signal and are
/// excluded from the rate.
pub async fn fetch_optimization_config(
    pool: &PgPool,
    source_se: &str,
    dest_se: &str,
) -> Result<OptimizerSnapshot, CoreError> {
    let triple: Option<(i32, i32, i32)> = sqlx::query_as(
        r#"
        SELECT nostreams, timeout, buffer_size
        FROM optimizer_history
        WHERE source_se = $1 AND dest_se = $2
        ORDER BY throughput DESC NULLS LAST, recorded_at DESC
        LIMIT 1
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .fetch_optional(pool)
    .await?;

    let (num_samples, success_rate, throughput): (i64, f64, f64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(100.0 * (COUNT(*) FILTER (WHERE file_state = 'FINISHED'))::float8
                        / NULLIF(COUNT(*), 0)::float8, 0.0),
               COALESCE(AVG(throughput) FILTER (WHERE file_state = 'FINISHED'), 0.0)
        FROM transfer_files
        WHERE source_se = $1 AND dest_se = $2
          AND file_state IN ('FINISHED', 'FAILED')
          AND finish_time > NOW() - INTERVAL '1 hour'
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .fetch_one(pool)
    .await?;

    let (nostreams, timeout, buffer_size) = triple.unwrap_or((4, 3600, 0));

    Ok(OptimizerSnapshot {
        nostreams,
        buffer_size,
        timeout,
        num_samples,
        success_rate,
        throughput,
    })
}

/// Seed the optimizer history for a pair seen for the first time.
pub async fn init_optimizer(
    pool: &PgPool,
    source_se: &str,
    dest_se: &str,
    nostreams: i32,
    timeout: i32,
    buffer_size: i32,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO optimizer_history (source_se, dest_se, nostreams, timeout, buffer_size)
        SELECT $1, $2, $3, $4, $5
        WHERE NOT EXISTS (
            SELECT 1 FROM optimizer_history WHERE source_se = $1 AND dest_se = $2
        )
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .bind(nostreams)
    .bind(timeout)
    .bind(buffer_size)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Executor Writes
// ============================================================================

/// Persist auto-tuned protocol parameters and move the file to READY.
///
/// Marks the applied optimizer history row so tuning can see which triple
/// was last handed out for the pair.
#[allow(clippy::too_many_arguments)]
pub async fn set_allowed(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    source_se: &str,
    dest_se: &str,
    nostreams: i32,
    timeout: i32,
    buffer_size: i32,
) -> Result<(), CoreError> {
    let params = format!("nostreams:{nostreams},timeout:{timeout},buffersize:{buffer_size}");

    let result = sqlx::query(
        r#"
        UPDATE transfer_files
        SET file_state = 'READY', internal_file_params = $3
        WHERE job_id = $1 AND file_id = $2 AND file_state = 'SUBMITTED'
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(&params)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::TransferNotFound { file_id });
    }

    sqlx::query(
        r#"
        UPDATE optimizer_history SET applied_at = NOW()
        WHERE id = (
            SELECT id FROM optimizer_history
            WHERE source_se = $1 AND dest_se = $2
            ORDER BY throughput DESC NULLS LAST, recorded_at DESC
            LIMIT 1
        )
        "#,
    )
    .bind(source_se)
    .bind(dest_se)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist literal protocol parameters and move the file to READY.
pub async fn set_allowed_no_optimize(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    params: &str,
) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE transfer_files
        SET file_state = 'READY', internal_file_params = $3
        WHERE job_id = $1 AND file_id = $2 AND file_state = 'SUBMITTED'
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(params)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::TransferNotFound { file_id });
    }

    Ok(())
}

/// Update the state of one file.
///
/// Terminal states are written once: a second write for an already terminal
/// file (a redelivered message, or another node racing us) changes no row
/// and returns false. Zero-valued pid/filesize/duration/throughput leave
/// the stored columns untouched.
#[allow(clippy::too_many_arguments)]
pub async fn update_file_transfer_status(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    state: &str,
    reason: &str,
    pid: i32,
    filesize: i64,
    duration_secs: f64,
    throughput: f64,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE transfer_files
        SET file_state = $3,
            reason = CASE WHEN $4 <> '' THEN $4 ELSE reason END,
            pid = CASE WHEN $5 > 0 THEN $5 ELSE pid END,
            filesize = CASE WHEN $6 > 0 THEN $6 ELSE filesize END,
            tx_duration = CASE WHEN $7 > 0 THEN $7 ELSE tx_duration END,
            throughput = CASE WHEN $8 > 0 THEN $8 ELSE throughput END,
            start_time = CASE WHEN $3 = 'ACTIVE' AND start_time IS NULL
                              THEN NOW() ELSE start_time END,
            finish_time = CASE WHEN $3 IN ('FINISHED', 'FAILED', 'CANCELED')
                               THEN NOW() ELSE finish_time END
        WHERE job_id = $1 AND file_id = $2
          AND file_state NOT IN ('FINISHED', 'FAILED', 'CANCELED')
          AND file_state <> $3
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(state)
    .bind(reason)
    .bind(pid)
    .bind(filesize)
    .bind(duration_secs)
    .bind(throughput)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Recompute and persist the aggregate job state from its member files.
///
/// `state` is used only for a job without any files.
pub async fn update_job_transfer_status(
    pool: &PgPool,
    job_id: &str,
    state: &str,
) -> Result<(), CoreError> {
    let (total, running, failed, canceled): (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE file_state IN ('ACTIVE', 'READY')),
               COUNT(*) FILTER (WHERE file_state = 'FAILED'),
               COUNT(*) FILTER (WHERE file_state = 'CANCELED')
        FROM transfer_files
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    let pending: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transfer_files
        WHERE job_id = $1 AND file_state IN ('SUBMITTED', 'READY', 'ACTIVE')
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    let job_state = if total == 0 {
        state
    } else if pending.0 > 0 {
        if running > 0 { "ACTIVE" } else { "SUBMITTED" }
    } else if failed > 0 {
        "FAILED"
    } else if canceled > 0 {
        "CANCELED"
    } else {
        "FINISHED"
    };

    let terminal = matches!(job_state, "FINISHED" | "FAILED" | "CANCELED");
    let result = sqlx::query(
        r#"
        UPDATE transfer_jobs
        SET job_state = $2,
            finish_time = CASE WHEN $3 AND finish_time IS NULL THEN NOW() ELSE finish_time END
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(job_state)
    .bind(terminal)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::JobNotFound {
            job_id: job_id.to_string(),
        });
    }

    Ok(())
}

/// Revert a READY file to SUBMITTED after a failed subprocess spawn.
pub async fn fork_failed_revert_state(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE transfer_files
        SET file_state = 'SUBMITTED', pid = NULL
        WHERE job_id = $1 AND file_id = $2 AND file_state = 'READY'
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record the copy subprocess PID for a file.
pub async fn set_pid(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    pid: i32,
) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE transfer_files SET pid = $3
        WHERE job_id = $1 AND file_id = $2
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(pid)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::TransferNotFound { file_id });
    }

    Ok(())
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Schedule one more attempt for a failed file.
///
/// Guarded so a redelivered copy of the same failure message cannot advance
/// the counter twice: the write applies only while the stored count is below
/// the new one.
pub async fn set_retry_transfer(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
    retry: i32,
    reason: &str,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        UPDATE transfer_files
        SET file_state = 'SUBMITTED', retry_count = $3, reason = $4, pid = NULL
        WHERE job_id = $1 AND file_id = $2
          AND file_state NOT IN ('FINISHED', 'FAILED', 'CANCELED')
          AND retry_count < $3
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .bind(retry)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

/// Retry budget configured for a job.
pub async fn retry_budget(pool: &PgPool, job_id: &str) -> Result<i32, CoreError> {
    let budget = sqlx::query_scalar::<_, i32>(
        r#"
        SELECT retry_max FROM transfer_jobs WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    budget.ok_or_else(|| CoreError::JobNotFound {
        job_id: job_id.to_string(),
    })
}

/// Attempts already consumed by a file.
pub async fn current_retry_count(
    pool: &PgPool,
    job_id: &str,
    file_id: i64,
) -> Result<i32, CoreError> {
    let count = sqlx::query_scalar::<_, i32>(
        r#"
        SELECT retry_count FROM transfer_files
        WHERE job_id = $1 AND file_id = $2
        "#,
    )
    .bind(job_id)
    .bind(file_id)
    .fetch_optional(pool)
    .await?;

    count.ok_or(CoreError::TransferNotFound { file_id })
}

/// Fail every non-terminal file served by the given copy process.
pub async fn terminate_reuse_process(
    pool: &PgPool,
    job_id: &str,
    pid: i32,
    message: &str,
) -> Result<Vec<i64>, CoreError> {
    let failed = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE transfer_files
        SET file_state = 'FAILED', reason = $3, finish_time = NOW()
        WHERE job_id = $1 AND pid = $2
          AND file_state NOT IN ('FINISHED', 'FAILED', 'CANCELED')
        RETURNING file_id
        "#,
    )
    .bind(job_id)
    .bind(pid)
    .bind(message)
    .fetch_all(pool)
    .await?;

    Ok(failed)
}

/// Bulk-persist throughput/progress markers.
pub async fn update_transfer_progress(
    pool: &PgPool,
    markers: &[ProgressMarker],
) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    for marker in markers {
        sqlx::query(
            r#"
            UPDATE transfer_files
            SET throughput = $3, transferred = $4
            WHERE job_id = $1 AND file_id = $2 AND file_state = 'ACTIVE'
            "#,
        )
        .bind(&marker.job_id)
        .bind(marker.file_id)
        .bind(marker.throughput)
        .bind(marker.transferred)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Bulk-persist transfer log locations.
pub async fn update_log_paths(pool: &PgPool, records: &[LogRecord]) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    for record in records {
        sqlx::query(
            r#"
            UPDATE transfer_files
            SET log_file = $3, log_file_debug = $4
            WHERE job_id = $1 AND file_id = $2
            "#,
        )
        .bind(&record.job_id)
        .bind(record.file_id)
        .bind(&record.log_path)
        .bind(record.debug_log)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

// ============================================================================
// Host State
// ============================================================================

/// Whether drain has been requested for the given host.
pub async fn drain_requested(pool: &PgPool, host: &str) -> Result<bool, CoreError> {
    let drain = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT drain FROM scheduler_hosts WHERE hostname = $1
        "#,
    )
    .bind(host)
    .fetch_optional(pool)
    .await?;

    Ok(drain.unwrap_or(false))
}

/// Check database health.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, CoreError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn get_queues(&self) -> Result<Vec<QueuePair>, CoreError> {
        get_queues(&self.pool).await
    }

    async fn get_ready_transfers(
        &self,
        queues: &[QueuePair],
        limit: i64,
    ) -> Result<HashMap<String, Vec<TransferFile>>, CoreError> {
        get_ready_transfers(&self.pool, queues, limit).await
    }

    async fn get_link_config(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<LinkConfig>, CoreError> {
        get_link_config(&self.pool, source, destination).await
    }

    async fn get_share_config(
        &self,
        source: &str,
        destination: &str,
        vo: &str,
    ) -> Result<Option<ShareConfig>, CoreError> {
        get_share_config(&self.pool, source, destination, vo).await
    }

    async fn vos_with_dedicated_share(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Vec<String>, CoreError> {
        vos_with_dedicated_share(&self.pool, source, destination).await
    }

    async fn get_group_for_se(&self, se: &str) -> Result<Option<String>, CoreError> {
        get_group_for_se(&self.pool, se).await
    }

    async fn check_group_exists(&self, name: &str) -> Result<bool, CoreError> {
        check_group_exists(&self.pool, name).await
    }

    async fn get_se_limits(&self, se: &str) -> Result<Option<SeLimits>, CoreError> {
        get_se_limits(&self.pool, se).await
    }

    async fn count_active_on_pair(
        &self,
        source_se: &str,
        dest_se: &str,
    ) -> Result<i64, CoreError> {
        count_active_on_pair(&self.pool, source_se, dest_se).await
    }

    async fn count_active_from_source(&self, source_se: &str) -> Result<i64, CoreError> {
        count_active_from_source(&self.pool, source_se).await
    }

    async fn count_active_to_dest(&self, dest_se: &str) -> Result<i64, CoreError> {
        count_active_to_dest(&self.pool, dest_se).await
    }

    async fn count_active_on_pair_for_vo(
        &self,
        source_se: &str,
        dest_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        count_active_on_pair_for_vo(&self.pool, source_se, dest_se, vo).await
    }

    async fn count_active_from_source_for_vo(
        &self,
        source_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        count_active_from_source_for_vo(&self.pool, source_se, vo).await
    }

    async fn count_active_to_dest_for_vo(
        &self,
        dest_se: &str,
        vo: &str,
    ) -> Result<i64, CoreError> {
        count_active_to_dest_for_vo(&self.pool, dest_se, vo).await
    }

    async fn count_active_on_pair_public(
        &self,
        source_se: &str,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        count_active_on_pair_public(&self.pool, source_se, dest_se, dedicated).await
    }

    async fn count_active_from_source_public(
        &self,
        source_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        count_active_from_source_public(&self.pool, source_se, dedicated).await
    }

    async fn count_active_to_dest_public(
        &self,
        dest_se: &str,
        dedicated: &[String],
    ) -> Result<i64, CoreError> {
        count_active_to_dest_public(&self.pool, dest_se, dedicated).await
    }

    async fn fetch_optimization_config(
        &self,
        source_se: &str,
        dest_se: &str,
    ) -> Result<OptimizerSnapshot, CoreError> {
        fetch_optimization_config(&self.pool, source_se, dest_se).await
    }

    async fn init_optimizer(
        &self,
        source_se: &str,
        dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError> {
        init_optimizer(&self.pool, source_se, dest_se, nostreams, timeout, buffer_size).await
    }

    async fn set_allowed(
        &self,
        job_id: &str,
        file_id: i64,
        source_se: &str,
        dest_se: &str,
        nostreams: i32,
        timeout: i32,
        buffer_size: i32,
    ) -> Result<(), CoreError> {
        set_allowed(
            &self.pool,
            job_id,
            file_id,
            source_se,
            dest_se,
            nostreams,
            timeout,
            buffer_size,
        )
        .await
    }

    async fn set_allowed_no_optimize(
        &self,
        job_id: &str,
        file_id: i64,
        params: &str,
    ) -> Result<(), CoreError> {
        set_allowed_no_optimize(&self.pool, job_id, file_id, params).await
    }

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
    ) -> Result<bool, CoreError> {
        update_file_transfer_status(
            &self.pool,
            job_id,
            file_id,
            state,
            reason,
            pid,
            filesize,
            duration_secs,
            throughput,
        )
        .await
    }

    async fn update_job_transfer_status(
        &self,
        job_id: &str,
        state: &str,
    ) -> Result<(), CoreError> {
        update_job_transfer_status(&self.pool, job_id, state).await
    }

    async fn fork_failed_revert_state(
        &self,
        job_id: &str,
        file_id: i64,
    ) -> Result<(), CoreError> {
        fork_failed_revert_state(&self.pool, job_id, file_id).await
    }

    async fn set_pid(&self, job_id: &str, file_id: i64, pid: i32) -> Result<(), CoreError> {
        set_pid(&self.pool, job_id, file_id, pid).await
    }

    async fn set_retry_transfer(
        &self,
        job_id: &str,
        file_id: i64,
        retry: i32,
        reason: &str,
    ) -> Result<(), CoreError> {
        set_retry_transfer(&self.pool, job_id, file_id, retry, reason).await
    }

    async fn retry_budget(&self, job_id: &str) -> Result<i32, CoreError> {
        retry_budget(&self.pool, job_id).await
    }

    async fn current_retry_count(&self, job_id: &str, file_id: i64) -> Result<i32, CoreError> {
        current_retry_count(&self.pool, job_id, file_id).await
    }

    async fn terminate_reuse_process(
        &self,
        job_id: &str,
        pid: i32,
        message: &str,
    ) -> Result<Vec<i64>, CoreError> {
        terminate_reuse_process(&self.pool, job_id, pid, message).await
    }

    async fn update_transfer_progress(
        &self,
        markers: &[ProgressMarker],
    ) -> Result<(), CoreError> {
        update_transfer_progress(&self.pool, markers).await
    }

    async fn update_log_paths(&self, records: &[LogRecord]) -> Result<(), CoreError> {
        update_log_paths(&self.pool, records).await
    }

    async fn drain_requested(&self, host: &str) -> Result<bool, CoreError> {
        drain_requested(&self.pool, host).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check_db(&self.pool).await
    }
}
