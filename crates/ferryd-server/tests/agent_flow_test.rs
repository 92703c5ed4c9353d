// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end agent test against a real PostgreSQL database.
//!
//! Runs the full runtime with `/bin/true` standing in for the url-copy
//! binary and drives the terminal state by hand-publishing the status
//! report a real copy process would have written.
//!
//! Point TEST_FERRYD_DATABASE_URL at a PostgreSQL instance (one started
//! with testcontainers works fine); tests skip silently when it is unset.
//!
//! Run with: TEST_FERRYD_DATABASE_URL=postgres://... cargo test

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::TestContext;
use ferryd_server::credentials::MockCredentialStore;
use ferryd_server::dispatcher::DispatcherConfig;
use ferryd_server::executor::ExecutorConfig;
use ferryd_server::messages::StatusMessage;
use ferryd_server::reconciler::ReconcilerConfig;
use ferryd_server::runtime::ServerRuntime;
use ferryd_server::spool::{Producer, Subqueue};

/// Poll a file's state until it matches, for up to ten seconds.
async fn wait_for_state(ctx: &TestContext, file_id: i64, want: &str) -> bool {
    for _ in 0..100 {
        if ctx.file_state(file_id).await.as_deref() == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// The whole lifecycle in one test so no second runtime is ever
/// scheduling rows this one asserts on: a drained host admits
/// nothing; clearing the flag lets the file through to ACTIVE; a
/// spooled FINISHED report settles the file and the job.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_agent_drains_schedules_and_settles() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        return;
    };

    let source = TestContext::unique_se("agent-src");
    let dest = TestContext::unique_se("agent-dst");
    let host = TestContext::unique_host("agent");
    let job_id = format!("job-agent-{}", uuid::Uuid::new_v4());

    ctx.create_job(&job_id, "atlas", 0).await;
    let file_id = ctx
        .create_file(&job_id, "atlas", &source, &dest, "SUBMITTED")
        .await;
    ctx.set_drain(&host, true).await;

    let spool = tempfile::tempdir().expect("tempdir");
    let logs = tempfile::tempdir().expect("tempdir");

    let runtime = ServerRuntime::builder()
        .persistence(ctx.db.clone())
        .credentials(Arc::new(MockCredentialStore::new()))
        .message_dir(spool.path())
        .executor_config(ExecutorConfig {
            url_copy_bin: "/bin/true".into(),
            log_dir: logs.path().to_path_buf(),
            ..ExecutorConfig::default()
        })
        .dispatcher_config(DispatcherConfig {
            poll_interval: Duration::from_millis(200),
            drain_backoff: Duration::from_millis(300),
            host_alias: host.clone(),
            ..DispatcherConfig::default()
        })
        .reconciler_config(ReconcilerConfig {
            poll_interval: Duration::from_millis(100),
            ..ReconcilerConfig::default()
        })
        .build()
        .expect("build runtime")
        .start()
        .await
        .expect("start runtime");

    // Several dispatch cycles pass while the host is draining.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        ctx.file_state(file_id).await.as_deref(),
        Some("SUBMITTED"),
        "drained host must not admit transfers"
    );

    ctx.set_drain(&host, false).await;
    assert!(
        wait_for_state(&ctx, file_id, "ACTIVE").await,
        "file should reach ACTIVE once the drain clears"
    );

    // Stand in for the url-copy process reporting completion.
    let reporter =
        Producer::new(spool.path(), Subqueue::Status).expect("open status producer");
    reporter
        .put(&StatusMessage {
            job_id: job_id.clone(),
            file_id,
            vo_name: "atlas".to_string(),
            source_se: source.clone(),
            dest_se: dest.clone(),
            transfer_status: "FINISHED".to_string(),
            transfer_message: String::new(),
            retry: false,
            process_id: 4242,
            timestamp: Utc::now(),
            filesize: 1_048_576,
            tx_duration: 5.0,
            throughput: 0.2,
        })
        .await
        .expect("publish status report");

    assert!(
        wait_for_state(&ctx, file_id, "FINISHED").await,
        "file should settle once the report is reconciled"
    );
    assert_eq!(ctx.job_state(&job_id).await.as_deref(), Some("FINISHED"));

    runtime.shutdown().await.expect("shutdown runtime");

    ctx.cleanup_job(&job_id).await;
    ctx.cleanup_host(&host).await;
    ctx.cleanup_pair(&[&source, &dest]).await;
}
