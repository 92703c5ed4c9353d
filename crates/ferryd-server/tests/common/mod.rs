// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for ferryd-server integration tests.
//!
//! Provides TestContext for setting up the database and seeding the
//! job, file and host rows the agent works against.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use ferryd_core::persistence::PostgresPersistence;

/// Test context holding the database pool and persistence backend.
pub struct TestContext {
    pub pool: PgPool,
    pub db: Arc<PostgresPersistence>,
}

impl TestContext {
    /// Connect to the test database and run migrations.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_FERRYD_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        ferryd_core::migrations::run_postgres(&pool).await.ok()?;
        let db = Arc::new(PostgresPersistence::new(pool.clone()));
        Some(Self { pool, db })
    }

    /// Unique SE name so parallel tests never collide.
    pub fn unique_se(prefix: &str) -> String {
        format!("gsiftp://{}-{}.example.org", prefix, Uuid::new_v4())
    }

    /// Unique host alias for drain-flag tests.
    pub fn unique_host(prefix: &str) -> String {
        format!("{}-{}.example.org", prefix, Uuid::new_v4())
    }

    /// Create a job row.
    pub async fn create_job(&self, job_id: &str, vo: &str, retry_max: i32) {
        sqlx::query(
            r#"
            INSERT INTO transfer_jobs (job_id, vo_name, user_dn, cred_id, retry_max)
            VALUES ($1, $2, '/DC=ch/CN=tester', 'cred-1', $3)
            "#,
        )
        .bind(job_id)
        .bind(vo)
        .bind(retry_max)
        .execute(&self.pool)
        .await
        .expect("Failed to create test job");
    }

    /// Create a file row in the given state, returning its id.
    pub async fn create_file(
        &self,
        job_id: &str,
        vo: &str,
        source_se: &str,
        dest_se: &str,
        state: &str,
    ) -> i64 {
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO transfer_files
                (job_id, file_state, source_surl, dest_surl, source_se, dest_se, vo_name)
            VALUES ($1, $2, $3 || '/path/file', $4 || '/path/file', $3, $4, $5)
            RETURNING file_id
            "#,
        )
        .bind(job_id)
        .bind(state)
        .bind(source_se)
        .bind(dest_se)
        .bind(vo)
        .fetch_one(&self.pool)
        .await
        .expect("Failed to create test file")
    }

    /// Set or clear the drain flag for a host.
    pub async fn set_drain(&self, host: &str, drain: bool) {
        sqlx::query(
            r#"
            INSERT INTO scheduler_hosts (hostname, drain) VALUES ($1, $2)
            ON CONFLICT (hostname) DO UPDATE SET drain = $2
            "#,
        )
        .bind(host)
        .bind(drain)
        .execute(&self.pool)
        .await
        .expect("Failed to set drain flag");
    }

    /// Current state of a file.
    pub async fn file_state(&self, file_id: i64) -> Option<String> {
        sqlx::query_scalar("SELECT file_state FROM transfer_files WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }

    /// Current aggregate state of a job.
    pub async fn job_state(&self, job_id: &str) -> Option<String> {
        sqlx::query_scalar("SELECT job_state FROM transfer_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
    }

    /// Delete everything created for a job.
    pub async fn cleanup_job(&self, job_id: &str) {
        sqlx::query("DELETE FROM transfer_jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .ok();
    }

    /// Delete the drain row for a host.
    pub async fn cleanup_host(&self, host: &str) {
        sqlx::query("DELETE FROM scheduler_hosts WHERE hostname = $1")
            .bind(host)
            .execute(&self.pool)
            .await
            .ok();
    }

    /// Delete optimizer rows touching the given SE names.
    pub async fn cleanup_pair(&self, names: &[&str]) {
        for name in names {
            sqlx::query("DELETE FROM optimizer_history WHERE source_se = $1 OR dest_se = $1")
                .bind(name)
                .execute(&self.pool)
                .await
                .ok();
        }
    }
}

/// Helper macro to skip tests if TEST_FERRYD_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_FERRYD_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_FERRYD_DATABASE_URL not set");
            return;
        }
    };
}
