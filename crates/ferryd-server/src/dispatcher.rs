// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch loop feeding candidate transfers to the executor.
//!
//! Each cycle checks drain mode, fetches the distinct pending queues,
//! splits them into chunks and walks every chunk concurrently. Admission
//! itself happens per file inside [`TransferExecutor`]; the dispatcher
//! only decides which candidates are worth offering this cycle.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use ferryd_core::Persistence;
use ferryd_core::persistence::QueuePair;

use crate::batch::TransferBatch;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::executor::{ExecuteOutcome, TransferExecutor};

/// Transfer dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Idle delay between dispatch cycles
    pub poll_interval: Duration,
    /// Delay between cycles while the host is draining
    pub drain_backoff: Duration,
    /// Maximum candidates fetched per queue chunk
    pub fetch_limit: i64,
    /// Maximum concurrent queue chunks per cycle
    pub chunk_workers: usize,
    /// Name this host is registered under for drain checks
    pub host_alias: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            drain_backoff: Duration::from_secs(15),
            fetch_limit: 100,
            chunk_workers: 4,
            host_alias: "localhost".to_string(),
        }
    }
}

/// Background task that keeps offering pending transfers to the executor.
pub struct TransferDispatcher {
    db: Arc<dyn Persistence>,
    executor: Arc<TransferExecutor>,
    credentials: Arc<dyn CredentialStore>,
    config: DispatcherConfig,
    shutdown: Arc<Notify>,
    draining: AtomicBool,
}

impl TransferDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        db: Arc<dyn Persistence>,
        executor: Arc<TransferExecutor>,
        credentials: Arc<dyn CredentialStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            executor,
            credentials,
            config,
            shutdown: Arc::new(Notify::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the dispatch loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            fetch_limit = self.config.fetch_limit,
            chunk_workers = self.config.chunk_workers,
            host = %self.config.host_alias,
            "Transfer dispatcher started"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Transfer dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    delay = match self.cycle().await {
                        Ok(next) => next,
                        Err(e) => {
                            error!(error = %e, "Dispatch cycle failed");
                            self.config.poll_interval
                        }
                    };
                }
            }
        }

        info!("Transfer dispatcher stopped");
    }

    /// One dispatch cycle. Returns the delay until the next one.
    async fn cycle(&self) -> Result<Duration> {
        if self.db.drain_requested(&self.config.host_alias).await? {
            if !self.draining.swap(true, Ordering::SeqCst) {
                info!(host = %self.config.host_alias, "Drain requested, admission paused");
            }
            return Ok(self.config.drain_backoff);
        }
        if self.draining.swap(false, Ordering::SeqCst) {
            info!(host = %self.config.host_alias, "Drain cleared, admission resumed");
        }

        let queues = match self.db.get_queues().await {
            Ok(queues) => queues,
            Err(first) => {
                warn!(error = %first, "Queue fetch failed, retrying once");
                tokio::time::sleep(Duration::from_secs(1)).await;
                match self.db.get_queues().await {
                    Ok(queues) => queues,
                    Err(second) => {
                        error!(error = %second, "Queue fetch failed twice, skipping cycle");
                        return Ok(self.config.poll_interval);
                    }
                }
            }
        };

        if queues.is_empty() {
            debug!("No pending transfer queues");
            return Ok(self.config.poll_interval);
        }

        let chunk_count = self.config.chunk_workers.min(queues.len());
        let mut chunks: Vec<Vec<QueuePair>> = vec![Vec::new(); chunk_count];
        for (i, queue) in queues.into_iter().enumerate() {
            chunks[i % chunk_count].push(queue);
        }

        let mut workers = JoinSet::new();
        for chunk in chunks {
            let db = self.db.clone();
            let executor = self.executor.clone();
            let credentials = self.credentials.clone();
            let fetch_limit = self.config.fetch_limit;
            workers
                .spawn(async move { dispatch_chunk(db, executor, credentials, chunk, fetch_limit).await });
        }

        let mut examined = 0usize;
        let mut scheduled = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((chunk_examined, chunk_scheduled)) => {
                    examined += chunk_examined;
                    scheduled += chunk_scheduled;
                }
                Err(e) => error!(error = %e, "Dispatch worker panicked"),
            }
        }

        info!(examined, scheduled, "Dispatch cycle complete");
        Ok(self.config.poll_interval)
    }
}

/// Walk one chunk of queues, offering each fetched candidate in turn.
/// Returns (files examined, files scheduled).
async fn dispatch_chunk(
    db: Arc<dyn Persistence>,
    executor: Arc<TransferExecutor>,
    credentials: Arc<dyn CredentialStore>,
    queues: Vec<QueuePair>,
    fetch_limit: i64,
) -> (usize, usize) {
    let by_vo = match db.get_ready_transfers(&queues, fetch_limit).await {
        Ok(by_vo) => by_vo,
        Err(e) => {
            warn!(error = %e, "Failed to fetch ready transfers for chunk");
            return (0, 0);
        }
    };

    let mut examined = 0;
    let mut scheduled = 0;
    // Both caches live for one chunk: proxies so one user's credential is
    // resolved once, denied pairs so a saturated link is not re-evaluated
    // for every remaining candidate on it.
    let mut proxies: HashMap<(String, String), PathBuf> = HashMap::new();
    let mut denied_pairs: HashSet<(String, String)> = HashSet::new();

    for file in TransferBatch::new(by_vo) {
        examined += 1;

        if file.file_id == 0 || file.user_dn.is_empty() || file.cred_id.is_empty() {
            warn!(
                job_id = %file.job_id,
                file_id = file.file_id,
                "Skipping malformed transfer row"
            );
            continue;
        }

        let pair = (file.source_se.clone(), file.dest_se.clone());
        if denied_pairs.contains(&pair) {
            debug!(
                job_id = %file.job_id,
                file_id = file.file_id,
                "Skipping transfer on a pair already denied this cycle"
            );
            continue;
        }

        let proxy_key = (file.cred_id.clone(), file.user_dn.clone());
        let proxy = match proxies.get(&proxy_key) {
            Some(path) => path.clone(),
            None => match credentials.proxy_path(&file.cred_id, &file.user_dn).await {
                Ok(path) => {
                    proxies.insert(proxy_key, path.clone());
                    path
                }
                Err(e) => {
                    warn!(
                        job_id = %file.job_id,
                        file_id = file.file_id,
                        error = %e,
                        "No usable proxy, skipping transfer"
                    );
                    continue;
                }
            },
        };

        match executor.execute(&file, &proxy).await {
            Ok(ExecuteOutcome::Started) => scheduled += 1,
            Ok(ExecuteOutcome::Denied) => {
                denied_pairs.insert(pair);
            }
            Ok(ExecuteOutcome::TakenElsewhere) | Ok(ExecuteOutcome::SpawnFailed) => {}
            Err(e) => {
                warn!(
                    job_id = %file.job_id,
                    file_id = file.file_id,
                    error = %e,
                    "Transfer execution failed"
                );
            }
        }
    }

    (examined, scheduled)
}
