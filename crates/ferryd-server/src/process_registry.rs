// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory registry of running url-copy processes.
//!
//! One entry per (job, file) holding the child pid and the instant of the
//! last sign of life. The executor registers on spawn, the reconciler
//! touches entries as status pings and progress markers arrive, and the
//! stall monitor reaps entries that stay silent too long. The registry is
//! process-local state; it is rebuilt from scratch after a restart as
//! messages flow in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct ProcessEntry {
    pid: i32,
    last_activity: Instant,
}

/// A registered transfer that has gone silent beyond the stall timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledEntry {
    /// Job the silent transfer belongs to.
    pub job_id: String,
    /// The silent file.
    pub file_id: i64,
    /// Pid of the url-copy process that stopped reporting.
    pub pid: i32,
    /// How long the transfer has been silent.
    pub silent_for: Duration,
}

/// Shared map of live url-copy processes keyed by (job, file).
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<(String, i64), ProcessEntry>>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(String, i64), ProcessEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly spawned process.
    pub fn register(&self, job_id: &str, file_id: i64, pid: i32) {
        self.entries().insert(
            (job_id.to_string(), file_id),
            ProcessEntry {
                pid,
                last_activity: Instant::now(),
            },
        );
    }

    /// Reset the stall clock for a transfer that just reported.
    pub fn touch(&self, job_id: &str, file_id: i64) {
        if let Some(entry) = self.entries().get_mut(&(job_id.to_string(), file_id)) {
            entry.last_activity = Instant::now();
        }
    }

    /// Drop the entry for one transfer.
    pub fn remove(&self, job_id: &str, file_id: i64) {
        self.entries().remove(&(job_id.to_string(), file_id));
    }

    /// Drop every entry carried by the given pid, returning the
    /// (job, file) pairs that were tracked under it.
    pub fn remove_pid(&self, pid: i32) -> Vec<(String, i64)> {
        let mut entries = self.entries();
        let keys: Vec<(String, i64)> = entries
            .iter()
            .filter(|(_, entry)| entry.pid == pid)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        keys
    }

    /// Entries that have been silent longer than `timeout`.
    pub fn stalled(&self, timeout: Duration) -> Vec<StalledEntry> {
        let now = Instant::now();
        self.entries()
            .iter()
            .filter_map(|((job_id, file_id), entry)| {
                let silent_for = now.duration_since(entry.last_activity);
                (silent_for > timeout).then(|| StalledEntry {
                    job_id: job_id.clone(),
                    file_id: *file_id,
                    pid: entry.pid,
                    silent_for,
                })
            })
            .collect()
    }

    /// Number of tracked processes.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
