// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directory-based message spool shared with url-copy processes.
//!
//! Each subqueue is a flat directory of JSON files. Producers write to a
//! `.json.tmp` name and rename into place, so readers never observe a
//! partial message. Consumers claim a message by renaming it to
//! `.json.lock`, then either ack (delete) or release (rename back). A
//! claim that survives a crash is restored by [`Consumer::recover`] on
//! the next start, which is what makes delivery at-least-once.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

const MESSAGE_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".json.tmp";
const LOCK_SUFFIX: &str = ".json.lock";

/// The subqueues under the spool root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subqueue {
    /// Transfer status reports, including liveness pings.
    Status,
    /// Transfer log locations.
    Logs,
    /// Progress markers from running transfers.
    Stalled,
    /// Outbound state-transition notifications for monitoring.
    Monitoring,
}

impl Subqueue {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Logs => "logs",
            Self::Stalled => "stalled",
            Self::Monitoring => "monitoring",
        }
    }
}

/// Writes messages into one subqueue.
#[derive(Debug, Clone)]
pub struct Producer {
    dir: PathBuf,
}

impl Producer {
    /// Open a producer for the given subqueue, creating its directory.
    pub fn new(message_dir: &Path, queue: Subqueue) -> Result<Self> {
        let dir = message_dir.join(queue.dir_name());
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Serialize and publish one message.
    ///
    /// The message becomes visible to consumers only after the final
    /// rename, so a crash mid-write leaves at most an ignored `.tmp`.
    pub async fn put<T: Serialize>(&self, message: &T) -> Result<()> {
        let name = Uuid::new_v4();
        let tmp = self.dir.join(format!("{name}{TMP_SUFFIX}"));
        let full = self.dir.join(format!("{name}{MESSAGE_SUFFIX}"));

        let payload = serde_json::to_vec(message)?;
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }
}

/// A message claimed from a subqueue, pending ack or release.
#[derive(Debug)]
pub struct Claimed<T> {
    /// The deserialized message.
    pub message: T,
    lock_path: PathBuf,
}

impl<T> Claimed<T> {
    /// Consume the message, removing it from the spool.
    pub async fn ack(self) -> Result<()> {
        tokio::fs::remove_file(&self.lock_path).await?;
        Ok(())
    }

    /// Return the message to the spool for a later cycle.
    pub async fn release(self) -> Result<()> {
        let original = unlocked_name(&self.lock_path);
        tokio::fs::rename(&self.lock_path, &original).await?;
        Ok(())
    }
}

fn unlocked_name(lock_path: &Path) -> PathBuf {
    match lock_path.to_str().and_then(|p| p.strip_suffix(".lock")) {
        Some(stripped) => PathBuf::from(stripped),
        // Lock paths are always built by drain(), so this arm is unreachable
        // in practice; fall back to the lock path itself rather than panic.
        None => lock_path.to_path_buf(),
    }
}

/// Reads messages from one subqueue.
#[derive(Debug, Clone)]
pub struct Consumer {
    dir: PathBuf,
}

impl Consumer {
    /// Open a consumer for the given subqueue, creating its directory.
    pub fn new(message_dir: &Path, queue: Subqueue) -> Result<Self> {
        let dir = message_dir.join(queue.dir_name());
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Restore claims abandoned by a previous process.
    ///
    /// Renames every `.json.lock` back to `.json` so the messages are
    /// drained again. Returns the number of restored messages.
    pub async fn recover(&self) -> Result<usize> {
        let mut restored = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.to_str() else { continue };
            if !name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            match tokio::fs::rename(&path, unlocked_name(&path)).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to restore abandoned claim"),
            }
        }
        Ok(restored)
    }

    /// Claim up to `limit` messages.
    ///
    /// Files that cannot be claimed (already taken by another consumer)
    /// are skipped; files that cannot be parsed are logged and deleted.
    pub async fn drain<T: DeserializeOwned>(&self, limit: usize) -> Result<Vec<Claimed<T>>> {
        let mut claimed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if claimed.len() >= limit {
                break;
            }
            let path = entry.path();
            let Some(name) = path.to_str() else { continue };
            if !name.ends_with(MESSAGE_SUFFIX) {
                continue;
            }

            let lock_path = PathBuf::from(format!("{name}.lock"));
            match tokio::fs::rename(&path, &lock_path).await {
                Ok(()) => {}
                // Another consumer renamed it first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to claim spool message");
                    continue;
                }
            }

            let payload = match tokio::fs::read(&lock_path).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(path = %lock_path.display(), error = %e, "Failed to read claimed message");
                    let _ = tokio::fs::rename(&lock_path, &path).await;
                    continue;
                }
            };

            match serde_json::from_slice(&payload) {
                Ok(message) => claimed.push(Claimed { message, lock_path }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unparseable spool message");
                    if let Err(e) = tokio::fs::remove_file(&lock_path).await {
                        warn!(path = %lock_path.display(), error = %e, "Failed to discard message");
                    }
                }
            }
        }

        Ok(claimed)
    }
}
