// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lookup of delegated proxy credentials for transfer spawning.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Resolves the on-disk proxy certificate for a submitting user.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Path of the delegated proxy for the given delegation id and user.
    async fn proxy_path(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf>;
}

/// Credential store over a directory of delegated proxy files.
///
/// The delegation service drops proxies under a shared directory using a
/// digest-derived name, so lookup is a pure path computation plus an
/// existence check. The daemon never reads or validates the proxy itself;
/// the url-copy process does that.
#[derive(Debug, Clone)]
pub struct DirCredentialStore {
    dir: PathBuf,
}

impl DirCredentialStore {
    /// Use proxies under the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CredentialStore for DirCredentialStore {
    async fn proxy_path(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf> {
        let path = self.dir.join(proxy_name(cred_id, user_dn));
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            Err(Error::CredentialNotFound(format!(
                "{user_dn} (delegation {cred_id})"
            )))
        }
    }
}

/// Stable proxy file name for a (delegation id, user) pair.
fn proxy_name(cred_id: &str, user_dn: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_dn.as_bytes());
    hasher.update(b":");
    hasher.update(cred_id.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("x509up_h{hex}")
}

/// Mock credential store for testing.
pub struct MockCredentialStore {
    /// If true, every lookup fails as missing.
    pub fail_by_default: bool,
    dir: PathBuf,
}

impl Default for MockCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCredentialStore {
    /// Create a mock that resolves every lookup.
    pub fn new() -> Self {
        Self {
            fail_by_default: false,
            dir: PathBuf::from("/tmp"),
        }
    }

    /// Create a mock where every lookup fails.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl CredentialStore for MockCredentialStore {
    async fn proxy_path(&self, cred_id: &str, user_dn: &str) -> Result<PathBuf> {
        if self.fail_by_default {
            return Err(Error::CredentialNotFound(format!(
                "{user_dn} (delegation {cred_id})"
            )));
        }
        Ok(self.dir.join(proxy_name(cred_id, user_dn)))
    }
}
