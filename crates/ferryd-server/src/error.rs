// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ferryd-server.

use thiserror::Error;

/// Transfer agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Scheduling core operation failed.
    #[error("Core error: {0}")]
    Core(#[from] ferryd_core::CoreError),

    /// No delegated proxy credential was found for the user.
    #[error("Credential not found: {0}")]
    CredentialNotFound(String),
}

/// Result type using the transfer agent Error.
pub type Result<T> = std::result::Result<T, Error>;
