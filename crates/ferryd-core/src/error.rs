// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ferryd-core.
//!
//! Provides a unified error type shared by the scheduler, the optimizer
//! and the persistence layer.

#![allow(dead_code)] // Variants and methods used in tests and for future expansion

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during scheduling and persistence.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A transfer file was not found in the database.
    TransferNotFound {
        /// The file id that was not found.
        file_id: i64,
    },

    /// A transfer job was not found in the database.
    JobNotFound {
        /// The job id that was not found.
        job_id: String,
    },

    /// A transfer file is in an invalid state for the requested operation.
    InvalidTransferState {
        /// The file id.
        file_id: i64,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransferNotFound { .. } => "TRANSFER_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::InvalidTransferState { .. } => "INVALID_TRANSFER_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the operation later may succeed.
    ///
    /// Database connectivity problems are transient; everything else is a
    /// property of the request itself and will fail again unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransferNotFound { file_id } => {
                write!(f, "Transfer file {} not found", file_id)
            }
            Self::JobNotFound { job_id } => {
                write!(f, "Transfer job '{}' not found", job_id)
            }
            Self::InvalidTransferState {
                file_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Transfer file {} is in invalid state: expected '{}', got '{}'",
                    file_id, expected, actual
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
