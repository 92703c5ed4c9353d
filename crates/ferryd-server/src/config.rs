// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Transfer agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Root of the on-disk message spool shared with url-copy processes
    pub message_dir: PathBuf,
    /// Directory where url-copy processes write their transfer logs
    pub log_dir: PathBuf,
    /// Directory holding delegated proxy credential files
    pub credential_dir: PathBuf,
    /// Path of the url-copy executable to spawn per transfer
    pub url_copy_bin: PathBuf,
    /// BDII endpoint handed to url-copy processes
    pub infosys: String,
    /// Name this host registers under for drain checks and log records
    pub host_alias: String,
    /// Whether the feedback optimizer drives protocol parameters
    pub optimize_enabled: bool,
    /// Debug verbosity forwarded to url-copy processes, 0 disables
    pub debug_level: u8,
    /// Maximum candidate transfers fetched per queue chunk
    pub fetch_limit: i64,
    /// Number of parallel queue chunks per dispatch cycle
    pub chunk_workers: usize,
    /// Delay between dispatch cycles
    pub dispatch_interval: Duration,
    /// Delay between reconcile cycles
    pub reconcile_interval: Duration,
    /// Delay between stall sweeps
    pub stall_sweep_interval: Duration,
    /// Inactivity window after which an ACTIVE transfer counts as stalled
    pub stall_timeout: Duration,
    /// Back-off applied while the host is draining
    pub drain_backoff: Duration,
    /// Maximum spool messages consumed per reconcile cycle and subqueue
    pub spool_drain_limit: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FERRYD_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `FERRYD_MESSAGE_DIR`: message spool root (default: /var/lib/ferryd)
    /// - `FERRYD_LOG_DIR`: url-copy log directory (default: /var/log/ferryd)
    /// - `FERRYD_CREDENTIAL_DIR`: delegated proxy directory (default: /tmp)
    /// - `FERRYD_URL_COPY_BIN`: url-copy executable (default: ferryd-url-copy)
    /// - `FERRYD_INFOSYS`: BDII endpoint (default: lcg-bdii.cern.ch:2170)
    /// - `FERRYD_ALIAS`: host alias (default: `HOSTNAME`, then localhost)
    /// - `FERRYD_OPTIMIZE`: enable the feedback optimizer (default: true)
    /// - `FERRYD_DEBUG_LEVEL`: url-copy debug verbosity (default: 0)
    /// - `FERRYD_FETCH_LIMIT`: candidates per queue chunk (default: 100)
    /// - `FERRYD_CHUNK_WORKERS`: parallel queue chunks (default: 4)
    /// - `FERRYD_DISPATCH_INTERVAL_SECS`: dispatch cadence (default: 2)
    /// - `FERRYD_RECONCILE_INTERVAL_SECS`: reconcile cadence (default: 1)
    /// - `FERRYD_STALL_SWEEP_INTERVAL_SECS`: stall sweep cadence (default: 30)
    /// - `FERRYD_STALL_TIMEOUT_SECS`: stall inactivity window (default: 360)
    /// - `FERRYD_DRAIN_BACKOFF_SECS`: drain back-off (default: 15)
    /// - `FERRYD_SPOOL_DRAIN_LIMIT`: messages per cycle and subqueue (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FERRYD_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FERRYD_DATABASE_URL"))?;

        let message_dir = path_var("FERRYD_MESSAGE_DIR", "/var/lib/ferryd");
        let log_dir = path_var("FERRYD_LOG_DIR", "/var/log/ferryd");
        let credential_dir = path_var("FERRYD_CREDENTIAL_DIR", "/tmp");
        let url_copy_bin = path_var("FERRYD_URL_COPY_BIN", "ferryd-url-copy");

        let infosys = std::env::var("FERRYD_INFOSYS")
            .unwrap_or_else(|_| "lcg-bdii.cern.ch:2170".to_string());

        let host_alias = std::env::var("FERRYD_ALIAS")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "localhost".to_string());

        let optimize_enabled = match std::env::var("FERRYD_OPTIMIZE").as_deref() {
            Err(_) | Ok("true") | Ok("1") => true,
            Ok("false") | Ok("0") => false,
            Ok(_) => {
                return Err(ConfigError::Invalid(
                    "FERRYD_OPTIMIZE",
                    "must be true or false",
                ));
            }
        };

        let debug_level: u8 =
            parse_var("FERRYD_DEBUG_LEVEL", "0", "must be a small non-negative integer")?;

        let fetch_limit: i64 = parse_var("FERRYD_FETCH_LIMIT", "100", "must be a positive integer")?;
        if fetch_limit <= 0 {
            return Err(ConfigError::Invalid(
                "FERRYD_FETCH_LIMIT",
                "must be a positive integer",
            ));
        }

        let chunk_workers: usize =
            parse_var("FERRYD_CHUNK_WORKERS", "4", "must be a positive integer")?;
        if chunk_workers == 0 {
            return Err(ConfigError::Invalid(
                "FERRYD_CHUNK_WORKERS",
                "must be a positive integer",
            ));
        }

        let dispatch_interval = secs_var("FERRYD_DISPATCH_INTERVAL_SECS", "2")?;
        let reconcile_interval = secs_var("FERRYD_RECONCILE_INTERVAL_SECS", "1")?;
        let stall_sweep_interval = secs_var("FERRYD_STALL_SWEEP_INTERVAL_SECS", "30")?;
        let stall_timeout = secs_var("FERRYD_STALL_TIMEOUT_SECS", "360")?;
        let drain_backoff = secs_var("FERRYD_DRAIN_BACKOFF_SECS", "15")?;

        let spool_drain_limit: usize =
            parse_var("FERRYD_SPOOL_DRAIN_LIMIT", "500", "must be a positive integer")?;
        if spool_drain_limit == 0 {
            return Err(ConfigError::Invalid(
                "FERRYD_SPOOL_DRAIN_LIMIT",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            message_dir,
            log_dir,
            credential_dir,
            url_copy_bin,
            infosys,
            host_alias,
            optimize_enabled,
            debug_level,
            fetch_limit,
            chunk_workers,
            dispatch_interval,
            reconcile_interval,
            stall_sweep_interval,
            stall_timeout,
            drain_backoff,
            spool_drain_limit,
        })
    }
}

fn path_var(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    expectation: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, expectation))
}

fn secs_var(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(key, default, "must be a duration in seconds")?;
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
