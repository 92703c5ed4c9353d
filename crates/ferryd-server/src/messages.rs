// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message types exchanged through the on-disk spool.
//!
//! url-copy processes report back to the daemon exclusively through these
//! records. The daemon also emits [`StateMessage`] records for external
//! monitoring consumers. All types serialize as JSON, one message per
//! spool file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal or intermediate status reported by a url-copy process.
///
/// A `transfer_status` of `"UPDATE"` is a liveness ping and carries no
/// state change. Anything else names the transfer state the file moved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Job the file belongs to.
    pub job_id: String,
    /// File the status applies to.
    pub file_id: i64,
    /// VO that owns the job.
    pub vo_name: String,
    /// Source storage element.
    pub source_se: String,
    /// Destination storage element.
    pub dest_se: String,
    /// Reported state, or `"UPDATE"` for a liveness ping.
    pub transfer_status: String,
    /// Failure reason or empty on success.
    pub transfer_message: String,
    /// Whether the reporter considers the failure retryable.
    pub retry: bool,
    /// Pid of the reporting url-copy process.
    pub process_id: i32,
    /// When the status was produced.
    pub timestamp: DateTime<Utc>,
    /// Transferred file size in bytes, 0 when unknown.
    pub filesize: i64,
    /// Transfer duration in seconds.
    pub tx_duration: f64,
    /// Achieved throughput in MB/s.
    pub throughput: f64,
}

/// Location of a url-copy transfer log on the reporting host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Job the file belongs to.
    pub job_id: String,
    /// File the log belongs to.
    pub file_id: i64,
    /// Host that holds the log file.
    pub host: String,
    /// Absolute path of the log file.
    pub log_path: String,
    /// Whether the log was produced with debug verbosity.
    pub debug_log: bool,
    /// When the log path was reported.
    pub timestamp: DateTime<Utc>,
}

/// Periodic progress marker from a running url-copy process.
///
/// Doubles as the liveness heartbeat for stall detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    /// Job the file belongs to.
    pub job_id: String,
    /// File being transferred.
    pub file_id: i64,
    /// Pid of the reporting url-copy process.
    pub process_id: i32,
    /// When the marker was produced.
    pub timestamp: DateTime<Utc>,
    /// Instantaneous throughput in MB/s.
    pub throughput: f64,
    /// Bytes transferred so far.
    pub transferred: i64,
}

/// State-transition notification published for monitoring consumers.
///
/// Produced by the daemon, never consumed by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    /// Job the file belongs to.
    pub job_id: String,
    /// File the transition applies to.
    pub file_id: i64,
    /// State the file moved to.
    pub state: String,
    /// VO that owns the job.
    pub vo_name: String,
    /// Source storage element.
    pub source_se: String,
    /// Destination storage element.
    pub dest_se: String,
    /// Retry attempt the file is on.
    pub retry_counter: i32,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // The JSON field names are a contract with the url-copy binary. A
    // rename here breaks deployed reporters, so pin them.
    #[test]
    fn test_status_message_field_names_are_stable() {
        let msg = StatusMessage {
            job_id: "job-1".to_string(),
            file_id: 42,
            vo_name: "atlas".to_string(),
            source_se: "gsiftp://src.example.org".to_string(),
            dest_se: "gsiftp://dst.example.org".to_string(),
            transfer_status: "FINISHED".to_string(),
            transfer_message: String::new(),
            retry: false,
            process_id: 1234,
            timestamp: Utc::now(),
            filesize: 1024,
            tx_duration: 12.5,
            throughput: 81.92,
        };

        let json = serde_json::to_value(&msg).unwrap();
        for field in [
            "job_id",
            "file_id",
            "vo_name",
            "source_se",
            "dest_se",
            "transfer_status",
            "transfer_message",
            "retry",
            "process_id",
            "timestamp",
            "filesize",
            "tx_duration",
            "throughput",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_status_message_parses_reporter_output() {
        let raw = r#"{
            "job_id": "9fb6e1a2-1111-2222-3333-444455556666",
            "file_id": 7,
            "vo_name": "cms",
            "source_se": "gsiftp://a.example.org",
            "dest_se": "gsiftp://b.example.org",
            "transfer_status": "FAILED",
            "transfer_message": "DESTINATION error during TRANSFER_FINALIZATION",
            "retry": true,
            "process_id": 4242,
            "timestamp": "2025-03-14T09:26:53Z",
            "filesize": 0,
            "tx_duration": 0.0,
            "throughput": 0.0
        }"#;

        let msg: StatusMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.file_id, 7);
        assert_eq!(msg.transfer_status, "FAILED");
        assert!(msg.retry);
        assert_eq!(msg.process_id, 4242);
    }

    #[test]
    fn test_progress_message_parses_reporter_output() {
        let raw = r#"{
            "job_id": "job-p",
            "file_id": 3,
            "process_id": 999,
            "timestamp": "2025-03-14T09:26:53Z",
            "throughput": 42.5,
            "transferred": 1048576
        }"#;

        let msg: ProgressMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.transferred, 1048576);
        assert_eq!(msg.process_id, 999);
    }
}
