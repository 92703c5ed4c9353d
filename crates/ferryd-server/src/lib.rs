// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ferryd Server - Transfer Agent Daemon
//!
//! This crate provides the per-node transfer agent. It admits queued
//! transfer files against the configured concurrency shares, spawns one
//! url-copy subprocess per admitted file and folds the reports those
//! processes drop on the local spool back into the database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              PostgreSQL                                  │
//! │        (Jobs, Files, Link/Share Config, Optimizer History)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │ queues, candidates                          ▲ states, retries,
//!        │                                             │ logs, progress
//!        ▼                                             │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ferryd-server (This Crate)                          │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐  │
//! │  │  Transfer   │──▶│  Transfer   │   │   Status    │   │    Stall    │  │
//! │  │ Dispatcher  │   │  Executor   │   │ Reconciler  │   │   Monitor   │  │
//! │  └─────────────┘   └──────┬──────┘   └──────▲──────┘   └──────┬──────┘  │
//! └───────────────────────────│─────────────────│─────────────────│─────────┘
//!                             │ spawn           │ drain           │ SIGKILL
//!                             ▼                 │                 ▼
//!                   ┌─────────────────┐   ┌─────┴─────────┐   ┌───────────┐
//!                   │   url-copy      │──▶│  Local spool  │◀──│  stalled  │
//!                   │  subprocesses   │   │ (JSON files)  │   │  reports  │
//!                   └─────────────────┘   └───────────────┘   └───────────┘
//! ```
//!
//! # Transfer State Machine
//!
//! ```text
//!                  ┌───────────┐
//!        ┌────────▶│ SUBMITTED │
//!        │         └─────┬─────┘
//!        │               │ admitted
//!   retry│               ▼
//!        │         ┌───────────┐
//!        │         │   READY   │───── spawn failed ──▶ back to SUBMITTED
//!        │         └─────┬─────┘
//!        │               │ spawned
//!        │               ▼
//!        │         ┌───────────┐
//!        └─────────│  ACTIVE   │
//!                  └─────┬─────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ FINISHED │  │  FAILED  │  │ CANCELED │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! Admission denial is not a state change: a denied file simply stays
//! SUBMITTED and is offered again on a later cycle.
//!
//! # Spool Subqueues
//!
//! Copy processes never touch the database. They write JSON files into
//! subdirectories of the message directory, and the reconciler applies
//! them with at-least-once semantics:
//!
//! | Subqueue | Payload | Written by |
//! |----------|---------|------------|
//! | `status` | Terminal states, retries, keep-alives | url-copy, stall monitor |
//! | `logs` | Transfer log file locations | url-copy |
//! | `stalled` | Throughput/progress heartbeats | url-copy |
//! | `monitoring` | Outbound state-change notifications | executor, reconciler |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FERRYD_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `FERRYD_MESSAGE_DIR` | No | `/var/lib/ferryd` | Spool directory shared with copy processes |
//! | `FERRYD_LOG_DIR` | No | `/var/log/ferryd` | Directory copy processes log into |
//! | `FERRYD_CREDENTIAL_DIR` | No | `/tmp` | Directory delegated proxies are read from |
//! | `FERRYD_URL_COPY_BIN` | No | `ferryd-url-copy` | Copy subprocess binary |
//! | `FERRYD_INFOSYS` | No | `lcg-bdii.cern.ch:2170` | BDII endpoint passed to copy processes |
//! | `FERRYD_ALIAS` | No | `$HOSTNAME` | Name this host registers under |
//! | `FERRYD_OPTIMIZE` | No | `true` | Whether to apply tuned protocol parameters |
//! | `FERRYD_DEBUG_LEVEL` | No | `0` | Debug verbosity passed to copy processes |
//! | `FERRYD_FETCH_LIMIT` | No | `100` | Candidates fetched per queue chunk |
//! | `FERRYD_CHUNK_WORKERS` | No | `4` | Concurrent queue chunks per dispatch cycle |
//! | `FERRYD_DISPATCH_INTERVAL_SECS` | No | `2` | Delay between dispatch cycles |
//! | `FERRYD_RECONCILE_INTERVAL_SECS` | No | `1` | Delay between spool scans |
//! | `FERRYD_STALL_SWEEP_INTERVAL_SECS` | No | `30` | Delay between stall sweeps |
//! | `FERRYD_STALL_TIMEOUT_SECS` | No | `360` | Silence before a copy process is killed |
//! | `FERRYD_DRAIN_BACKOFF_SECS` | No | `15` | Delay between cycles while draining |
//! | `FERRYD_SPOOL_DRAIN_LIMIT` | No | `500` | Messages claimed per subqueue per cycle |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`error`]: Error types for server operations
//! - [`messages`]: Wire format of the spool messages
//! - [`spool`]: Claim/ack/release file queue shared with copy processes
//! - [`batch`]: Round-robin interleaving of per-VO candidate lists
//! - [`copy_command`]: url-copy argument list construction
//! - [`credentials`]: Delegated proxy certificate lookup
//! - [`process_registry`]: Liveness tracking of spawned copy processes
//! - [`executor`]: Admission, protocol resolution and subprocess spawn
//! - [`dispatcher`]: Dispatch loop feeding candidates to the executor
//! - [`reconciler`]: Spool consumer applying reports to the database
//! - [`stall_monitor`]: Reaper for copy processes that stopped reporting
//! - [`runtime`]: Embeddable runtime wiring the workers together

#![deny(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types for server operations.
pub mod error;

/// Wire format of the messages exchanged over the spool.
pub mod messages;

/// File-based message queue shared with the copy processes.
pub mod spool;

/// Round-robin interleaving of per-VO candidate lists.
pub mod batch;

/// Argument list construction for the url-copy subprocess.
pub mod copy_command;

/// Delegated proxy certificate lookup.
pub mod credentials;

/// Liveness tracking of spawned copy processes.
pub mod process_registry;

/// Admission, protocol resolution and subprocess spawn for one transfer.
pub mod executor;

/// Dispatch loop feeding candidate transfers to the executor.
pub mod dispatcher;

/// Spool consumer applying copy-process reports to the database.
pub mod reconciler;

/// Reaper for copy processes that stopped reporting progress.
pub mod stall_monitor;

/// Embeddable runtime for ferryd-server.
pub mod runtime;

pub use config::Config;
pub use error::Error;
