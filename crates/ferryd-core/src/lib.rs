// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ferryd Core - Transfer Scheduling Engine
//!
//! This crate provides the decision layer of the ferryd transfer agent:
//! admission control over configured shares, feedback-driven auto-tuning for
//! unconfigured pairs, and protocol parameter resolution. All durable state
//! lives in PostgreSQL; concurrent agent nodes coordinate only through it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ferryd-server                                   │
//! │      (Dispatcher, Executor, Status Reconciler, Stall Monitor)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                    │                         │
//!           │ schedule()         │ resolve()               │ status writes
//!           ▼                    ▼                         ▼
//! ┌───────────────────┐ ┌───────────────────┐ ┌───────────────────────────┐
//! │ TransferScheduler │ │ ProtocolResolver  │ │     Persistence trait     │
//! │  (This Crate)     │ │  (This Crate)     │ │  (PostgresPersistence)    │
//! │  share credits    │ │  link specificity │ │  files/jobs/config/       │
//! │  SE caps          │ │  auto substitution│ │  optimizer history        │
//! └─────────┬─────────┘ └─────────┬─────────┘ └─────────────┬─────────────┘
//!           │                     │                         │
//!           │ fallback            │ tuned values            │
//!           ▼                     ▼                         ▼
//! ┌───────────────────────────────────────┐ ┌───────────────────────────┐
//! │          OptimizerRegistry            │ │        PostgreSQL         │
//! │   (per-pair feedback, in-process)     │ │     (Durable Storage)     │
//! └───────────────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! # Transfer State Machine
//!
//! ```text
//!      ┌───────────┐
//!      │ SUBMITTED │◄─────────────┐
//!      └─────┬─────┘              │
//!            │ admitted           │ spawn failed /
//!            ▼                    │ retry granted
//!      ┌───────────┐              │
//!      │   READY   │──────────────┤
//!      └─────┬─────┘              │
//!            │ spawned            │
//!            ▼                    │
//!      ┌───────────┐              │
//!      │  ACTIVE   │──────────────┘
//!      └─────┬─────┘
//!            │ terminal status message
//!            ▼
//!  ┌──────────┐ ┌────────┐ ┌──────────┐
//!  │ FINISHED │ │ FAILED │ │ CANCELED │
//!  └──────────┘ └────────┘ └──────────┘
//! ```
//!
//! READY and ACTIVE files both hold scheduling credit; a denied file simply
//! stays SUBMITTED and is re-evaluated on a later cycle. Terminal states are
//! written exactly once even under redelivered status messages.
//!
//! # Scheduling Scopes
//!
//! | Scope | Configured by | Counted against |
//! |-------|---------------|-----------------|
//! | Pair share | `share_config` (source, destination, vo) | active on the pair for the VO |
//! | Standalone share | `share_config` with `*` on one side | outbound/inbound for the VO |
//! | Public share | `share_config` vo = `public` | traffic of VOs without a dedicated share |
//! | SE caps | `se_limits` inbound/outbound | all traffic touching the SE |
//! | Unconfigured pair | none | feedback controller estimate |
//!
//! Every configured scope must have free credit (logical AND). Scopes with
//! no configuration are skipped, never treated as zero.
//!
//! # Modules
//!
//! - [`error`]: Error types with stable error codes and transience classification
//! - [`migrations`]: Embedded PostgreSQL schema migrations
//! - [`optimizer`]: Per-pair feedback controller for unconfigured pairs
//! - [`persistence`]: Persistence contract, record types, Postgres and mock backends
//! - [`protocol`]: Protocol parameter resolution and submitter overrides
//! - [`scheduler`]: Admission control across shares, SE caps and the optimizer

#![deny(missing_docs)]

/// Error types for scheduling and persistence operations.
pub mod error;

/// Embedded database schema migrations.
pub mod migrations;

/// Feedback-driven admission for pairs without explicit configuration.
pub mod optimizer;

/// Persistence contract, record types and backends.
pub mod persistence;

/// Protocol parameter resolution by link specificity.
pub mod protocol;

/// Admission control over configured shares and SE caps.
pub mod scheduler;

pub use error::{CoreError, Result};
pub use optimizer::OptimizerRegistry;
pub use persistence::{Persistence, PostgresPersistence, TransferFile, TransferState};
pub use protocol::{ProtocolResolver, ResolvedProtocol, UserProtocol};
pub use scheduler::{ScheduleOutcome, TransferScheduler};
