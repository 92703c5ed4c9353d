// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Feedback-driven admission controller for unconfigured pairs.
//!
//! Keeps a per-(source, destination) estimate of how many concurrent
//! transfers the pair sustains, nudged up or down by the observed success
//! rate on every scheduling attempt. The estimate lives in process memory
//! only; the durable tuning history stays in the database and reseeds the
//! picture after a restart.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Minimum sample count before the pair leaves the bootstrap regime.
const BOOTSTRAP_SAMPLES: i64 = 10;

/// Bootstrap admissions are capped at this many transfers into one
/// destination.
const BOOTSTRAP_DEST_CAP: i32 = 10;

/// Smoothing factor for the throughput running average.
const EMA_ALPHA: f64 = 0.25;

/// Per-pair feedback state.
#[derive(Debug, Clone)]
struct PairState {
    /// Active-transfer estimate. Intentionally allowed to go negative;
    /// only the admission comparison clamps it.
    stored_active: i32,
    success_rate: f64,
    throughput_ema: f64,
}

impl PairState {
    fn new() -> Self {
        Self {
            stored_active: 0,
            success_rate: 0.0,
            throughput_ema: 0.0,
        }
    }
}

/// In-memory registry of per-pair feedback state.
///
/// `transfer_start` is a read-modify-write in a single lock hold, so two
/// concurrent decisions for the same pair serialize on the estimate. It is
/// not idempotent: every call moves the stored state, and callers invoke it
/// exactly once per scheduling attempt.
pub struct OptimizerRegistry {
    pairs: Mutex<HashMap<(String, String), PairState>>,
}

impl Default for OptimizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether one more transfer may start on the pair.
    ///
    /// `current_active`, `source_active` and `dest_active` are live counts;
    /// `success_rate`, `throughput` and `num_samples` come from the recent
    /// outcome window. The estimate update happens before the decision:
    /// a success rate at or above 90 raises the estimate two above the live
    /// count, an improving rate raises it one above, a degrading rate pulls
    /// it one below.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_start(
        &self,
        source_se: &str,
        dest_se: &str,
        current_active: i32,
        source_active: i32,
        dest_active: i32,
        success_rate: f64,
        throughput: f64,
        num_samples: i64,
    ) -> bool {
        let mut pairs = self
            .pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = pairs
            .entry((source_se.to_string(), dest_se.to_string()))
            .or_insert_with(PairState::new);

        if success_rate >= 90.0 {
            state.stored_active = current_active + 2;
        } else if success_rate > state.success_rate {
            state.stored_active = current_active + 1;
        } else {
            state.stored_active = current_active - 1;
        }
        state.success_rate = success_rate;
        state.throughput_ema = if state.throughput_ema == 0.0 {
            throughput
        } else {
            (1.0 - EMA_ALPHA) * state.throughput_ema + EMA_ALPHA * throughput
        };

        if source_active == 0 && dest_active == 0 {
            // Nothing moves on either endpoint; probing is always worth it.
            return true;
        }
        if num_samples < BOOTSTRAP_SAMPLES {
            return dest_active < BOOTSTRAP_DEST_CAP;
        }
        current_active <= state.stored_active.max(1)
    }

    /// Current stored estimate for a pair, if one exists. Used for
    /// decision tracing.
    pub fn stored_estimate(&self, source_se: &str, dest_se: &str) -> Option<i32> {
        let pairs = self
            .pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pairs
            .get(&(source_se.to_string(), dest_se.to_string()))
            .map(|s| s.stored_active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "gsiftp://source.example.org";
    const DST: &str = "gsiftp://dest.example.org";

    #[test]
    fn test_cold_start_always_allowed() {
        let registry = OptimizerRegistry::new();
        // Terrible history, but both endpoints idle
        assert!(registry.transfer_start(SRC, DST, 0, 0, 0, 0.0, 0.0, 500));
    }

    #[test]
    fn test_bootstrap_allows_until_dest_cap() {
        let registry = OptimizerRegistry::new();
        assert!(registry.transfer_start(SRC, DST, 3, 1, 9, 50.0, 10.0, 5));
        assert!(!registry.transfer_start(SRC, DST, 3, 1, 10, 50.0, 10.0, 5));
    }

    #[test]
    fn test_high_success_rate_raises_estimate() {
        let registry = OptimizerRegistry::new();
        registry.transfer_start(SRC, DST, 5, 2, 3, 95.0, 40.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(7));
        // While the rate holds at 90+ the estimate tracks ahead of the
        // live count, so admission keeps going
        assert!(registry.transfer_start(SRC, DST, 7, 2, 3, 95.0, 40.0, 20));
        // Once the rate collapses the estimate falls below the live count
        assert!(!registry.transfer_start(SRC, DST, 10, 2, 3, 50.0, 40.0, 20));
    }

    #[test]
    fn test_improving_rate_raises_by_one() {
        let registry = OptimizerRegistry::new();
        // First call: 60 > 0.0 counts as improving
        registry.transfer_start(SRC, DST, 4, 1, 1, 60.0, 20.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(5));
    }

    #[test]
    fn test_degrading_rate_lowers_estimate() {
        let registry = OptimizerRegistry::new();
        registry.transfer_start(SRC, DST, 4, 1, 1, 80.0, 20.0, 20);
        // 70 < 80: degrading, estimate drops below the live count
        registry.transfer_start(SRC, DST, 4, 1, 1, 70.0, 20.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(3));
    }

    #[test]
    fn test_stored_estimate_goes_negative_and_recovers_slowly() {
        let registry = OptimizerRegistry::new();
        // Degrading with nothing running drives the raw estimate negative
        registry.transfer_start(SRC, DST, 0, 1, 1, 50.0, 5.0, 20);
        registry.transfer_start(SRC, DST, 0, 1, 1, 40.0, 5.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(-1));

        // The comparison clamps to one, so a single probe still gets through
        assert!(registry.transfer_start(SRC, DST, 1, 1, 1, 30.0, 5.0, 20));
        // A second concurrent transfer does not
        assert!(!registry.transfer_start(SRC, DST, 2, 1, 1, 20.0, 5.0, 20));
    }

    #[test]
    fn test_repeated_identical_calls_are_not_idempotent() {
        let registry = OptimizerRegistry::new();
        registry.transfer_start(SRC, DST, 4, 1, 1, 60.0, 20.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(5));
        // Same inputs again: 60 is no longer an improvement over 60
        registry.transfer_start(SRC, DST, 4, 1, 1, 60.0, 20.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(3));
    }

    #[test]
    fn test_pairs_are_independent() {
        let registry = OptimizerRegistry::new();
        registry.transfer_start(SRC, DST, 5, 1, 1, 95.0, 40.0, 20);
        // A zero rate on a fresh pair is degrading
        registry.transfer_start(SRC, "gsiftp://other.example.org", 2, 1, 1, 0.0, 1.0, 20);
        assert_eq!(registry.stored_estimate(SRC, DST), Some(7));
        assert_eq!(
            registry.stored_estimate(SRC, "gsiftp://other.example.org"),
            Some(1)
        );
    }
}
