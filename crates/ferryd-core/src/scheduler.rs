// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control for queued transfers.
//!
//! A transfer may start only when every configured scope that applies to it
//! still has credit: the share on the exact pair, the VO's standalone
//! shares, the public pool, and per-SE inbound/outbound caps. Scopes with
//! no configuration contribute no constraint. A pair with no configuration
//! at all falls through to the feedback controller, or to a flat per-SE
//! cap when auto-optimization is disabled.
//!
//! Decisions are pure: a denied file simply stays queued and is evaluated
//! again from scratch on a later cycle.

use std::sync::Arc;

use tracing::debug;

use crate::error::CoreError;
use crate::optimizer::OptimizerRegistry;
use crate::persistence::{ANY, PUBLIC_VO, Persistence, ShareConfig, TransferFile, WILDCARD};
use crate::protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_NOSTREAMS, DEFAULT_TIMEOUT};

/// Flat per-SE concurrency cap applied to unconfigured pairs when
/// auto-optimization is disabled.
const DEFAULT_SE_LIMIT: i64 = 50;

/// Outcome of one scheduling attempt.
#[derive(Debug)]
pub struct ScheduleOutcome {
    /// Whether the transfer may start now.
    pub allowed: bool,
    /// The share rows assigned to the transfer, most specific first.
    /// Also the input for protocol resolution.
    pub shares: Vec<ShareConfig>,
}

/// A share-configuration candidate and the transfer sides it covers.
struct Candidate {
    source: String,
    destination: String,
    covers_source: bool,
    covers_dest: bool,
}

impl Candidate {
    fn pair(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            covers_source: true,
            covers_dest: true,
        }
    }

    fn source_side(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            covers_source: true,
            covers_dest: false,
        }
    }

    fn dest_side(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            covers_source: false,
            covers_dest: true,
        }
    }
}

/// Decides whether queued transfers may start.
pub struct TransferScheduler {
    db: Arc<dyn Persistence>,
    optimizer: Arc<OptimizerRegistry>,
    optimize_enabled: bool,
}

impl TransferScheduler {
    /// Create a scheduler.
    pub fn new(
        db: Arc<dyn Persistence>,
        optimizer: Arc<OptimizerRegistry>,
        optimize_enabled: bool,
    ) -> Self {
        Self {
            db,
            optimizer,
            optimize_enabled,
        }
    }

    /// Decide whether `file` may start now.
    pub async fn schedule(&self, file: &TransferFile) -> Result<ScheduleOutcome, CoreError> {
        let shares = self.assign_shares(file).await?;

        if !self.se_limits_allow(file).await? {
            return Ok(ScheduleOutcome {
                allowed: false,
                shares,
            });
        }

        if shares.is_empty() {
            let allowed = if self.optimize_enabled {
                self.optimizer_allows(file).await?
            } else {
                self.default_cap_allows(file).await?
            };
            return Ok(ScheduleOutcome { allowed, shares });
        }

        for share in &shares {
            let limit = i64::from(share.active);
            let in_use = self.credits_in_use(file, share).await?;
            if limit - in_use <= 0 {
                debug!(
                    file_id = file.file_id,
                    source = %share.source,
                    destination = %share.destination,
                    vo = %share.vo,
                    limit,
                    in_use,
                    "transfer denied, share exhausted"
                );
                return Ok(ScheduleOutcome {
                    allowed: false,
                    shares,
                });
            }
        }

        Ok(ScheduleOutcome {
            allowed: true,
            shares,
        })
    }

    /// Collect the share rows that govern this transfer.
    ///
    /// Candidates are walked from most to least specific, each covering the
    /// source side, the destination side, or both. A candidate applies only
    /// when its link row exists and is not switched off, and when a share
    /// row (the VO's own, else the public one) exists for it. A candidate
    /// with no share row leaves its sides open for less specific rows.
    async fn assign_shares(&self, file: &TransferFile) -> Result<Vec<ShareConfig>, CoreError> {
        let mut candidates = vec![
            Candidate::pair(&file.source_se, &file.dest_se),
            Candidate::source_side(&file.source_se, ANY),
            Candidate::source_side(WILDCARD, ANY),
            Candidate::dest_side(ANY, &file.dest_se),
            Candidate::dest_side(ANY, WILDCARD),
        ];

        let source_group = self.db.get_group_for_se(&file.source_se).await?;
        let dest_group = self.db.get_group_for_se(&file.dest_se).await?;
        if let (Some(sg), Some(dg)) = (&source_group, &dest_group) {
            candidates.push(Candidate::pair(sg, dg));
        }
        if let Some(sg) = &source_group {
            candidates.push(Candidate::source_side(sg, ANY));
        }
        if let Some(dg) = &dest_group {
            candidates.push(Candidate::dest_side(ANY, dg));
        }

        let mut shares = Vec::new();
        let mut source_covered = false;
        let mut dest_covered = false;

        for candidate in candidates {
            let wanted = (candidate.covers_source && !source_covered)
                || (candidate.covers_dest && !dest_covered);
            if !wanted {
                continue;
            }

            let Some(link) = self
                .db
                .get_link_config(&candidate.source, &candidate.destination)
                .await?
            else {
                continue;
            };
            if link.state == "off" {
                continue;
            }

            let share = match self
                .db
                .get_share_config(&candidate.source, &candidate.destination, &file.vo_name)
                .await?
            {
                Some(share) => Some(share),
                None => {
                    self.db
                        .get_share_config(&candidate.source, &candidate.destination, PUBLIC_VO)
                        .await?
                }
            };
            let Some(share) = share else {
                continue;
            };

            source_covered |= candidate.covers_source;
            dest_covered |= candidate.covers_dest;
            shares.push(share);

            if source_covered && dest_covered {
                break;
            }
        }

        Ok(shares)
    }

    /// Live credits consumed in the scope a share row describes.
    ///
    /// The row's names give the scope shape (pair, outbound, inbound); the
    /// counts themselves run against the transfer's endpoints. Public rows
    /// count only traffic of VOs without a dedicated share on the row.
    async fn credits_in_use(
        &self,
        file: &TransferFile,
        share: &ShareConfig,
    ) -> Result<i64, CoreError> {
        let public = share.vo == PUBLIC_VO;
        let dedicated = if public {
            self.db
                .vos_with_dedicated_share(&share.source, &share.destination)
                .await?
        } else {
            Vec::new()
        };

        if share.source == WILDCARD || share.destination == ANY {
            if public {
                self.db
                    .count_active_from_source_public(&file.source_se, &dedicated)
                    .await
            } else {
                self.db
                    .count_active_from_source_for_vo(&file.source_se, &share.vo)
                    .await
            }
        } else if share.destination == WILDCARD || share.source == ANY {
            if public {
                self.db
                    .count_active_to_dest_public(&file.dest_se, &dedicated)
                    .await
            } else {
                self.db
                    .count_active_to_dest_for_vo(&file.dest_se, &share.vo)
                    .await
            }
        } else if public {
            self.db
                .count_active_on_pair_public(&file.source_se, &file.dest_se, &dedicated)
                .await
        } else {
            self.db
                .count_active_on_pair_for_vo(&file.source_se, &file.dest_se, &share.vo)
                .await
        }
    }

    /// Per-SE inbound/outbound caps; unset caps are skipped.
    async fn se_limits_allow(&self, file: &TransferFile) -> Result<bool, CoreError> {
        if let Some(limits) = self.db.get_se_limits(&file.source_se).await?
            && let Some(max) = limits.outbound_max_active
        {
            let in_use = self.db.count_active_from_source(&file.source_se).await?;
            if in_use >= i64::from(max) {
                debug!(
                    file_id = file.file_id,
                    se = %file.source_se,
                    max,
                    in_use,
                    "transfer denied, source SE outbound cap reached"
                );
                return Ok(false);
            }
        }
        if let Some(limits) = self.db.get_se_limits(&file.dest_se).await?
            && let Some(max) = limits.inbound_max_active
        {
            let in_use = self.db.count_active_to_dest(&file.dest_se).await?;
            if in_use >= i64::from(max) {
                debug!(
                    file_id = file.file_id,
                    se = %file.dest_se,
                    max,
                    in_use,
                    "transfer denied, destination SE inbound cap reached"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Feedback-controller path for pairs with no configuration.
    async fn optimizer_allows(&self, file: &TransferFile) -> Result<bool, CoreError> {
        self.db
            .init_optimizer(
                &file.source_se,
                &file.dest_se,
                DEFAULT_NOSTREAMS,
                DEFAULT_TIMEOUT,
                DEFAULT_BUFFER_SIZE,
            )
            .await?;
        let snapshot = self
            .db
            .fetch_optimization_config(&file.source_se, &file.dest_se)
            .await?;
        let current_active = self
            .db
            .count_active_on_pair(&file.source_se, &file.dest_se)
            .await?;
        let source_active = self.db.count_active_from_source(&file.source_se).await?;
        let dest_active = self.db.count_active_to_dest(&file.dest_se).await?;

        let allowed = self.optimizer.transfer_start(
            &file.source_se,
            &file.dest_se,
            current_active as i32,
            source_active as i32,
            dest_active as i32,
            snapshot.success_rate,
            snapshot.throughput,
            snapshot.num_samples,
        );
        debug!(
            file_id = file.file_id,
            current_active,
            source_active,
            dest_active,
            success_rate = snapshot.success_rate,
            samples = snapshot.num_samples,
            estimate = ?self.optimizer.stored_estimate(&file.source_se, &file.dest_se),
            allowed,
            "optimizer decision"
        );
        Ok(allowed)
    }

    /// Flat cap on both endpoints when auto-optimization is off.
    async fn default_cap_allows(&self, file: &TransferFile) -> Result<bool, CoreError> {
        let outbound = self.db.count_active_from_source(&file.source_se).await?;
        if outbound >= DEFAULT_SE_LIMIT {
            return Ok(false);
        }
        let inbound = self.db.count_active_to_dest(&file.dest_se).await?;
        Ok(inbound < DEFAULT_SE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LinkConfig, MockPersistence, SeLimits};

    const SRC: &str = "gsiftp://disk.cern.ch";
    const DST: &str = "gsiftp://tape.rl.ac.uk";

    fn scheduler(mock: Arc<MockPersistence>, optimize: bool) -> TransferScheduler {
        TransferScheduler::new(mock, Arc::new(OptimizerRegistry::new()), optimize)
    }

    fn link(source: &str, destination: &str) -> LinkConfig {
        LinkConfig {
            source: source.to_string(),
            destination: destination.to_string(),
            symbolic_name: format!("{source}-{destination}"),
            state: "on".to_string(),
            nostreams: 4,
            tcp_buffer_size: 0,
            urlcopy_timeout: 3600,
            auto_tuning: "off".to_string(),
        }
    }

    fn share(source: &str, destination: &str, vo: &str, active: i32) -> ShareConfig {
        ShareConfig {
            source: source.to_string(),
            destination: destination.to_string(),
            vo: vo.to_string(),
            active,
        }
    }

    async fn seed_active(mock: &MockPersistence, job: &str, vo: &str, n: usize) {
        for _ in 0..n {
            let mut file = MockPersistence::sample_file(job, vo, SRC, DST);
            file.file_state = "ACTIVE".to_string();
            mock.add_file(file).await;
        }
    }

    fn queued_file() -> TransferFile {
        MockPersistence::sample_file("job-queued", "atlas", SRC, DST)
    }

    #[tokio::test]
    async fn test_pair_share_denies_when_exhausted() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 5)).await;
        mock.add_job("job-a", 0).await;
        seed_active(&mock, "job-a", "atlas", 4).await;

        let sched = scheduler(mock.clone(), true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.shares.len(), 1);

        seed_active(&mock, "job-a", "atlas", 1).await;
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_share_denies_despite_se_credit() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 0)).await;
        // Both endpoints have plenty of headroom; the pair limit still wins
        mock.add_se_limits(SeLimits {
            se: SRC.to_string(),
            inbound_max_active: None,
            outbound_max_active: Some(100),
        })
        .await;

        let sched = scheduler(mock, true);
        // Denied, but still a plain denial the caller can retry later
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.shares.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_share_row_falls_through_to_optimizer() {
        let mock = Arc::new(MockPersistence::new());
        // Link exists but carries no share rows at all
        mock.add_link_config(link(SRC, DST)).await;

        let sched = scheduler(mock, true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        // Cold start on an idle pair is admitted by the feedback controller
        assert!(outcome.allowed);
        assert!(outcome.shares.is_empty());
    }

    #[tokio::test]
    async fn test_public_share_pool_excludes_dedicated_vos() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 10)).await;
        mock.add_share_config(share(SRC, DST, PUBLIC_VO, 2)).await;
        mock.add_job("job-a", 0).await;
        mock.add_job("job-d", 0).await;
        // atlas traffic burns its own share, not the public pool
        seed_active(&mock, "job-a", "atlas", 4).await;
        seed_active(&mock, "job-d", "dteam", 1).await;

        let sched = scheduler(mock.clone(), true);
        let dteam_file = MockPersistence::sample_file("job-queued", "dteam", SRC, DST);
        let outcome = sched.schedule(&dteam_file).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.shares[0].vo, PUBLIC_VO);

        seed_active(&mock, "job-d", "ops", 1).await;
        let outcome = sched.schedule(&dteam_file).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_se_outbound_cap_blocks_despite_share_credit() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 100)).await;
        mock.add_se_limits(SeLimits {
            se: SRC.to_string(),
            inbound_max_active: None,
            outbound_max_active: Some(2),
        })
        .await;
        mock.add_job("job-a", 0).await;
        seed_active(&mock, "job-a", "atlas", 2).await;

        let sched = scheduler(mock, true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_all_scopes_must_agree() {
        let mock = Arc::new(MockPersistence::new());
        // Generous standalone VO share, tight pair share
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_link_config(link(SRC, ANY)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 1)).await;
        mock.add_share_config(share(SRC, ANY, "atlas", 10)).await;
        mock.add_job("job-a", 0).await;
        seed_active(&mock, "job-a", "atlas", 1).await;

        let sched = scheduler(mock, true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_assignment_stops_once_both_sides_covered() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_link_config(link(SRC, DST)).await;
        mock.add_link_config(link(SRC, ANY)).await;
        mock.add_link_config(link(ANY, DST)).await;
        mock.add_share_config(share(SRC, DST, "atlas", 5)).await;
        mock.add_share_config(share(SRC, ANY, "atlas", 5)).await;
        mock.add_share_config(share(ANY, DST, "atlas", 5)).await;

        let sched = scheduler(mock, true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        // The pair row covers both sides; nothing else is assigned
        assert_eq!(outcome.shares.len(), 1);
        assert_eq!(outcome.shares[0].source, SRC);
        assert_eq!(outcome.shares[0].destination, DST);
    }

    #[tokio::test]
    async fn test_link_switched_off_disables_its_share() {
        let mock = Arc::new(MockPersistence::new());
        let mut off = link(SRC, DST);
        off.state = "off".to_string();
        mock.add_link_config(off).await;
        mock.add_share_config(share(SRC, DST, "atlas", 5)).await;

        let sched = scheduler(mock, true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        // The off link hides the share; the pair is effectively unconfigured
        assert!(outcome.shares.is_empty());
        assert!(outcome.allowed);
    }

    #[tokio::test]
    async fn test_group_shares_cover_member_ses() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_group_member(SRC, "CERN-DISK").await;
        mock.add_group_member(DST, "RAL-TAPE").await;
        mock.add_link_config(link("CERN-DISK", "RAL-TAPE")).await;
        mock.add_share_config(share("CERN-DISK", "RAL-TAPE", "atlas", 3)).await;
        mock.add_job("job-a", 0).await;
        seed_active(&mock, "job-a", "atlas", 2).await;

        let sched = scheduler(mock.clone(), true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.shares[0].source, "CERN-DISK");

        seed_active(&mock, "job-a", "atlas", 1).await;
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_optimizer_bootstrap_caps_destination() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_job("job-a", 0).await;
        // Nine transfers inbound: bootstrap still admits
        seed_active(&mock, "job-a", "atlas", 9).await;

        let sched = scheduler(mock.clone(), true);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(outcome.allowed);

        // Tenth active transfer saturates the bootstrap cap
        seed_active(&mock, "job-a", "atlas", 1).await;
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_default_cap_when_optimization_disabled() {
        let mock = Arc::new(MockPersistence::new());
        mock.add_job("job-a", 0).await;
        seed_active(&mock, "job-a", "atlas", 49).await;

        let sched = scheduler(mock.clone(), false);
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(outcome.allowed);

        seed_active(&mock, "job-a", "atlas", 1).await;
        let outcome = sched.schedule(&queued_file()).await.unwrap();
        assert!(!outcome.allowed);
    }
}
