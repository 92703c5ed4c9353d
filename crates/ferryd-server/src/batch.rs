// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Round-robin interleaving of fetched transfers across VOs.

use std::collections::{BTreeMap, HashMap, VecDeque};

use ferryd_core::TransferFile;

/// A fetched set of candidate transfers, iterated one VO at a time.
///
/// The persistence layer returns candidates grouped per VO. Dispatching
/// them group by group would let a busy VO starve the others within a
/// cycle, so iteration takes one file from each VO in turn. VOs are
/// visited in name order to keep cycles deterministic.
#[derive(Debug)]
pub struct TransferBatch {
    lanes: Vec<VecDeque<TransferFile>>,
    cursor: usize,
}

impl TransferBatch {
    /// Build a batch from the per-VO map returned by the queue fetch.
    pub fn new(by_vo: HashMap<String, Vec<TransferFile>>) -> Self {
        let ordered: BTreeMap<String, Vec<TransferFile>> = by_vo.into_iter().collect();
        let lanes = ordered.into_values().map(VecDeque::from).collect();
        Self { lanes, cursor: 0 }
    }

    /// Number of files left to dispatch.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Whether the batch has been fully consumed.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}

impl Iterator for TransferBatch {
    type Item = TransferFile;

    fn next(&mut self) -> Option<TransferFile> {
        let lanes = self.lanes.len();
        for _ in 0..lanes {
            let lane = &mut self.lanes[self.cursor];
            self.cursor = (self.cursor + 1) % lanes;
            if let Some(file) = lane.pop_front() {
                return Some(file);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for TransferBatch {}

#[cfg(test)]
mod tests {
    use super::*;
    use ferryd_core::persistence::MockPersistence;

    fn file(job: &str, vo: &str) -> TransferFile {
        MockPersistence::sample_file(job, vo, "gsiftp://src.example.org", "gsiftp://dst.example.org")
    }

    #[test]
    fn test_interleaves_vos_round_robin() {
        let mut by_vo = HashMap::new();
        by_vo.insert(
            "atlas".to_string(),
            vec![file("a1", "atlas"), file("a2", "atlas"), file("a3", "atlas")],
        );
        by_vo.insert("cms".to_string(), vec![file("c1", "cms")]);
        by_vo.insert(
            "lhcb".to_string(),
            vec![file("l1", "lhcb"), file("l2", "lhcb")],
        );

        let order: Vec<String> = TransferBatch::new(by_vo).map(|f| f.job_id).collect();

        assert_eq!(order, ["a1", "c1", "l1", "a2", "l2", "a3"]);
    }

    #[test]
    fn test_vo_order_is_deterministic() {
        let build = || {
            let mut by_vo = HashMap::new();
            by_vo.insert("cms".to_string(), vec![file("c1", "cms")]);
            by_vo.insert("atlas".to_string(), vec![file("a1", "atlas")]);
            by_vo.insert("belle".to_string(), vec![file("b1", "belle")]);
            TransferBatch::new(by_vo).map(|f| f.job_id).collect::<Vec<_>>()
        };

        assert_eq!(build(), ["a1", "b1", "c1"]);
        assert_eq!(build(), build());
    }

    #[test]
    fn test_len_tracks_consumption() {
        let mut by_vo = HashMap::new();
        by_vo.insert("atlas".to_string(), vec![file("a1", "atlas"), file("a2", "atlas")]);
        by_vo.insert("cms".to_string(), vec![file("c1", "cms")]);

        let mut batch = TransferBatch::new(by_vo);
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());

        batch.next();
        assert_eq!(batch.len(), 2);

        batch.by_ref().for_each(drop);
        assert_eq!(batch.len(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let mut batch = TransferBatch::new(HashMap::new());
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert!(batch.next().is_none());
    }
}
