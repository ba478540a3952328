//! Cost-based ordering of host-stage work.
//!
//! Largest images are scheduled first so a big sample does not end up as a
//! lone straggler after the pool has drained the small ones. The order only
//! affects when a slot's task starts; output slot identity never changes.

use std::cmp::Reverse;

use crate::metadata::DecodeInfo;

/// One scheduled slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub cost: u64,
    pub slot: usize,
}

/// Slot indices by descending cost, ties by ascending index.
pub fn order_by_cost(costs: &[u64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..costs.len()).collect();
    // Stable sort keeps equal-cost slots in index order.
    order.sort_by_key(|&slot| Reverse(costs[slot]));
    order
}

/// Execution order for a batch, using pixel volume as the cost.
pub fn schedule(infos: &[DecodeInfo]) -> Vec<ScheduleEntry> {
    let costs: Vec<u64> = infos.iter().map(DecodeInfo::cost).collect();
    order_by_cost(&costs)
        .into_iter()
        .map(|slot| ScheduleEntry {
            cost: costs[slot],
            slot,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_common::Resolution;

    #[test]
    fn descending_with_stable_ties() {
        assert_eq!(order_by_cost(&[10, 5, 5, 20]), vec![3, 0, 1, 2]);
    }

    #[test]
    fn all_equal_keeps_index_order() {
        assert_eq!(order_by_cost(&[7; 5]), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_batch() {
        assert!(order_by_cost(&[]).is_empty());
        assert!(schedule(&[]).is_empty());
    }

    #[test]
    fn schedule_uses_pixel_volume() {
        let infos: Vec<DecodeInfo> = [(100, 100), (50, 50), (200, 200), (10, 10)]
            .into_iter()
            .map(|(w, h)| DecodeInfo {
                resolution: Resolution::new(w, h),
                ..DecodeInfo::default()
            })
            .collect();
        let entries = schedule(&infos);
        let slots: Vec<usize> = entries.iter().map(|e| e.slot).collect();
        assert_eq!(slots, vec![2, 0, 1, 3]);
        assert_eq!(entries[0].cost, 40_000);
        assert_eq!(entries[3].cost, 100);
    }
}
