// =============================================================================
// Matrixon Matrix NextServer - Sliding Window Diff Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Turns the window a connection last acknowledged plus the fresh ordering
//   of its list into the list operations the client replays. Pure: tracked
//   state is only replaced by the window tracker after a response is built.
//
// =============================================================================

use crate::{
    service::sync::tracker::WindowState,
    types::{ItemId, Operation, Range, WindowList},
};

/// When an incremental update is not worth sending position by position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DensityThreshold {
    percent: u8,
}

impl DensityThreshold {
    /// `percent` is clamped to 100, which never collapses.
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
        }
    }

    /// True when `changed` positions out of `range` warrant one SYNC instead.
    pub fn should_collapse(&self, changed: usize, range: &Range) -> bool {
        changed as u128 * 100 > u128::from(self.percent) * range.width()
    }
}

impl Default for DensityThreshold {
    fn default() -> Self {
        Self::new(50)
    }
}

/// Compute the operations for one list.
///
/// `new_ordering` returns the ids currently at the positions of a range, as
/// a prefix of the range (shorter when the collection ends inside it).
/// `requested` must already be normalized.
pub fn diff<F>(
    previous: Option<&WindowState>,
    requested: &[Range],
    mut new_ordering: F,
    new_count: u64,
    threshold: DensityThreshold,
) -> WindowList
where
    F: FnMut(Range) -> Vec<ItemId>,
{
    let ops = match previous {
        Some(previous) if previous.ranges().eq(requested.iter().copied()) => {
            incremental_ops(previous, &mut new_ordering, threshold)
        }
        _ => full_ops(previous, requested, &mut new_ordering),
    };

    WindowList {
        count: new_count,
        ops,
    }
}

/// First sync or changed ranges: invalidate what was dropped, SYNC what is asked.
fn full_ops<F>(previous: Option<&WindowState>, requested: &[Range], new_ordering: &mut F) -> Vec<Operation>
where
    F: FnMut(Range) -> Vec<ItemId>,
{
    let mut ops = Vec::new();

    if let Some(previous) = previous {
        ops.extend(
            previous
                .ranges()
                .filter(|range| !requested.contains(range))
                .map(|range| Operation::Invalidate { range }),
        );
    }

    ops.extend(requested.iter().map(|&range| Operation::Sync {
        range,
        item_ids: clip(new_ordering(range), &range),
    }));

    ops
}

/// Same ranges as last time: position-by-position comparison.
fn incremental_ops<F>(previous: &WindowState, new_ordering: &mut F, threshold: DensityThreshold) -> Vec<Operation>
where
    F: FnMut(Range) -> Vec<ItemId>,
{
    let mut syncs = Vec::new();
    let mut deletes = Vec::new();
    let mut inserts = Vec::new();

    for slots in previous.slots() {
        let range = slots.range;
        let fresh = clip(new_ordering(range), &range);

        let mut removed = Vec::new();
        let mut added = Vec::new();
        let width = slots.ids.len().max(fresh.len());
        for offset in 0..width {
            let old = slots.ids.get(offset);
            let new = fresh.get(offset);
            if old == new {
                continue;
            }
            let index = range.start + offset as u64;
            if old.is_some() {
                removed.push(index);
            }
            if let Some(id) = new {
                added.push((index, id.clone()));
            }
        }

        let changed = removed.len().max(added.len());
        if changed == 0 {
            continue;
        }
        if threshold.should_collapse(changed, &range) {
            syncs.push(Operation::Sync {
                range,
                item_ids: fresh,
            });
            continue;
        }

        deletes.extend(removed);
        inserts.extend(added);
    }

    // Deletes high-to-low keep pending indices stable; inserts low-to-high
    // land before anything they would displace.
    deletes.sort_unstable_by(|a, b| b.cmp(a));
    inserts.sort_unstable_by_key(|(index, _)| *index);

    syncs
        .into_iter()
        .chain(deletes.into_iter().map(|index| Operation::Delete { index }))
        .chain(
            inserts
                .into_iter()
                .map(|(index, item_id)| Operation::Insert { index, item_id }),
        )
        .collect()
}

fn clip(mut ids: Vec<ItemId>, range: &Range) -> Vec<ItemId> {
    let max = usize::try_from(range.len()).unwrap_or(usize::MAX);
    ids.truncate(max);
    ids
}

#[cfg(test)]
pub(crate) mod replay {
    //! Client-side replay of list operations, used to check diffs.

    use std::collections::BTreeMap;

    use crate::types::{ItemId, Operation, Range};

    /// Sparse client copy of one list, confined to its requested ranges
    #[derive(Debug, Default, Clone)]
    pub struct ClientList {
        pub ranges: Vec<Range>,
        pub slots: BTreeMap<u64, ItemId>,
    }

    impl ClientList {
        pub fn apply(&mut self, ops: &[Operation]) {
            for op in ops {
                match op {
                    Operation::Sync { range, item_ids } => {
                        self.clear(range);
                        for (offset, id) in item_ids.iter().enumerate() {
                            self.slots.insert(range.start + offset as u64, id.clone());
                        }
                    }
                    Operation::Invalidate { range } => self.clear(range),
                    Operation::Delete { index } => {
                        let range = self.range_of(*index);
                        self.slots.remove(index);
                        for position in (*index + 1)..=range.end {
                            if let Some(id) = self.slots.remove(&position) {
                                self.slots.insert(position - 1, id);
                            }
                        }
                    }
                    Operation::Insert { index, item_id } => {
                        let range = self.range_of(*index);
                        let right_gap = (*index..=range.end).find(|p| !self.slots.contains_key(p));
                        let left_gap = (range.start..*index).rev().find(|p| !self.slots.contains_key(p));
                        match (right_gap, left_gap) {
                            (Some(gap), _) => self.shift_right(*index, gap),
                            (None, Some(gap)) => self.shift_left(gap, *index),
                            (None, None) => {
                                self.slots.remove(&range.end);
                                self.shift_right(*index, range.end);
                            }
                        }
                        self.slots.insert(*index, item_id.clone());
                    }
                }
            }
        }

        /// Ids at the positions of `range`, `None` where unknown.
        pub fn window(&self, range: &Range) -> Vec<Option<ItemId>> {
            range.positions().map(|p| self.slots.get(&p).cloned()).collect()
        }

        fn clear(&mut self, range: &Range) {
            for position in range.positions() {
                self.slots.remove(&position);
            }
        }

        fn range_of(&self, index: u64) -> Range {
            self.ranges
                .iter()
                .copied()
                .find(|r| r.contains(index))
                .unwrap_or_else(|| panic!("operation at {index} outside tracked ranges"))
        }

        // Move [from, gap) one slot right, leaving `from` empty.
        fn shift_right(&mut self, from: u64, gap: u64) {
            for position in (from..gap).rev() {
                if let Some(id) = self.slots.remove(&position) {
                    self.slots.insert(position + 1, id);
                }
            }
        }

        // Move (gap, to] one slot left, leaving `to` empty.
        fn shift_left(&mut self, gap: u64, to: u64) {
            for position in (gap + 1)..=to {
                if let Some(id) = self.slots.remove(&position) {
                    self.slots.insert(position - 1, id);
                }
            }
        }
    }
}
