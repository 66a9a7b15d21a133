use serde::{Deserialize, Serialize};

use crate::DATA_BIT;

/// A contiguous span of sample positions.
///
/// One sample position stands for `sample_rate` physical records, so a range
/// of length `n` is scanned as `n * sample_rate` records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Range {
    pub offset: usize,
    pub length: usize,
}

impl Range {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// One past the last position.
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, position: usize) -> bool {
        position >= self.offset && position < self.end()
    }

    /// The range from the start of `self` to the end of `last`.
    ///
    /// # Panics
    ///
    /// Panics if `last` ends before `self` starts, which only happens with a
    /// corrupt index.
    pub fn span_to(&self, last: &Range) -> Range {
        assert!(
            last.end() >= self.offset,
            "range ends at {} before it starts at {}",
            last.end(),
            self.offset
        );
        Range::new(self.offset, last.end() - self.offset)
    }
}

/// Candidate ranges of one partition, kept sorted and disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    ranges: Vec<Range>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(range: Range) -> Self {
        let mut selection = Self::new();
        selection.insert(range);
        selection
    }

    /// Add a range, merging it with any range it overlaps or touches.
    pub fn insert(&mut self, range: Range) {
        if range.is_empty() {
            return;
        }
        let at = self
            .ranges
            .partition_point(|existing| existing.end() < range.offset);
        let mut merged = range;
        let mut last = at;
        while last < self.ranges.len() && self.ranges[last].offset <= merged.end() {
            let other = self.ranges[last];
            let offset = merged.offset.min(other.offset);
            let end = merged.end().max(other.end());
            merged = Range::new(offset, end - offset);
            last += 1;
        }
        self.ranges.splice(at..last, std::iter::once(merged));
    }

    /// Union with another selection.
    pub fn extend(&mut self, other: &Selection) {
        for range in other.iter() {
            self.insert(*range);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range> {
        self.ranges.iter()
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of sample positions covered.
    pub fn cost(&self) -> usize {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

impl<'a> IntoIterator for &'a Selection {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// One selection slot per partition id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    slots: Vec<Selection>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self {
            slots: vec![Selection::new(); DATA_BIT],
        }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }

    pub fn get(&self, partition: usize) -> &Selection {
        &self.slots[partition]
    }

    pub fn set(&mut self, partition: usize, selection: Selection) {
        self.slots[partition] = selection;
    }

    pub fn get_mut(&mut self, partition: usize) -> &mut Selection {
        &mut self.slots[partition]
    }

    /// Non-empty slots in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Selection)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, selection)| !selection.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Selection::is_empty)
    }

    /// Total sample positions the plan will scan.
    pub fn cost(&self) -> usize {
        self.slots.iter().map(Selection::cost).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_merges_overlapping_and_adjacent_ranges() {
        let mut selection = Selection::new();
        selection.insert(Range::new(10, 5));
        selection.insert(Range::new(30, 5));
        selection.insert(Range::new(0, 2));
        assert_eq!(selection.len(), 3);
        assert_eq!(selection.cost(), 12);

        // touches [10, 15) and overlaps [30, 35)
        selection.insert(Range::new(15, 17));
        assert_eq!(
            selection.ranges(),
            &[Range::new(0, 2), Range::new(10, 25)]
        );
        assert_eq!(selection.cost(), 27);

        selection.insert(Range::new(3, 0));
        assert_eq!(selection.len(), 2);
    }

    #[test]
    fn selection_union_counts_shared_positions_once() {
        let mut a = Selection::single(Range::new(0, 10));
        let b = Selection::single(Range::new(5, 10));
        a.extend(&b);
        assert_eq!(a.ranges(), &[Range::new(0, 15)]);
        assert_eq!(a.cost(), 15);
    }

    #[test]
    fn plan_cost_sums_slots() {
        let mut plan = Plan::new();
        assert!(plan.is_empty());
        plan.set(0, Selection::single(Range::new(0, 4)));
        plan.set(64, Selection::single(Range::new(8, 6)));
        assert_eq!(plan.cost(), 10);
        let used: Vec<usize> = plan.iter().map(|(p, _)| p).collect();
        assert_eq!(used, vec![0, 64]);
        plan.reset();
        assert!(plan.is_empty());
    }

    #[test]
    #[should_panic]
    fn span_panics_when_end_precedes_start() {
        let _ = Range::new(10, 2).span_to(&Range::new(3, 4));
    }
}
