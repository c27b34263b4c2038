//! A subsampled index→offset map for the journal.
//!
//! A full index-to-offset map is too large to keep resident for long logs, so the journal
//! retains only a configurable fraction of the mappings. Lookups return the nearest retained
//! position at or below the requested index; the caller scans forward from there. This trades
//! bounded memory (O(log-length × density)) against a bounded forward scan (≤ 1/density
//! entries), with the trade-off exposed as a constructor parameter.

/// A journal lookup hint: a log index and the byte offset of its frame within the segment
/// holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// The log index of the entry.
    pub index: u64,
    /// The byte offset of the entry's frame within its segment file.
    pub offset: u64,
}

impl Position {
    pub fn new(index: u64, offset: u64) -> Self {
        Self { index, offset }
    }
}

/// A sparse `index → Position` mapping retaining roughly `density` of all indexed entries.
///
/// With density `d`, every `round(1/d)`-th index is retained. An index skipped at insertion
/// time is never retained later: positions are only appended in increasing index order.
#[derive(Debug)]
pub struct SparseIndex {
    /// Retain every `every`-th index.
    every: u64,
    /// Retained positions, in increasing index order.
    positions: Vec<Position>,
}

impl SparseIndex {
    /// Create a new sparse index retaining roughly `density` (0 < density ≤ 1) of entries.
    ///
    /// Out-of-range densities are clamped to the nearest valid sampling interval.
    pub fn new(density: f64) -> Self {
        let every = if density >= 1.0 {
            1
        } else if density <= 0.0 {
            1
        } else {
            (1.0 / density).round() as u64
        };
        Self {
            every: every.max(1),
            positions: Vec::new(),
        }
    }

    /// The sampling interval implied by the configured density.
    pub fn sampling_interval(&self) -> u64 {
        self.every
    }

    /// Offer a mapping for retention. Retained only if `index` falls on the sampling boundary
    /// and is greater than every already-retained index.
    pub fn index(&mut self, index: u64, offset: u64) {
        if index == 0 || index % self.every != 0 {
            return;
        }
        if let Some(last) = self.positions.last() {
            if index <= last.index {
                return;
            }
        }
        self.positions.push(Position::new(index, offset));
    }

    /// Look up the greatest retained position with index ≤ `index`, if any.
    ///
    /// The result is a hint, not an exact hit: the caller scans forward from the returned
    /// offset to locate the exact entry.
    pub fn lookup(&self, index: u64) -> Option<Position> {
        let upper = self.positions.partition_point(|position| position.index <= index);
        if upper == 0 {
            None
        } else {
            Some(self.positions[upper - 1])
        }
    }

    /// Discard every retained mapping with index ≥ `index`, matching the "remove this index
    /// and everything after it" semantics of log truncation.
    pub fn truncate(&mut self, index: u64) {
        let keep = self.positions.partition_point(|position| position.index < index);
        self.positions.truncate(keep);
    }

    /// Discard every retained mapping with index < `index`, for log compaction.
    pub fn compact(&mut self, index: u64) {
        let drop = self.positions.partition_point(|position| position.index < index);
        self.positions.drain(..drop);
    }

    /// Drop all retained mappings.
    pub fn clear(&mut self) {
        self.positions.clear();
    }

    /// Number of retained mappings.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Index entries 1..=n, with entry i at offset i*2.
    fn filled(density: f64, n: u64) -> SparseIndex {
        let mut index = SparseIndex::new(density);
        for i in 1..=n {
            index.index(i, i * 2);
        }
        index
    }

    #[test]
    fn density_implies_sampling_interval() {
        assert_eq!(SparseIndex::new(0.2).sampling_interval(), 5);
        assert_eq!(SparseIndex::new(0.5).sampling_interval(), 2);
        assert_eq!(SparseIndex::new(1.0).sampling_interval(), 1);
    }

    #[test]
    fn density_fifth_retains_every_fifth_index() {
        let index = filled(0.2, 10);
        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup(5), Some(Position::new(5, 10)));
        assert_eq!(index.lookup(10), Some(Position::new(10, 20)));
    }

    #[test]
    fn lookup_returns_nearest_retained_at_or_below() {
        let index = filled(0.2, 10);
        assert_eq!(index.lookup(8), Some(Position::new(5, 10)));
        assert_eq!(index.lookup(9), Some(Position::new(5, 10)));
        assert_eq!(index.lookup(200), Some(Position::new(10, 20)));
    }

    #[test]
    fn lookup_below_smallest_retained_returns_none() {
        let index = filled(0.2, 10);
        assert_eq!(index.lookup(4), None);
        assert_eq!(index.lookup(0), None);
    }

    #[test]
    fn truncate_removes_retained_at_and_above() {
        let mut index = filled(0.2, 10);
        index.truncate(8);
        // 10 is gone; 5 still answers for everything at or above it.
        assert_eq!(index.lookup(10), Some(Position::new(5, 10)));

        let mut index = filled(0.2, 10);
        index.truncate(4);
        assert_eq!(index.lookup(8), None);
    }

    #[test]
    fn compact_removes_retained_below() {
        let mut index = filled(0.2, 20);
        index.compact(6);
        assert_eq!(index.lookup(8), None);
        assert_eq!(index.lookup(10), Some(Position::new(10, 20)));
        assert_eq!(index.lookup(20), Some(Position::new(20, 40)));
    }

    #[test]
    fn skipped_indices_are_never_retained_later() {
        let mut index = SparseIndex::new(0.2);
        for i in 1..=10u64 {
            index.index(i, i * 2);
        }
        // Re-offering earlier indices changes nothing.
        index.index(5, 999);
        index.index(3, 999);
        assert_eq!(index.lookup(5), Some(Position::new(5, 10)));
        assert_eq!(index.lookup(4), None);
    }

    #[test]
    fn full_density_retains_everything() {
        let index = filled(1.0, 4);
        assert_eq!(index.len(), 4);
        assert_eq!(index.lookup(3), Some(Position::new(3, 6)));
    }
}
