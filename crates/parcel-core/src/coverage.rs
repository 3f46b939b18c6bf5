//! Delivered-byte accounting for a single token.
//!
//! A [`CoverageSet`] holds the bytes confirmed delivered to a client as a
//! sorted list of disjoint ranges. Overlapping and adjacent ranges are always
//! merged, so for neighbours `a, b` it holds that `a.end + 1 < b.start`.

use serde::{Deserialize, Serialize};

use crate::range::ByteRange;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoverageSet {
    ranges: Vec<ByteRange>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary ranges, merging as needed.
    pub fn from_ranges<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = ByteRange>,
    {
        let mut set = Self::new();
        for range in ranges {
            set.add(range);
        }
        set
    }

    /// Insert `range`, merging it with every overlapping or adjacent interval.
    ///
    /// Returns true when the set grew.
    pub fn add(&mut self, range: ByteRange) -> bool {
        let before = self.total_covered();
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut current = range;
        let mut placed = false;

        for existing in self.ranges.iter().copied() {
            if existing.end.saturating_add(1) < current.start {
                merged.push(existing);
            } else if current.end.saturating_add(1) < existing.start {
                if !placed {
                    merged.push(current);
                    placed = true;
                }
                merged.push(existing);
            } else {
                current = ByteRange {
                    start: current.start.min(existing.start),
                    end: current.end.max(existing.end),
                };
            }
        }
        if !placed {
            merged.push(current);
        }

        self.ranges = merged;
        self.total_covered() != before
    }

    /// Sum of the lengths of all intervals.
    pub fn total_covered(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// True iff the set is exactly `[[0, len-1]]`.
    pub fn is_fully_covered(&self, len: u64) -> bool {
        match self.ranges.as_slice() {
            [only] => ByteRange::full(len) == Some(*only),
            _ => false,
        }
    }

    /// Gaps of `[0, len-1]` that have not been delivered yet.
    pub fn missing(&self, len: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for range in &self.ranges {
            if range.start >= len {
                break;
            }
            if range.start > cursor {
                gaps.push(ByteRange {
                    start: cursor,
                    end: range.start - 1,
                });
            }
            cursor = range.end.saturating_add(1);
        }
        if cursor < len {
            gaps.push(ByteRange {
                start: cursor,
                end: len - 1,
            });
        }
        gaps
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}
