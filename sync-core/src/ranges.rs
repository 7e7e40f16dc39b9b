//! Byte-range bookkeeping for multi-source downloads.
//!
//! A [`FileProgress`] tracks which bytes of a file were received and which are
//! currently requested from some source, so that several sources can be
//! handed non-overlapping part requests.

use serde::{Deserialize, Serialize};

use crate::requests::PartRange;

/// A set of disjoint, sorted half-open byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`, merging with adjacent or overlapping ranges.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for &(s, e) in &self.ranges {
            if e < new_start {
                merged.push((s, e));
            } else if s > new_end {
                if !placed {
                    merged.push((new_start, new_end));
                    placed = true;
                }
                merged.push((s, e));
            } else {
                new_start = new_start.min(s);
                new_end = new_end.max(e);
            }
        }
        if !placed {
            merged.push((new_start, new_end));
        }
        self.ranges = merged;
    }

    /// Remove `[start, end)` from the set.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                kept.push((s, e));
                continue;
            }
            if s < start {
                kept.push((s, start));
            }
            if e > end {
                kept.push((end, e));
            }
        }
        self.ranges = kept;
    }

    /// Whether `[start, end)` is fully inside the set.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// First uncovered range inside `[0, limit)`.
    pub fn first_gap(&self, limit: u64) -> Option<(u64, u64)> {
        let mut cursor = 0;
        for &(s, e) in &self.ranges {
            if s > cursor {
                return Some((cursor, s.min(limit))).filter(|(a, b)| a < b);
            }
            cursor = cursor.max(e);
            if cursor >= limit {
                return None;
            }
        }
        (cursor < limit).then_some((cursor, limit))
    }

    /// Total number of covered bytes.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// Iterate over the ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Clear all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

/// Received and requested bytes of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    size: u64,
    received: RangeSet,
    #[serde(skip)]
    in_flight: RangeSet,
}

impl FileProgress {
    /// Track a file of `size` bytes with nothing received.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            received: RangeSet::new(),
            in_flight: RangeSet::new(),
        }
    }

    /// Resume from previously received ranges.
    pub fn resume(size: u64, received: RangeSet) -> Self {
        let mut progress = Self::new(size);
        for (s, e) in received.iter() {
            progress.received.insert(s.min(size), e.min(size));
        }
        progress
    }

    /// File size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Next range of at most `max_len` bytes that is neither received nor
    /// requested. The range is marked in flight.
    pub fn next_request(&mut self, max_len: u64) -> Option<PartRange> {
        if max_len == 0 {
            return None;
        }
        let mut taken = self.received.clone();
        for (s, e) in self.in_flight.iter() {
            taken.insert(s, e);
        }
        let (start, gap_end) = taken.first_gap(self.size)?;
        let end = gap_end.min(start + max_len);
        self.in_flight.insert(start, end);
        Some(PartRange::new(start, end - start))
    }

    /// Record received bytes.
    pub fn mark_received(&mut self, range: PartRange) {
        let end = range.end().min(self.size);
        self.received.insert(range.offset, end);
        self.in_flight.remove(range.offset, end);
    }

    /// Hand back ranges that were requested but will not arrive.
    pub fn release(&mut self, ranges: &[PartRange]) {
        for range in ranges {
            self.in_flight.remove(range.offset, range.end());
        }
    }

    /// Whether `range` was already received.
    pub fn is_received(&self, range: PartRange) -> bool {
        self.received.contains(range.offset, range.end().min(self.size))
    }

    /// Received bytes.
    pub fn received_bytes(&self) -> u64 {
        self.received.covered()
    }

    /// Received ranges, for persistence.
    pub fn received(&self) -> &RangeSet {
        &self.received
    }

    /// Whether every byte arrived.
    pub fn is_complete(&self) -> bool {
        self.received.contains(0, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_merges() {
        let mut set = RangeSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        set.insert(10, 20);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 30)]);
        assert_eq!(set.covered(), 30);
    }

    #[test]
    fn insert_keeps_order() {
        let mut set = RangeSet::new();
        set.insert(50, 60);
        set.insert(0, 10);
        set.insert(20, 30);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![(0, 10), (20, 30), (50, 60)]
        );
    }

    #[test]
    fn remove_splits() {
        let mut set = RangeSet::new();
        set.insert(0, 100);
        set.remove(40, 60);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 40), (60, 100)]);
        assert!(set.contains(0, 40));
        assert!(!set.contains(30, 70));
    }

    #[test]
    fn first_gap() {
        let mut set = RangeSet::new();
        assert_eq!(set.first_gap(100), Some((0, 100)));
        set.insert(0, 30);
        set.insert(50, 100);
        assert_eq!(set.first_gap(100), Some((30, 50)));
        set.insert(30, 50);
        assert_eq!(set.first_gap(100), None);
    }

    #[test]
    fn two_sources_get_disjoint_parts() {
        let mut progress = FileProgress::new(100);
        let a = progress.next_request(40).unwrap();
        let b = progress.next_request(40).unwrap();
        let c = progress.next_request(40).unwrap();

        assert_eq!(a, PartRange::new(0, 40));
        assert_eq!(b, PartRange::new(40, 40));
        assert_eq!(c, PartRange::new(80, 20));
        assert!(progress.next_request(40).is_none());
    }

    #[test]
    fn released_ranges_are_requested_again() {
        let mut progress = FileProgress::new(100);
        let a = progress.next_request(50).unwrap();
        let _b = progress.next_request(50).unwrap();

        progress.release(&[a]);
        assert_eq!(progress.next_request(50), Some(PartRange::new(0, 50)));
    }

    #[test]
    fn completes_when_all_received() {
        let mut progress = FileProgress::new(64);
        progress.mark_received(PartRange::new(0, 32));
        assert!(!progress.is_complete());
        progress.mark_received(PartRange::new(32, 32));
        assert!(progress.is_complete());
        assert_eq!(progress.received_bytes(), 64);
    }

    #[test]
    fn empty_file_is_complete() {
        let mut progress = FileProgress::new(0);
        assert!(progress.is_complete());
        assert!(progress.next_request(32).is_none());
    }

    #[test]
    fn resume_skips_received() {
        let mut received = RangeSet::new();
        received.insert(0, 50);
        let mut progress = FileProgress::resume(100, received);
        assert_eq!(progress.next_request(100), Some(PartRange::new(50, 50)));
    }

    #[test]
    fn progress_serializes_received_only() {
        let mut progress = FileProgress::new(10);
        progress.next_request(5);
        progress.mark_received(PartRange::new(0, 5));

        let json = serde_json::to_string(&progress).unwrap();
        let back: FileProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.received_bytes(), 5);
        assert_eq!(back.size(), 10);
    }
}
