//! Fixed-capacity rolling buffer of the most recent samples.
//!
//! Invariants, kept by every mutation:
//! - `len() <= capacity()`
//! - timestamps strictly ascending
//! - no two samples share a [`SampleKey`]

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::sample::{Sample, SampleKey};

pub const DEFAULT_CAPACITY: usize = 60;

/// What happened to a sample offered to [`RollingBuffer::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Added as the new tail; `evicted` is the oldest sample if the buffer
    /// was full.
    Appended { evicted: Option<Sample> },
    /// Older than the tail; placed at its chronological position.
    Inserted,
    /// Already present, or older than everything a full buffer keeps.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct RollingBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn tail(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn tail_timestamp(&self) -> Option<DateTime<Utc>> {
        self.tail().map(|sample| sample.timestamp)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Sample> + ExactSizeIterator {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn contains_key(&self, key: &SampleKey) -> bool {
        self.samples.iter().any(|sample| &sample.key() == key)
    }

    /// Live append path. A sample newer than the tail is appended, evicting
    /// the oldest one when full; anything else goes through ordered insert.
    pub fn push(&mut self, sample: Sample) -> Admission {
        let newer_than_tail = self
            .tail()
            .is_none_or(|tail| sample.timestamp > tail.timestamp);
        if !newer_than_tail {
            return if self.insert_ordered(sample) {
                self.truncate_to_capacity();
                Admission::Inserted
            } else {
                Admission::Rejected
            };
        }

        if self.contains_key(&sample.key()) {
            return Admission::Rejected;
        }

        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        Admission::Appended { evicted }
    }

    /// Merge backfilled samples one at a time at their chronological position,
    /// then drop the oldest entries beyond capacity. Returns how many of the
    /// given samples are still in the buffer afterwards.
    pub fn merge_backfill(&mut self, samples: Vec<Sample>) -> usize {
        let mut inserted_keys = Vec::new();
        for sample in samples {
            let key = sample.key();
            if self.insert_ordered(sample) {
                inserted_keys.push(key);
            }
        }
        self.truncate_to_capacity();

        inserted_keys
            .iter()
            .filter(|key| self.contains_key(key))
            .count()
    }

    /// Merge a batch (sweep or seed results) by dedup, sort and truncate.
    /// Returns the number of new samples that survived the truncation.
    pub fn merge_sorted(&mut self, samples: Vec<Sample>) -> usize {
        let existing: HashSet<SampleKey> = self.samples.iter().map(Sample::key).collect();
        let mut fresh: Vec<Sample> = Vec::with_capacity(samples.len());
        let mut fresh_keys = HashSet::new();
        for sample in samples {
            let key = sample.key();
            if !existing.contains(&key) && fresh_keys.insert(key) {
                fresh.push(sample);
            }
        }
        if fresh.is_empty() {
            return 0;
        }

        let mut merged: Vec<Sample> = self.samples.drain(..).collect();
        merged.extend(fresh);
        // stable: on equal timestamps the already-buffered sample comes first and wins
        merged.sort_by_key(|sample| sample.timestamp);
        merged.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);

        self.samples = merged.into();
        self.truncate_to_capacity();

        self.samples
            .iter()
            .filter(|sample| fresh_keys.contains(&sample.key()))
            .count()
    }

    /// Insert at the position found by binary search over timestamps.
    /// Duplicates (same key, or same timestamp) are skipped.
    fn insert_ordered(&mut self, sample: Sample) -> bool {
        let index = self
            .samples
            .partition_point(|existing| existing.timestamp < sample.timestamp);

        let collides = self
            .samples
            .get(index)
            .is_some_and(|existing| existing.timestamp == sample.timestamp);
        if collides || self.contains_key(&sample.key()) {
            return false;
        }

        self.samples.insert(index, sample);
        true
    }

    fn truncate_to_capacity(&mut self) {
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        debug_assert!(self.is_strictly_ascending());
    }

    fn is_strictly_ascending(&self) -> bool {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .all(|(earlier, later)| earlier.timestamp < later.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::test_support::{sample, sample_in, unsequenced};

    fn sequences(buffer: &RollingBuffer) -> Vec<u64> {
        buffer.iter().filter_map(|sample| sample.sequence).collect()
    }

    fn assert_invariants(buffer: &RollingBuffer) {
        assert!(buffer.len() <= buffer.capacity());
        assert!(buffer.is_strictly_ascending());
        let keys: HashSet<SampleKey> = buffer.iter().map(Sample::key).collect();
        assert_eq!(keys.len(), buffer.len());
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut buffer = RollingBuffer::new(60);
        for sequence in 1..=65 {
            buffer.push(sample(sequence));
            assert!(buffer.len() <= 60);
        }

        assert_eq!(buffer.len(), 60);
        assert_eq!(sequences(&buffer), (6..=65).collect::<Vec<_>>());
        assert_invariants(&buffer);
    }

    #[test]
    fn append_reports_evicted_sample() {
        let mut buffer = RollingBuffer::new(2);
        assert_eq!(buffer.push(sample(1)), Admission::Appended { evicted: None });
        buffer.push(sample(2));

        match buffer.push(sample(3)) {
            Admission::Appended { evicted: Some(evicted) } => assert_eq!(evicted.sequence, Some(1)),
            other => panic!("unexpected admission: {other:?}"),
        }
    }

    #[test]
    fn late_live_sample_is_inserted_in_order() {
        let mut buffer = RollingBuffer::new(10);
        buffer.push(sample(1));
        buffer.push(sample(3));

        assert_eq!(buffer.push(sample(2)), Admission::Inserted);
        assert_eq!(buffer.push(sample(2)), Admission::Rejected);
        assert_eq!(sequences(&buffer), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_key_with_newer_timestamp_is_rejected() {
        let mut buffer = RollingBuffer::new(10);
        buffer.push(sample_in("s1", 1, 0));

        assert_eq!(buffer.push(sample_in("s1", 1, 5)), Admission::Rejected);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn backfill_merges_out_of_order_samples_into_partial_buffer() {
        let mut buffer = RollingBuffer::new(60);
        // 55 live samples with two holes: sequences 21..=25 and 41..=45 missing
        for sequence in (1..=65).filter(|s| !(21..=25).contains(s) && !(41..=45).contains(s)) {
            buffer.push(sample(sequence));
        }
        assert_eq!(buffer.len(), 55);

        let backfill: Vec<Sample> = [44, 22, 41, 25, 43, 21, 45, 23, 42, 24]
            .into_iter()
            .map(sample)
            .collect();
        let kept = buffer.merge_backfill(backfill);

        assert_eq!(buffer.len(), 60);
        assert_eq!(kept, 10);
        assert_eq!(sequences(&buffer), (6..=65).collect::<Vec<_>>());
        assert_invariants(&buffer);
    }

    #[test]
    fn backfill_never_displaces_newest_samples() {
        let mut buffer = RollingBuffer::new(5);
        for sequence in 10..=14 {
            buffer.push(sample(sequence));
        }

        let kept = buffer.merge_backfill(vec![sample(1), sample(2)]);

        assert_eq!(kept, 0);
        assert_eq!(sequences(&buffer), vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn backfill_skips_exact_duplicates() {
        let mut buffer = RollingBuffer::new(10);
        buffer.push(sample(1));
        buffer.push(sample(3));

        let kept = buffer.merge_backfill(vec![sample(2), sample(3), sample(2)]);

        assert_eq!(kept, 1);
        assert_eq!(sequences(&buffer), vec![1, 2, 3]);
        assert_invariants(&buffer);
    }

    #[test]
    fn merge_sorted_dedups_by_key_and_timestamp() {
        let mut buffer = RollingBuffer::new(4);
        buffer.push(sample(1));
        buffer.push(unsequenced(2));

        let merged = buffer.merge_sorted(vec![
            unsequenced(2),
            sample(1),
            sample(4),
            sample(3),
            sample(5),
        ]);

        assert_eq!(merged, 3);
        assert_eq!(buffer.len(), 4);
        let seconds: Vec<i64> = buffer
            .iter()
            .map(|s| s.timestamp.timestamp() - 1_700_000_000)
            .collect();
        assert_eq!(seconds, vec![2, 3, 4, 5]);
        assert_invariants(&buffer);
    }

    #[test]
    fn session_restart_keeps_both_sessions_apart() {
        let mut buffer = RollingBuffer::new(10);
        buffer.push(sample_in("a", 1, 0));
        buffer.push(sample_in("b", 1, 1));

        assert_eq!(buffer.len(), 2);
        assert_invariants(&buffer);
    }
}
