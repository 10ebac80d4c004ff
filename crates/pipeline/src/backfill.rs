//! Coordination of missed-range backfills and the periodic staleness sweep.
//!
//! Both fetches run outside the event loop; this type only decides whether
//! one may start and shapes the results before they are merged.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::gap::SequenceGap;
use crate::sample::Sample;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(5);

/// Historical range requested by a sweep, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SweepRange {
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }

    /// Drop anything the backend returned outside the requested range.
    pub fn retain(&self, samples: Vec<Sample>) -> Vec<Sample> {
        samples
            .into_iter()
            .filter(|sample| self.contains(sample.timestamp))
            .collect()
    }
}

#[derive(Debug)]
pub struct BackfillCoordinator {
    in_flight: Option<SequenceGap>,
    sweep_in_flight: bool,
    staleness_threshold: TimeDelta,
}

impl Default for BackfillCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_THRESHOLD)
    }
}

impl BackfillCoordinator {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            in_flight: None,
            sweep_in_flight: false,
            staleness_threshold: TimeDelta::from_std(staleness_threshold).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Claim the single backfill slot for `gap`. Returns `false` when a fetch
    /// is already outstanding; the gap is then left to the sweep.
    pub fn try_begin(&mut self, gap: &SequenceGap) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        self.in_flight = Some(gap.clone());
        true
    }

    /// Release the slot, whatever the outcome of the fetch.
    pub fn finish(&mut self) -> Option<SequenceGap> {
        self.in_flight.take()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&SequenceGap> {
        self.in_flight.as_ref()
    }

    /// Range to sweep when the newest buffered sample is older than the
    /// staleness threshold. An empty buffer is left to the seed fetch.
    pub fn sweep_range(&self, tail: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<SweepRange> {
        let tail = tail?;
        if now.signed_duration_since(tail) <= self.staleness_threshold {
            return None;
        }
        Some(SweepRange { start: tail, end: now })
    }

    /// Like [`sweep_range`](Self::sweep_range) but also claims the sweep slot
    /// so two sweeps never overlap.
    pub fn begin_sweep(&mut self, tail: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<SweepRange> {
        if self.sweep_in_flight {
            return None;
        }
        let range = self.sweep_range(tail, now)?;
        self.sweep_in_flight = true;
        Some(range)
    }

    pub fn finish_sweep(&mut self) {
        self.sweep_in_flight = false;
    }
}
