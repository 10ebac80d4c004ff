//! Lock-free counters for the ingestion pipeline, exportable in Prometheus
//! text format.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared between the event loop and its callers.
///
/// Every field is a relaxed atomic; read them together through
/// [`snapshot()`](PipelineMetrics::snapshot).
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Live samples that entered the rolling buffer.
    samples_admitted: AtomicU64,
    /// Frames that failed to decode and were skipped.
    frames_dropped: AtomicU64,
    gaps_detected: AtomicU64,
    /// Gaps ignored because a backfill was already outstanding.
    gaps_dropped: AtomicU64,
    backfills_merged: AtomicU64,
    /// Missed-range queries answered with "no longer available".
    backfills_unavailable: AtomicU64,
    sweeps_run: AtomicU64,
    /// Samples added to the buffer by backfills, sweeps and the seed fetch.
    samples_merged: AtomicU64,
    window_fetches: AtomicU64,
    reconnects: AtomicU64,
    incidents_recorded: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_samples_admitted(&self) {
        self.samples_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_frames_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_gaps_detected(&self) {
        self.gaps_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_gaps_dropped(&self) {
        self.gaps_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backfills_merged(&self) {
        self.backfills_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_backfills_unavailable(&self) {
        self.backfills_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sweeps_run(&self) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_samples_merged(&self, count: u64) {
        self.samples_merged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_window_fetches(&self) {
        self.window_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_incidents_recorded(&self) {
        self.incidents_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples_admitted: self.samples_admitted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            gaps_dropped: self.gaps_dropped.load(Ordering::Relaxed),
            backfills_merged: self.backfills_merged.load(Ordering::Relaxed),
            backfills_unavailable: self.backfills_unavailable.load(Ordering::Relaxed),
            sweeps_run: self.sweeps_run.load(Ordering::Relaxed),
            samples_merged: self.samples_merged.load(Ordering::Relaxed),
            window_fetches: self.window_fetches.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            incidents_recorded: self.incidents_recorded.load(Ordering::Relaxed),
        }
    }

    pub fn to_prometheus_text(&self) -> String {
        self.snapshot().to_prometheus_text()
    }
}

const _: fn() = || {
    fn must_be_send_sync<T: Send + Sync>() {}
    must_be_send_sync::<PipelineMetrics>();
};

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub samples_admitted: u64,
    pub frames_dropped: u64,
    pub gaps_detected: u64,
    pub gaps_dropped: u64,
    pub backfills_merged: u64,
    pub backfills_unavailable: u64,
    pub sweeps_run: u64,
    pub samples_merged: u64,
    pub window_fetches: u64,
    pub reconnects: u64,
    pub incidents_recorded: u64,
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 11] {
        [
            ("samples_admitted", "Live samples admitted into the rolling buffer", self.samples_admitted),
            ("frames_dropped", "Stream frames dropped as malformed", self.frames_dropped),
            ("gaps_detected", "Sequence gaps detected", self.gaps_detected),
            ("gaps_dropped", "Gaps ignored while a backfill was in flight", self.gaps_dropped),
            ("backfills_merged", "Missed-range backfills merged", self.backfills_merged),
            (
                "backfills_unavailable",
                "Missed ranges no longer available at the source",
                self.backfills_unavailable,
            ),
            ("sweeps_run", "Staleness sweeps fetched", self.sweeps_run),
            ("samples_merged", "Samples merged from historical queries", self.samples_merged),
            ("window_fetches", "Historical fetches issued for window selections", self.window_fetches),
            ("reconnects", "Stream reconnect attempts", self.reconnects),
            ("incidents_recorded", "Completed episodes recorded as incidents", self.incidents_recorded),
        ]
    }

    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::with_capacity(1024);
        for (name, help, value) in self.counters() {
            write_counter(&mut out, &format!("pulsewatch_{name}"), help, value);
        }
        out
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline Metrics")?;
        for (name, _, value) in self.counters() {
            write!(f, "\n  {:<22} {value}", format!("{name}:"))?;
        }
        Ok(())
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(PipelineMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increments_are_visible_in_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.increment_samples_admitted();
        metrics.increment_samples_admitted();
        metrics.increment_gaps_detected();
        metrics.increment_gaps_dropped();
        metrics.add_samples_merged(10);
        metrics.increment_reconnects();

        let snap = metrics.snapshot();
        assert_eq!(snap.samples_admitted, 2);
        assert_eq!(snap.gaps_detected, 1);
        assert_eq!(snap.gaps_dropped, 1);
        assert_eq!(snap.samples_merged, 10);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.incidents_recorded, 0);
    }

    #[test]
    fn prometheus_text_lists_every_counter() {
        let metrics = PipelineMetrics::new();
        metrics.increment_frames_dropped();

        let text = metrics.to_prometheus_text();

        assert!(text.contains("# HELP pulsewatch_frames_dropped"));
        assert!(text.contains("# TYPE pulsewatch_frames_dropped counter"));
        assert!(text.contains("pulsewatch_frames_dropped 1"));
        assert!(text.contains("pulsewatch_incidents_recorded 0"));
        assert_eq!(text.lines().count(), 33);
    }

    #[test]
    fn display_renders_one_line_per_counter() {
        let metrics = PipelineMetrics::new();
        metrics.increment_sweeps_run();

        let display = metrics.snapshot().to_string();

        assert!(display.starts_with("Pipeline Metrics"));
        assert!(display.contains("sweeps_run:"));
        assert_eq!(display.lines().count(), 12);
    }

    #[test]
    fn concurrent_increments_from_many_threads() {
        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment_samples_admitted();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread joins");
        }

        assert_eq!(metrics.snapshot().samples_admitted, 8000);
    }
}
