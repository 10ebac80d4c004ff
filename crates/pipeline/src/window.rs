//! Time-windowed views over the live buffer and a one-shot historical fetch.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::buffer::RollingBuffer;
use crate::sample::Sample;

pub const DEFAULT_MAX_POINTS: usize = 300;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeWindow {
    #[default]
    Live,
    LookBack(Duration),
}

impl TimeWindow {
    pub const PRESETS: [TimeWindow; 4] = [
        TimeWindow::LookBack(Duration::from_secs(HOUR)),
        TimeWindow::LookBack(Duration::from_secs(6 * HOUR)),
        TimeWindow::LookBack(Duration::from_secs(DAY)),
        TimeWindow::LookBack(Duration::from_secs(7 * DAY)),
    ];

    pub fn duration(&self) -> Option<Duration> {
        match self {
            TimeWindow::Live => None,
            TimeWindow::LookBack(duration) => Some(*duration),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowParseError {
    #[error("empty time window")]
    Empty,
    #[error("invalid window length {0:?}")]
    InvalidLength(String),
    #[error("unknown window unit {0:?}, expected m, h or d")]
    UnknownUnit(char),
}

impl FromStr for TimeWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("live") {
            return Ok(TimeWindow::Live);
        }

        let unit = s.chars().last().ok_or(WindowParseError::Empty)?;
        let multiplier = match unit.to_ascii_lowercase() {
            'm' => MINUTE,
            'h' => HOUR,
            'd' => DAY,
            other => return Err(WindowParseError::UnknownUnit(other)),
        };

        let digits = &s[..s.len() - unit.len_utf8()];
        let length: u64 = digits
            .parse()
            .map_err(|_| WindowParseError::InvalidLength(digits.to_owned()))?;
        if length == 0 {
            return Err(WindowParseError::InvalidLength(digits.to_owned()));
        }

        length
            .checked_mul(multiplier)
            .map(|secs| TimeWindow::LookBack(Duration::from_secs(secs)))
            .ok_or_else(|| WindowParseError::InvalidLength(digits.to_owned()))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = match self {
            TimeWindow::Live => return f.write_str("live"),
            TimeWindow::LookBack(duration) => duration.as_secs(),
        };
        if secs > 0 && secs % DAY == 0 {
            write!(f, "{}d", secs / DAY)
        } else if secs > 0 && secs % HOUR == 0 {
            write!(f, "{}h", secs / HOUR)
        } else if secs > 0 && secs % MINUTE == 0 {
            write!(f, "{}m", secs / MINUTE)
        } else {
            write!(f, "{secs}s")
        }
    }
}

impl Serialize for TimeWindow {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One historical fetch for a window selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRequest {
    pub generation: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowView {
    pub window: TimeWindow,
    /// A historical fetch for this selection is still outstanding.
    pub loading: bool,
    pub samples: Vec<Sample>,
}

#[derive(Debug)]
pub struct TimeWindowCompositor {
    window: TimeWindow,
    generation: u64,
    loading: bool,
    anchor: Option<DateTime<Utc>>,
    history: Vec<Sample>,
    max_points: usize,
}

impl Default for TimeWindowCompositor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POINTS)
    }
}

impl TimeWindowCompositor {
    pub fn new(max_points: usize) -> Self {
        Self {
            window: TimeWindow::Live,
            generation: 0,
            loading: false,
            anchor: None,
            history: Vec::new(),
            max_points: max_points.max(1),
        }
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Switch to `window`. Returns the single historical fetch the selection
    /// needs; selecting the active window again is a no-op.
    ///
    /// The newest buffered timestamp anchors the range. The client clock is
    /// only used when the buffer is still empty.
    pub fn select(
        &mut self,
        window: TimeWindow,
        tail: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<HistoryRequest> {
        if window == self.window {
            return None;
        }

        self.window = window;
        self.generation += 1;
        self.history.clear();
        self.anchor = None;
        self.loading = false;

        let duration = window.duration()?;
        let anchor = tail.unwrap_or(now);
        self.anchor = Some(anchor);
        self.loading = true;

        Some(HistoryRequest {
            generation: self.generation,
            start: window_start(anchor, duration),
            end: anchor,
        })
    }

    /// Install the result of a historical fetch. Results for a superseded
    /// selection are discarded and `false` is returned.
    pub fn apply_history(&mut self, generation: u64, mut samples: Vec<Sample>) -> bool {
        if generation != self.generation || self.window == TimeWindow::Live {
            return false;
        }
        samples.sort_by_key(|sample| sample.timestamp);
        samples.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
        self.history = samples;
        self.loading = false;
        true
    }

    /// The fetch failed; the view falls back to the live samples inside the
    /// window.
    pub fn fail_history(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.loading = false;
        true
    }

    pub fn view(&self, buffer: &RollingBuffer) -> WindowView {
        let samples = match self.window {
            TimeWindow::Live => buffer.to_vec(),
            TimeWindow::LookBack(duration) => self.compose(buffer, duration),
        };
        WindowView {
            window: self.window,
            loading: self.loading,
            samples,
        }
    }

    fn compose(&self, buffer: &RollingBuffer, duration: Duration) -> Vec<Sample> {
        let Some(now) = buffer.tail_timestamp().or(self.anchor) else {
            return Vec::new();
        };
        let lower = window_start(now, duration);

        let historical: Vec<Sample> = self
            .history
            .iter()
            .filter(|sample| sample.timestamp >= lower)
            .cloned()
            .collect();
        let freshest = self.history.last().map(|sample| sample.timestamp);

        let mut samples = downsample(historical, self.max_points);
        samples.extend(
            buffer
                .iter()
                .filter(|sample| sample.timestamp >= lower)
                .filter(|sample| freshest.is_none_or(|freshest| sample.timestamp > freshest))
                .cloned(),
        );
        samples
    }
}

/// Reduce `samples` to roughly `max_points` with a fixed stride, keeping
/// every alert-relevant sample. Input must be sorted by timestamp.
pub fn downsample(samples: Vec<Sample>, max_points: usize) -> Vec<Sample> {
    if samples.len() <= max_points || max_points == 0 {
        return samples;
    }
    let stride = samples.len() / max_points;

    samples
        .into_iter()
        .enumerate()
        .filter(|(index, sample)| index % stride == 0 || sample.is_alert_relevant())
        .map(|(_, sample)| sample)
        .collect()
}

fn window_start(anchor: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| anchor.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
