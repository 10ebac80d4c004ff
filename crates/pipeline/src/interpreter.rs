//! Turns the condition trackers embedded in consecutive samples into discrete
//! alert markers.
//!
//! The source owns the state machines; this side only compares each new
//! snapshot with the previous one and classifies the transitions. Three
//! families are interpreted independently:
//!
//! - the persistent conditions (`validator_offline`, `credits_stagnant`,
//!   `network_halted`)
//! - temporal degradation, where the first matching rule wins
//! - the divergence episode lifecycle

use std::fmt;

use serde::Serialize;

use crate::buffer::RollingBuffer;
use crate::sample::{
    ConditionKind, ConditionPhase, ConditionSnapshot, DegradationLevel, DegradationMetric,
    EpisodePhase, Sample, TemporalDegradation,
};

/// How many buffered samples back the episode baseline is taken from.
pub const BASELINE_LOOKBACK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The degradation peaked at Warning and the warning was delivered.
    WarningSent,
    /// The degradation reached Critical.
    CriticalEscalated,
    /// No alert went out before the degradation cleared.
    ClearedBeforeAlert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "marker", rename_all = "snake_case")]
pub enum AlertMarker {
    ConditionFired { condition: ConditionKind },
    ConditionDetecting { condition: ConditionKind },
    ConditionCleared { condition: ConditionKind },
    WarningPending,
    CriticalDelivered,
    DegradationRecovered { outcome: RecoveryOutcome },
    FirstDegradation { metrics: Vec<DegradationMetric> },
    EpisodeStarted { episode_id: Option<u64>, baseline_gap: Option<i64> },
    EpisodeRankSampling { episode_id: Option<u64> },
    /// `loss` is the baseline gap minus the confirmed gap; unknown when no
    /// baseline was captured.
    EpisodeConfirmed { episode_id: Option<u64>, loss: Option<i64> },
    EpisodeFalsePositive { episode_id: Option<u64> },
    EpisodeClosed { episode_id: Option<u64> },
}

impl fmt::Display for AlertMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertMarker::ConditionFired { condition } => write!(f, "{condition} fired"),
            AlertMarker::ConditionDetecting { condition } => write!(f, "{condition} detecting"),
            AlertMarker::ConditionCleared { condition } => write!(f, "{condition} cleared"),
            AlertMarker::WarningPending => f.write_str("degradation warning pending"),
            AlertMarker::CriticalDelivered => f.write_str("degradation critical delivered"),
            AlertMarker::DegradationRecovered { outcome } => {
                write!(f, "degradation recovered ({outcome:?})")
            }
            AlertMarker::FirstDegradation { metrics } => {
                write!(f, "first degradation on {metrics:?}")
            }
            AlertMarker::EpisodeStarted { episode_id, .. } => {
                write!(f, "episode {} started", DisplayId(*episode_id))
            }
            AlertMarker::EpisodeRankSampling { episode_id } => {
                write!(f, "episode {} sampling rank", DisplayId(*episode_id))
            }
            AlertMarker::EpisodeConfirmed { episode_id, loss } => match loss {
                Some(loss) => write!(f, "episode {} confirmed, loss {loss}", DisplayId(*episode_id)),
                None => write!(f, "episode {} confirmed", DisplayId(*episode_id)),
            },
            AlertMarker::EpisodeFalsePositive { episode_id } => {
                write!(f, "episode {} false positive", DisplayId(*episode_id))
            }
            AlertMarker::EpisodeClosed { episode_id } => {
                write!(f, "episode {} closed", DisplayId(*episode_id))
            }
        }
    }
}

struct DisplayId(Option<u64>);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "#{id}"),
            None => f.write_str("#?"),
        }
    }
}

/// Result of interpreting one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpretation {
    pub markers: Vec<AlertMarker>,
    /// Detection progress in `[0, 1]` while an episode is being validated.
    pub episode_progress: Option<f64>,
}

#[derive(Debug, Default)]
pub struct AlertStateInterpreter {
    previous: Option<ConditionSnapshot>,
    degradation_peak: DegradationLevel,
    baseline_gap: Option<i64>,
    episode_id: Option<u64>,
}

impl AlertStateInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline_gap(&self) -> Option<i64> {
        self.baseline_gap
    }

    /// Interpret `sample`, which must already be the tail of `buffer`.
    pub fn interpret(&mut self, sample: &Sample, buffer: &RollingBuffer) -> Interpretation {
        let Some(current) = sample.conditions.as_ref() else {
            return Interpretation::default();
        };
        let episode_progress = current.episode.progress();

        let Some(previous) = self.previous.replace(current.clone()) else {
            // joining mid-degradation: only a confirmed delivery counts
            if current.degradation.alert_delivered {
                self.degradation_peak = current.degradation.level;
            }
            if current.episode.phase != EpisodePhase::Idle {
                self.baseline_gap = current.episode.baseline_gap;
                self.episode_id = current.episode.episode_id;
            }
            return Interpretation {
                markers: Vec::new(),
                episode_progress,
            };
        };

        let mut markers = Vec::new();
        persistent_markers(&previous, current, &mut markers);
        self.degradation_markers(&previous.degradation, &current.degradation, &mut markers);
        self.episode_markers(&previous, current, sample, buffer, &mut markers);

        Interpretation {
            markers,
            episode_progress,
        }
    }

    fn degradation_markers(
        &mut self,
        previous: &TemporalDegradation,
        current: &TemporalDegradation,
        markers: &mut Vec<AlertMarker>,
    ) {
        match (previous.level, current.level) {
            (from, DegradationLevel::None) if from != DegradationLevel::None => {
                let outcome = match self.degradation_peak {
                    DegradationLevel::Critical => RecoveryOutcome::CriticalEscalated,
                    DegradationLevel::Warning => RecoveryOutcome::WarningSent,
                    DegradationLevel::None => RecoveryOutcome::ClearedBeforeAlert,
                };
                markers.push(AlertMarker::DegradationRecovered { outcome });
                self.degradation_peak = DegradationLevel::None;
            }
            (from, DegradationLevel::Critical) if from != DegradationLevel::Critical => {
                markers.push(AlertMarker::CriticalDelivered);
                self.degradation_peak = DegradationLevel::Critical;
            }
            (DegradationLevel::None, DegradationLevel::Warning) => {
                // a pending warning is delivered if the episode resolves at Warning
                markers.push(AlertMarker::WarningPending);
                self.degradation_peak = self.degradation_peak.max(DegradationLevel::Warning);
            }
            _ => {
                if previous.metrics.all_clear() && !current.metrics.all_clear() {
                    let metrics = current
                        .metrics
                        .iter()
                        .filter(|(_, state)| state.consecutive > 0)
                        .map(|(metric, _)| metric)
                        .collect();
                    markers.push(AlertMarker::FirstDegradation { metrics });
                }
            }
        }

        if current.alert_delivered && current.level != DegradationLevel::None {
            self.degradation_peak = self.degradation_peak.max(current.level);
        }
    }

    fn episode_markers(
        &mut self,
        previous: &ConditionSnapshot,
        current: &ConditionSnapshot,
        sample: &Sample,
        buffer: &RollingBuffer,
        markers: &mut Vec<AlertMarker>,
    ) {
        let mut from = previous.episode.phase;
        let to = current.episode.phase;
        if from == to {
            return;
        }

        if from == EpisodePhase::Idle {
            self.episode_id = current.episode.episode_id;
        }
        let episode_id = current.episode.episode_id.or(self.episode_id);

        if from == EpisodePhase::Idle {
            let index = buffer.len().saturating_sub(1).saturating_sub(BASELINE_LOOKBACK);
            self.baseline_gap = buffer.get(index).map(|sample| sample.gap_to_reference);
            markers.push(AlertMarker::EpisodeStarted {
                episode_id,
                baseline_gap: self.baseline_gap,
            });
            from = EpisodePhase::Stabilizing;
        }

        match (from, to) {
            (EpisodePhase::Stabilizing, EpisodePhase::RankSampling) => {
                markers.push(AlertMarker::EpisodeRankSampling { episode_id });
            }
            (_, EpisodePhase::Confirmed) if from != EpisodePhase::Confirmed => {
                let loss = self
                    .baseline_gap
                    .map(|baseline| baseline - sample.gap_to_reference);
                markers.push(AlertMarker::EpisodeConfirmed { episode_id, loss });
            }
            (EpisodePhase::Confirmed, EpisodePhase::Idle) => {
                self.baseline_gap = None;
                self.episode_id = None;
                markers.push(AlertMarker::EpisodeClosed { episode_id });
            }
            (_, EpisodePhase::Idle) => {
                self.baseline_gap = None;
                self.episode_id = None;
                markers.push(AlertMarker::EpisodeFalsePositive { episode_id });
            }
            _ => {}
        }
    }
}

fn persistent_markers(
    previous: &ConditionSnapshot,
    current: &ConditionSnapshot,
    markers: &mut Vec<AlertMarker>,
) {
    for ((condition, before), (_, after)) in previous.persistent().into_iter().zip(current.persistent()) {
        if before.phase == after.phase {
            continue;
        }
        let marker = match after.phase {
            ConditionPhase::Active => AlertMarker::ConditionFired { condition },
            ConditionPhase::Detecting => AlertMarker::ConditionDetecting { condition },
            ConditionPhase::Recovering | ConditionPhase::Idle => {
                AlertMarker::ConditionCleared { condition }
            }
        };
        markers.push(marker);
    }
}
