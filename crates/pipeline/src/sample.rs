//! Telemetry sample model.
//!
//! One [`Sample`] is emitted by the source per telemetry cycle. Decoding is
//! strict: every required field must be present and well-typed, and the serde
//! error names the offending field. The only defaults are the ones the wire
//! format documents (`alert_delivered`, the episode counters and the optional
//! session/sequence/epoch fields).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// One telemetry cycle's full state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Opaque id of the source run; changes when the source restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Monotonic counter, unique within a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Source-authoritative capture time.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub rank: u32,
    pub vote_distance: u64,
    pub root_distance: u64,
    pub credits: u64,
    pub credits_delta: i64,
    pub reference_credits: u64,
    pub reference_credits_delta: i64,
    pub gap_to_leader: i64,
    pub gap_to_top10: i64,
    pub gap_to_top100: i64,
    pub gap_to_reference: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionSnapshot>,
    #[serde(flatten)]
    pub epoch: EpochProgress,
}

impl Sample {
    /// Decode a single JSON sample object.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(DecodeError::from)
    }

    pub fn key(&self) -> SampleKey {
        match self.sequence {
            Some(sequence) => SampleKey::Sequenced {
                session_id: self.session_id.clone(),
                sequence,
            },
            None => SampleKey::Timestamp(self.timestamp.timestamp_millis()),
        }
    }

    /// Whether this sample must survive downsampling: an alert was delivered
    /// this cycle, or it carries a completed episode record.
    pub fn is_alert_relevant(&self) -> bool {
        self.conditions.as_ref().is_some_and(|conditions| {
            conditions.degradation.alert_delivered || conditions.episode.completed.is_some()
        })
    }

    pub fn completed_episode(&self) -> Option<&CompletedEpisodeRecord> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.episode.completed.as_ref())
    }
}

/// Identity of a sample inside the rolling buffer.
///
/// Sequenced samples are identified by `(session_id, sequence)`; samples
/// without a sequence fall back to their millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SampleKey {
    Sequenced {
        session_id: Option<String>,
        sequence: u64,
    },
    Timestamp(i64),
}

/// Epoch progress and slot timing. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    /// Percentage of the epoch elapsed, 0.0 to 100.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_remaining_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_duration_ms: Option<u64>,
}

/// Condition trackers embedded in a sample by the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub validator_offline: PersistentCondition,
    pub credits_stagnant: PersistentCondition,
    pub network_halted: PersistentCondition,
    pub degradation: TemporalDegradation,
    pub episode: DivergenceEpisode,
}

impl ConditionSnapshot {
    pub fn persistent(&self) -> [(ConditionKind, &PersistentCondition); 3] {
        [
            (ConditionKind::ValidatorOffline, &self.validator_offline),
            (ConditionKind::CreditsStagnant, &self.credits_stagnant),
            (ConditionKind::NetworkHalted, &self.network_halted),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    ValidatorOffline,
    CreditsStagnant,
    NetworkHalted,
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionKind::ValidatorOffline => "validator-offline",
            ConditionKind::CreditsStagnant => "credits-stagnant",
            ConditionKind::NetworkHalted => "network-halted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPhase {
    #[default]
    Idle,
    Detecting,
    Active,
    Recovering,
}

/// A condition that must persist for `threshold` consecutive cycles before
/// the source raises it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentCondition {
    pub phase: ConditionPhase,
    pub consecutive: u32,
    pub threshold: u32,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    None,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMetric {
    VoteLag,
    RootLag,
    CreditRate,
}

/// Aggregated severity over three degradation metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalDegradation {
    pub level: DegradationLevel,
    #[serde(default)]
    pub alert_delivered: bool,
    pub reset_threshold: u32,
    pub metrics: DegradationMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationMetrics {
    pub vote_lag: MetricState,
    pub root_lag: MetricState,
    pub credit_rate: MetricState,
}

impl DegradationMetrics {
    pub fn iter(&self) -> impl Iterator<Item = (DegradationMetric, &MetricState)> {
        [
            (DegradationMetric::VoteLag, &self.vote_lag),
            (DegradationMetric::RootLag, &self.root_lag),
            (DegradationMetric::CreditRate, &self.credit_rate),
        ]
        .into_iter()
    }

    pub fn all_clear(&self) -> bool {
        self.iter().all(|(_, state)| state.consecutive == 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricState {
    pub degraded: bool,
    pub consecutive: u32,
    pub warning_threshold: u32,
    pub critical_threshold: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodePhase {
    #[default]
    Idle,
    Stabilizing,
    RankSampling,
    Confirmed,
}

/// Divergence episode tracker as reported by the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceEpisode {
    pub phase: EpisodePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<u64>,
    #[serde(
        default,
        with = "timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub loops_since_detection: u32,
    #[serde(default)]
    pub settle_wait_threshold: u32,
    #[serde(default)]
    pub stable_confirm_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_gap: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_gap: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<CompletedEpisodeRecord>,
}

impl DivergenceEpisode {
    /// Fraction of the detection window elapsed, in `[0, 1]`.
    ///
    /// Only defined while the episode is stabilizing or sampling rank.
    pub fn progress(&self) -> Option<f64> {
        match self.phase {
            EpisodePhase::Stabilizing | EpisodePhase::RankSampling => {
                let window = self
                    .settle_wait_threshold
                    .saturating_add(self.stable_confirm_threshold);
                if window == 0 {
                    return None;
                }
                let ratio = f64::from(self.loops_since_detection) / f64::from(window);
                Some(ratio.clamp(0.0, 1.0))
            }
            EpisodePhase::Idle | EpisodePhase::Confirmed => None,
        }
    }
}

/// Durable summary of a finished episode. The source keeps reporting the same
/// record until a new episode completes with a different id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedEpisodeRecord {
    pub episode_id: u64,
    #[serde(with = "timestamp")]
    pub detected_at: DateTime<Utc>,
    pub initial_loss: i64,
    pub stabilized_loss: i64,
    pub baseline_gap: i64,
    pub stabilized_gap: i64,
    pub stabilization_cycles: u32,
}

/// Timestamps arrive either as unix seconds (integer or fractional) or as an
/// RFC 3339 string. They are written back as RFC 3339 with millisecond
/// precision.
pub(crate) mod timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    pub fn from_unix_seconds(seconds: f64) -> Option<DateTime<Utc>> {
        if !seconds.is_finite() {
            return None;
        }
        let millis = (seconds * 1000.0).round();
        if millis < i64::MIN as f64 || millis > i64::MAX as f64 {
            return None;
        }
        Utc.timestamp_millis_opt(millis as i64).single()
    }

    fn parse<E: Error>(raw: Raw) -> Result<DateTime<Utc>, E> {
        match raw {
            Raw::Seconds(seconds) => from_unix_seconds(seconds)
                .ok_or_else(|| E::custom(format!("timestamp {seconds} is out of range"))),
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|err| E::custom(format!("invalid timestamp {text:?}: {err}"))),
        }
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<Raw>::deserialize(deserializer)?
                .map(parse)
                .transpose()
        }
    }
}
