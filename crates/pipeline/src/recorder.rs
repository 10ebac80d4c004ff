//! Durable history of completed divergence episodes.
//!
//! Incidents are kept in memory and, when a path is configured, mirrored to a
//! JSON Lines file (one incident per line). The file is rewritten on every
//! mutation through a temporary file and a rename, so readers never observe a
//! half-written history.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sample::{CompletedEpisodeRecord, timestamp};

pub const DEFAULT_CYCLE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("incident file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode incident: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no incident at index {index} (history has {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// One completed episode as kept in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// When the episode was detected.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub episode_id: u64,
    pub initial_loss: i64,
    pub stabilized_loss: i64,
    pub baseline_gap: i64,
    pub stabilized_gap: i64,
    pub detection_duration_ms: u64,
}

impl Incident {
    pub fn from_record(record: &CompletedEpisodeRecord, cycle_period: Duration) -> Self {
        let cycle_ms = u64::try_from(cycle_period.as_millis()).unwrap_or(u64::MAX);
        Self {
            timestamp: record.detected_at,
            episode_id: record.episode_id,
            initial_loss: record.initial_loss,
            stabilized_loss: record.stabilized_loss,
            baseline_gap: record.baseline_gap,
            stabilized_gap: record.stabilized_gap,
            detection_duration_ms: u64::from(record.stabilization_cycles).saturating_mul(cycle_ms),
        }
    }
}

#[derive(Debug)]
pub struct IncidentRecorder {
    incidents: Vec<Incident>,
    last_episode_id: Option<u64>,
    total_stabilized_loss: i64,
    cycle_period: Duration,
    path: Option<PathBuf>,
}

impl IncidentRecorder {
    /// In-memory recorder.
    pub fn new(cycle_period: Duration) -> Self {
        Self {
            incidents: Vec::new(),
            last_episode_id: None,
            total_stabilized_loss: 0,
            cycle_period,
            path: None,
        }
    }

    /// Recorder backed by `path`. Existing incidents are loaded; malformed
    /// lines are skipped. A missing file starts an empty history.
    pub fn open(path: impl Into<PathBuf>, cycle_period: Duration) -> Result<Self, RecorderError> {
        let path = path.into();
        let incidents = read_incidents(&path)?;

        let mut recorder = Self::new(cycle_period);
        recorder.last_episode_id = incidents.last().map(|incident| incident.episode_id);
        recorder.incidents = incidents;
        recorder.recompute_total();
        recorder.path = Some(path);

        debug!(
            incidents = recorder.incidents.len(),
            last_episode_id = ?recorder.last_episode_id,
            "loaded incident history"
        );
        Ok(recorder)
    }

    pub fn incidents(&self) -> &[Incident] {
        &self.incidents
    }

    pub fn total_stabilized_loss(&self) -> i64 {
        self.total_stabilized_loss
    }

    pub fn last_episode_id(&self) -> Option<u64> {
        self.last_episode_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record `record` if its episode id differs from the last one observed.
    ///
    /// The source repeats the same record on every sample until the next
    /// episode completes, so equality of ids is the only novelty test.
    pub fn observe(&mut self, record: &CompletedEpisodeRecord) -> Option<Incident> {
        if self.last_episode_id == Some(record.episode_id) {
            return None;
        }
        self.last_episode_id = Some(record.episode_id);

        let incident = Incident::from_record(record, self.cycle_period);
        self.incidents.push(incident.clone());
        self.recompute_total();
        info!(
            episode_id = incident.episode_id,
            stabilized_loss = incident.stabilized_loss,
            detection_duration_ms = incident.detection_duration_ms,
            "incident recorded"
        );

        if let Err(err) = self.persist() {
            warn!(error = %err, "failed to persist incident history");
        }
        Some(incident)
    }

    /// Remove the incident at `index` (oldest first).
    pub fn remove(&mut self, index: usize) -> Result<Incident, RecorderError> {
        if index >= self.incidents.len() {
            return Err(RecorderError::IndexOutOfRange {
                index,
                len: self.incidents.len(),
            });
        }
        let removed = self.incidents.remove(index);
        self.recompute_total();
        self.persist()?;
        Ok(removed)
    }

    /// Drop every incident. The last-seen episode id is kept so the record
    /// still reported by the source is not recorded again.
    pub fn reset(&mut self) -> Result<usize, RecorderError> {
        let cleared = self.incidents.len();
        self.incidents.clear();
        self.recompute_total();
        self.persist()?;
        Ok(cleared)
    }

    fn recompute_total(&mut self) {
        self.total_stabilized_loss = self
            .incidents
            .iter()
            .fold(0i64, |total, incident| total.saturating_add(incident.stabilized_loss));
    }

    fn persist(&self) -> Result<(), RecorderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_incidents(path, &self.incidents)
    }
}

fn read_incidents(path: &Path) -> Result<Vec<Incident>, RecorderError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RecorderError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };

    let mut incidents = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| RecorderError::Io {
            path: path.to_owned(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Incident>(trimmed) {
            Ok(incident) => incidents.push(incident),
            Err(err) => warn!(line = number + 1, error = %err, "skipping malformed incident"),
        }
    }
    Ok(incidents)
}

fn write_incidents(path: &Path, incidents: &[Incident]) -> Result<(), RecorderError> {
    let io_err = |source| RecorderError::Io {
        path: path.to_owned(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = path.with_extension("jsonl.tmp");
    let mut writer = BufWriter::new(File::create(&tmp).map_err(io_err)?);
    for incident in incidents {
        let json = serde_json::to_string(incident)?;
        writeln!(writer, "{json}").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    drop(writer);

    fs::rename(&tmp, path).map_err(io_err)
}
