use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use pulsewatch_pipeline::{
    backend::{MissedRange, TelemetryBackend},
    error::{BackendError, TransportError},
    interpreter::{AlertMarker, RecoveryOutcome},
    pipeline::{PipelineEvent, PipelineHandle, PipelineOptions, PipelineState, spawn_pipeline},
    recorder::IncidentRecorder,
    sample::{
        CompletedEpisodeRecord, ConditionSnapshot, DegradationLevel, EpisodePhase, EpochProgress,
        Sample,
    },
    metrics::PipelineMetrics,
    transport::{
        ByteStream, ConnectionState, Endpoint, ReconnectPolicy, StaticEndpoint, StreamSource,
        StreamTransport,
    },
    window::TimeWindow,
};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp() - 3_600, 0).expect("valid timestamp")
}

fn sample(session: &str, sequence: u64, timestamp: DateTime<Utc>) -> Sample {
    Sample {
        session_id: Some(session.to_owned()),
        sequence: Some(sequence),
        timestamp,
        rank: 12,
        vote_distance: 1,
        root_distance: 31,
        credits: 1_000,
        credits_delta: 16,
        reference_credits: 1_004,
        reference_credits_delta: 16,
        gap_to_leader: -40,
        gap_to_top10: -5,
        gap_to_top100: 12,
        gap_to_reference: -10,
        conditions: None,
        epoch: EpochProgress::default(),
    }
}

fn at(base: DateTime<Utc>, second: i64) -> DateTime<Utc> {
    base + TimeDelta::seconds(second)
}

/// Stream whose frames are pushed by the test. Later connection attempts
/// hang so the transport never reconnects.
struct ChannelSource {
    frames: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    reject: Option<u16>,
}

impl ChannelSource {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<Bytes>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            frames: Mutex::new(Some(receiver)),
            reject: None,
        });
        (source, sender)
    }

    fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(None),
            reject: Some(status),
        })
    }
}

#[async_trait::async_trait]
impl StreamSource for ChannelSource {
    async fn open(&self, _endpoint: &Endpoint) -> Result<ByteStream, TransportError> {
        if let Some(status) = self.reject {
            return Err(TransportError::Unauthorized { status });
        }
        let receiver = match self.frames.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        Ok(match receiver {
            Some(receiver) => futures::stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|chunk| (Ok(chunk), receiver))
            })
            .boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

#[derive(Default)]
struct MockBackend {
    history: Vec<Sample>,
    missed: Vec<Sample>,
    missed_gate: Option<Arc<Semaphore>>,
    history_calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    missed_calls: Mutex<Vec<(u64, u64)>>,
}

impl MockBackend {
    fn history_calls(&self) -> usize {
        self.history_calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn missed_calls(&self) -> Vec<(u64, u64)> {
        self.missed_calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TelemetryBackend for MockBackend {
    async fn history_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, BackendError> {
        if let Ok(mut calls) = self.history_calls.lock() {
            calls.push((start, end));
        }
        Ok(self
            .history
            .iter()
            .filter(|sample| start <= sample.timestamp && sample.timestamp <= end)
            .cloned()
            .collect())
    }

    async fn history_hours(&self, hours: u32) -> Result<Vec<Sample>, BackendError> {
        let end = Utc::now();
        self.history_range(end - TimeDelta::hours(i64::from(hours)), end).await
    }

    async fn missed_range(&self, from: u64, to: u64) -> Result<MissedRange, BackendError> {
        if let Ok(mut calls) = self.missed_calls.lock() {
            calls.push((from, to));
        }
        if let Some(gate) = &self.missed_gate {
            let _permit = gate.acquire().await;
        }
        Ok(MissedRange::Samples(
            self.missed
                .iter()
                .filter(|sample| sample.sequence.is_some_and(|seq| from <= seq && seq <= to))
                .cloned()
                .collect(),
        ))
    }
}

struct Harness {
    handle: PipelineHandle,
    events: mpsc::Receiver<PipelineEvent>,
    frames: mpsc::UnboundedSender<Bytes>,
    backend: Arc<MockBackend>,
}

impl Harness {
    fn start(backend: MockBackend) -> Self {
        Self::start_with(backend, IncidentRecorder::new(Duration::from_secs(2)))
    }

    fn start_with(backend: MockBackend, recorder: IncidentRecorder) -> Self {
        let (source, frames) = ChannelSource::new();
        let backend = Arc::new(backend);
        let (handle, events) = start_pipeline(source, Arc::clone(&backend), recorder);
        Self {
            handle,
            events,
            frames,
            backend,
        }
    }

    fn send(&self, sample: &Sample) {
        let frame = format!("{}\n", serde_json::to_string(sample).expect("sample serializes"));
        self.frames.send(Bytes::from(frame)).expect("stream open");
    }

    /// Poll the live view until `done` holds for the buffered samples.
    async fn buffer_until(&self, done: impl Fn(&[Sample]) -> bool) -> Vec<Sample> {
        tokio::time::timeout(WAIT, async {
            loop {
                let view = self.handle.window_view().await.expect("pipeline running");
                if done(&view.samples) {
                    return view.samples;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time")
    }

    async fn markers_until(&mut self, count: usize) -> Vec<AlertMarker> {
        let mut markers = Vec::new();
        tokio::time::timeout(WAIT, async {
            while markers.len() < count {
                match self.events.recv().await {
                    Some(PipelineEvent::Markers { markers: batch, .. }) => markers.extend(batch),
                    Some(_) => {}
                    None => break,
                }
            }
        })
        .await
        .expect("markers in time");
        markers
    }
}

fn start_pipeline(
    source: Arc<ChannelSource>,
    backend: Arc<MockBackend>,
    recorder: IncidentRecorder,
) -> (PipelineHandle, mpsc::Receiver<PipelineEvent>) {
    let options = PipelineOptions {
        sweep_interval: Duration::from_secs(3_600),
        ..PipelineOptions::default()
    };
    let state = PipelineState::new(&options, recorder, Arc::new(PipelineMetrics::new()));
    let endpoint = StaticEndpoint(Endpoint {
        base_url: Url::parse("http://telemetry.test").expect("valid url"),
        credential: None,
    });
    let transport = StreamTransport::new(source, Arc::new(endpoint), ReconnectPolicy::default());
    spawn_pipeline(state, transport, backend, &options, CancellationToken::new())
}

fn sequences(samples: &[Sample]) -> Vec<u64> {
    samples.iter().filter_map(|sample| sample.sequence).collect()
}

#[tokio::test]
async fn gap_is_backfilled_once_while_outstanding() {
    let base = base_time();
    let gate = Arc::new(Semaphore::new(0));
    let backend = MockBackend {
        missed: (12..=16).map(|seq| sample("s1", seq, at(base, seq as i64))).collect(),
        missed_gate: Some(Arc::clone(&gate)),
        ..MockBackend::default()
    };
    let harness = Harness::start(backend);

    for seq in [10, 11, 14, 17] {
        harness.send(&sample("s1", seq, at(base, seq as i64)));
    }
    harness.buffer_until(|samples| samples.len() == 4).await;

    assert_eq!(harness.backend.missed_calls(), vec![(12, 13)]);
    gate.add_permits(1);

    let buffered = harness.buffer_until(|samples| samples.len() == 6).await;
    assert_eq!(sequences(&buffered), vec![10, 11, 12, 13, 14, 17]);
    assert_eq!(harness.backend.missed_calls(), vec![(12, 13)]);

    let metrics = harness.handle.metrics();
    assert_eq!(metrics.gaps_detected, 2);
    assert_eq!(metrics.gaps_dropped, 1);
    assert_eq!(metrics.backfills_merged, 1);

    harness.handle.shutdown().await;
}

#[tokio::test]
async fn session_change_raises_no_gap() {
    let base = base_time();
    let harness = Harness::start(MockBackend::default());

    let samples = [
        sample("s1", 40, at(base, 0)),
        sample("s1", 41, at(base, 2)),
        sample("s2", 1, at(base, 4)),
        sample("s2", 2, at(base, 6)),
    ];
    for sample in &samples {
        harness.send(sample);
    }

    let buffered = harness.buffer_until(|samples| samples.len() == 4).await;

    assert_eq!(sequences(&buffered), vec![40, 41, 1, 2]);
    assert!(harness.backend.missed_calls().is_empty());
    assert_eq!(harness.handle.metrics().gaps_detected, 0);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn buffer_keeps_the_newest_samples() {
    let base = base_time();
    let harness = Harness::start(MockBackend::default());

    for seq in 1..=65 {
        harness.send(&sample("s1", seq, at(base, seq as i64)));
    }

    let buffered = harness
        .buffer_until(|samples| samples.last().and_then(|s| s.sequence) == Some(65))
        .await;

    assert_eq!(buffered.len(), 60);
    assert_eq!(sequences(&buffered), (6..=65).collect::<Vec<_>>());
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn degradation_levels_produce_markers() {
    let base = base_time();
    let mut harness = Harness::start(MockBackend::default());

    let levels = [
        (DegradationLevel::None, false),
        (DegradationLevel::Warning, false),
        (DegradationLevel::Critical, true),
        (DegradationLevel::None, false),
    ];
    for (index, (level, delivered)) in levels.into_iter().enumerate() {
        let mut conditions = ConditionSnapshot::default();
        conditions.degradation.level = level;
        conditions.degradation.alert_delivered = delivered;
        let mut sample = sample("s1", index as u64 + 1, at(base, index as i64 * 2));
        sample.conditions = Some(conditions);
        harness.send(&sample);
    }

    let markers = harness.markers_until(3).await;

    assert_eq!(
        markers,
        vec![
            AlertMarker::WarningPending,
            AlertMarker::CriticalDelivered,
            AlertMarker::DegradationRecovered {
                outcome: RecoveryOutcome::CriticalEscalated
            },
        ]
    );
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn confirmed_episode_becomes_one_persisted_incident() {
    let base = base_time();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("incidents.jsonl");
    let recorder = IncidentRecorder::open(&path, Duration::from_secs(2)).expect("open recorder");
    let mut harness = Harness::start_with(MockBackend::default(), recorder);

    let record = CompletedEpisodeRecord {
        episode_id: 11,
        detected_at: at(base, 12),
        initial_loss: 61,
        stabilized_loss: 58,
        baseline_gap: -180,
        stabilized_gap: -238,
        stabilization_cycles: 9,
    };
    let phases = [
        EpisodePhase::Idle,
        EpisodePhase::Idle,
        EpisodePhase::Idle,
        EpisodePhase::Idle,
        EpisodePhase::Idle,
        EpisodePhase::Idle,
        EpisodePhase::Stabilizing,
        EpisodePhase::Confirmed,
        EpisodePhase::Confirmed,
    ];
    let gaps = [-100, -180, -185, -190, -200, -215, -226, -238, -238];
    for (index, (phase, gap)) in phases.into_iter().zip(gaps).enumerate() {
        let mut conditions = ConditionSnapshot::default();
        conditions.episode.phase = phase;
        if phase != EpisodePhase::Idle {
            conditions.episode.episode_id = Some(11);
        }
        if phase == EpisodePhase::Confirmed {
            conditions.episode.completed = Some(record.clone());
        }
        let mut sample = sample("s1", index as u64 + 1, at(base, index as i64 * 2));
        sample.gap_to_reference = gap;
        sample.conditions = Some(conditions);
        harness.send(&sample);
    }

    let markers = harness.markers_until(2).await;
    assert_eq!(
        markers,
        vec![
            AlertMarker::EpisodeStarted {
                episode_id: Some(11),
                baseline_gap: Some(-180)
            },
            AlertMarker::EpisodeConfirmed {
                episode_id: Some(11),
                loss: Some(58)
            },
        ]
    );

    harness.buffer_until(|samples| samples.len() == 9).await;
    let summary = harness.handle.incidents().await.expect("pipeline running");
    assert_eq!(summary.incidents.len(), 1);
    assert_eq!(summary.total_stabilized_loss, 58);
    assert_eq!(summary.incidents[0].detection_duration_ms, 18_000);
    harness.handle.shutdown().await;

    let reopened = IncidentRecorder::open(&path, Duration::from_secs(2)).expect("reopen");
    assert_eq!(reopened.incidents().len(), 1);
    assert_eq!(reopened.last_episode_id(), Some(11));
}

#[tokio::test]
async fn live_window_never_fetches_and_lookback_fetches_once() {
    let base = base_time();
    let history: Vec<Sample> = (0..120)
        .map(|index| sample("s1", index + 1, at(base, index as i64 * 30)))
        .collect();
    let harness = Harness::start(MockBackend {
        history,
        ..MockBackend::default()
    });

    harness.send(&sample("s1", 500, at(base, 3_600)));
    harness
        .buffer_until(|samples| samples.last().and_then(|s| s.sequence) == Some(500))
        .await;
    // the startup seed is the only fetch so far
    let seed_calls = harness.backend.history_calls();
    assert_eq!(seed_calls, 1);

    for _ in 0..5 {
        harness.handle.window_view().await.expect("view");
    }
    assert!(!harness.handle.select_window(TimeWindow::Live).await.expect("select"));
    assert_eq!(harness.backend.history_calls(), seed_calls);

    let hour = TimeWindow::PRESETS[0];
    assert!(harness.handle.select_window(hour).await.expect("select"));
    let view = tokio::time::timeout(WAIT, async {
        loop {
            let view = harness.handle.window_view().await.expect("view");
            if !view.loading {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history arrives");
    for _ in 0..5 {
        harness.handle.window_view().await.expect("view");
    }
    assert!(!harness.handle.select_window(hour).await.expect("select"));

    assert_eq!(harness.backend.history_calls(), seed_calls + 1);
    assert_eq!(harness.handle.metrics().window_fetches, 1);
    assert_eq!(view.window, hour);
    // 120 historical samples plus the newer live one
    assert_eq!(view.samples.len(), 121);
    assert_eq!(view.samples.last().and_then(|s| s.sequence), Some(500));

    assert!(!harness.handle.select_window(TimeWindow::Live).await.expect("select"));
    assert_eq!(harness.backend.history_calls(), seed_calls + 1);
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn lookback_view_downsamples_and_keeps_alerts() {
    let base = base_time();
    let alert_indices = [7, 301, 302, 650, 899];
    let history: Vec<Sample> = (0..900)
        .map(|index| {
            let mut sample = sample("s1", index + 1, at(base, index as i64 * 4));
            if alert_indices.contains(&index) {
                let mut conditions = ConditionSnapshot::default();
                conditions.degradation.level = DegradationLevel::Warning;
                conditions.degradation.alert_delivered = true;
                sample.conditions = Some(conditions);
            }
            sample
        })
        .collect();
    let harness = Harness::start(MockBackend {
        history,
        ..MockBackend::default()
    });

    harness.send(&sample("s1", 901, at(base, 3_600)));
    harness
        .buffer_until(|samples| samples.last().and_then(|s| s.sequence) == Some(901))
        .await;
    harness
        .handle
        .select_window(TimeWindow::PRESETS[0])
        .await
        .expect("select");

    let view = tokio::time::timeout(WAIT, async {
        loop {
            let view = harness.handle.window_view().await.expect("view");
            if !view.loading {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("history arrives");

    assert!(view.samples.len() <= 300 + alert_indices.len() + 1);
    for index in alert_indices {
        assert!(
            view.samples.iter().any(|s| s.sequence == Some(index + 1)),
            "alert sample {index} dropped"
        );
    }
    assert!(view.samples.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    harness.handle.shutdown().await;
}

#[tokio::test]
async fn authentication_failure_is_terminal() {
    let (handle, mut events) = start_pipeline(
        ChannelSource::rejecting(401),
        Arc::new(MockBackend::default()),
        IncidentRecorder::new(Duration::from_secs(2)),
    );

    let mut statuses = Vec::new();
    let terminal = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(PipelineEvent::Connection(status)) => statuses.push(status.state),
                Some(PipelineEvent::Terminal(error)) => return Some(error),
                Some(_) => {}
                None => return None,
            }
        }
    })
    .await
    .expect("terminal in time");

    assert!(matches!(terminal, Some(TransportError::Unauthorized { status: 401 })));
    assert_eq!(
        statuses,
        vec![ConnectionState::Connecting, ConnectionState::Disconnected]
    );
    assert!(handle.is_running());
    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_event_stream() {
    let mut harness = Harness::start(MockBackend::default());

    harness.handle.shutdown().await;

    let closed = tokio::time::timeout(WAIT, async {
        while harness.events.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}
