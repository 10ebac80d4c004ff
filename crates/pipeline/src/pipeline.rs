//! Pipeline orchestration.
//!
//! [`PipelineState`] owns every piece of mutable state (buffer, gap
//! tracking, backfill coordination, window compositor, interpreter and
//! incident history) and exposes synchronous mutation methods.
//! [`spawn_pipeline`] wraps it in a single event loop that interleaves:
//!
//! ```text
//!   transport events ──┐
//!   sweep ticker ──────┤
//!   fetch completions ─┼──> PipelineState ──> PipelineEvent channel
//!   handle commands ───┤
//!   cancellation ──────┘
//! ```
//!
//! Network fetches run as spawned tasks that report back over a channel, so
//! state is only ever touched from the loop. Once the loop stops, late fetch
//! results are dropped with the channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{HttpBackend, MissedRange, TelemetryBackend};
use crate::backfill::{BackfillCoordinator, SweepRange};
use crate::buffer::{Admission, RollingBuffer};
use crate::config::PipelineConfig;
use crate::error::{BackendError, PipelineError, TransportError};
use crate::gap::{GapDetector, GapObservation, SequenceGap};
use crate::interpreter::{AlertMarker, AlertStateInterpreter, Interpretation};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::recorder::{Incident, IncidentRecorder, RecorderError};
use crate::sample::Sample;
use crate::transport::{ConnectionState, ConnectionStatus, HttpStreamSource, StreamTransport, TransportEvent};
use crate::window::{HistoryRequest, TimeWindow, TimeWindowCompositor, WindowView};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Tunables for [`PipelineState`] and the event loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub capacity: usize,
    pub seed_lookback: Duration,
    pub sweep_interval: Duration,
    pub staleness_threshold: Duration,
    pub max_points: usize,
    /// Window selected once the seed fetch has completed.
    pub initial_window: TimeWindow,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            capacity: crate::buffer::DEFAULT_CAPACITY,
            seed_lookback: Duration::from_secs(300),
            sweep_interval: crate::backfill::DEFAULT_SWEEP_INTERVAL,
            staleness_threshold: crate::backfill::DEFAULT_STALENESS_THRESHOLD,
            max_points: crate::window::DEFAULT_MAX_POINTS,
            initial_window: TimeWindow::Live,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            capacity: config.buffer.capacity,
            seed_lookback: config.seed_lookback(),
            sweep_interval: config.sweep_interval(),
            staleness_threshold: config.staleness_threshold(),
            max_points: config.window.max_points,
            initial_window: config.initial_window()?,
        })
    }
}

/// What admitting one live sample produced.
#[derive(Debug, Default)]
pub struct LiveOutcome {
    pub admitted: bool,
    /// Gap whose backfill the caller must start.
    pub backfill: Option<SequenceGap>,
    /// Present when the sample became the new tail and was interpreted.
    pub interpretation: Option<Interpretation>,
    pub incident: Option<Incident>,
}

pub struct PipelineState {
    buffer: RollingBuffer,
    gaps: GapDetector,
    backfill: BackfillCoordinator,
    compositor: TimeWindowCompositor,
    interpreter: AlertStateInterpreter,
    recorder: IncidentRecorder,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineState {
    pub fn new(options: &PipelineOptions, recorder: IncidentRecorder, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            buffer: RollingBuffer::new(options.capacity),
            gaps: GapDetector::new(),
            backfill: BackfillCoordinator::new(options.staleness_threshold),
            compositor: TimeWindowCompositor::new(options.max_points),
            interpreter: AlertStateInterpreter::new(),
            recorder,
            metrics,
        }
    }

    pub fn buffer(&self) -> &RollingBuffer {
        &self.buffer
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn incidents(&self) -> &[Incident] {
        self.recorder.incidents()
    }

    pub fn total_stabilized_loss(&self) -> i64 {
        self.recorder.total_stabilized_loss()
    }

    /// Primary path for samples received from the stream.
    pub fn admit_live(&mut self, sample: Sample) -> LiveOutcome {
        let mut outcome = LiveOutcome::default();

        let would_be_tail = self
            .buffer
            .tail_timestamp()
            .is_none_or(|tail| sample.timestamp > tail);
        if would_be_tail && self.gaps.is_stale(&sample) {
            debug!(
                key = ?sample.key(),
                last = ?self.gaps.last_sequence(),
                "ignoring live sample whose sequence went backwards"
            );
            return outcome;
        }

        let admission = self.buffer.push(sample.clone());
        if admission == Admission::Rejected {
            debug!(key = ?sample.key(), "ignoring duplicate live sample");
            return outcome;
        }
        outcome.admitted = true;
        self.metrics.increment_samples_admitted();

        match self.gaps.observe(&sample) {
            GapObservation::Gap(gap) => {
                self.metrics.increment_gaps_detected();
                if self.backfill.try_begin(&gap) {
                    info!(from = gap.from, to = gap.to, missing = gap.missing(), "sequence gap detected");
                    outcome.backfill = Some(gap);
                } else {
                    self.metrics.increment_gaps_dropped();
                    debug!(
                        from = gap.from,
                        to = gap.to,
                        "backfill already in flight, leaving gap to the sweep"
                    );
                }
            }
            GapObservation::SessionReset { previous } => {
                info!(
                    previous = previous.as_deref().unwrap_or("-"),
                    session = sample.session_id.as_deref().unwrap_or("-"),
                    "telemetry session changed, sequence tracking reset"
                );
            }
            GapObservation::Untracked
            | GapObservation::Started
            | GapObservation::Contiguous
            | GapObservation::Stale => {}
        }

        if let Admission::Appended { .. } = admission {
            outcome.interpretation = Some(self.interpreter.interpret(&sample, &self.buffer));
            if let Some(record) = sample.completed_episode() {
                outcome.incident = self.recorder.observe(record);
                if outcome.incident.is_some() {
                    self.metrics.increment_incidents_recorded();
                }
            }
        }

        outcome
    }

    /// Merge the startup fetch and seed sequence tracking from it.
    pub fn apply_seed(&mut self, samples: Vec<Sample>) -> usize {
        let merged = self.buffer.merge_sorted(samples);
        self.gaps.prime(self.buffer.iter());
        self.metrics.add_samples_merged(merged as u64);
        debug!(merged, buffered = self.buffer.len(), "buffer seeded from history");
        merged
    }

    /// Merge a missed-range response and release the backfill slot.
    pub fn apply_backfill(&mut self, result: Result<MissedRange, BackendError>) -> usize {
        let gap = self.backfill.finish();
        match result {
            Ok(MissedRange::Samples(samples)) => {
                let merged = self.buffer.merge_backfill(samples);
                self.metrics.increment_backfills_merged();
                self.metrics.add_samples_merged(merged as u64);
                debug!(?gap, merged, "backfill merged");
                merged
            }
            Ok(MissedRange::Unavailable) => {
                self.metrics.increment_backfills_unavailable();
                info!(?gap, "missed range no longer available, leaving it to the sweep");
                0
            }
            Err(err) => {
                warn!(?gap, error = %err, "backfill fetch failed");
                0
            }
        }
    }

    /// Claim the sweep slot if the buffer tail is stale.
    pub fn begin_sweep(&mut self, now: DateTime<Utc>) -> Option<SweepRange> {
        let range = self.backfill.begin_sweep(self.buffer.tail_timestamp(), now)?;
        self.metrics.increment_sweeps_run();
        Some(range)
    }

    pub fn apply_sweep(&mut self, range: SweepRange, result: Result<Vec<Sample>, BackendError>) -> usize {
        self.backfill.finish_sweep();
        match result {
            Ok(samples) => {
                let merged = self.buffer.merge_sorted(range.retain(samples));
                self.metrics.add_samples_merged(merged as u64);
                debug!(merged, start = %range.start, end = %range.end, "sweep merged");
                merged
            }
            Err(err) => {
                warn!(error = %err, "sweep fetch failed, retrying at next interval");
                0
            }
        }
    }

    pub fn select_window(&mut self, window: TimeWindow, now: DateTime<Utc>) -> Option<HistoryRequest> {
        let request = self.compositor.select(window, self.buffer.tail_timestamp(), now)?;
        self.metrics.increment_window_fetches();
        Some(request)
    }

    pub fn apply_window_history(&mut self, generation: u64, result: Result<Vec<Sample>, BackendError>) -> bool {
        match result {
            Ok(samples) => self.compositor.apply_history(generation, samples),
            Err(err) => {
                warn!(error = %err, generation, "window history fetch failed, showing live samples only");
                self.compositor.fail_history(generation)
            }
        }
    }

    pub fn window_view(&self) -> WindowView {
        self.compositor.view(&self.buffer)
    }

    pub fn remove_incident(&mut self, index: usize) -> Result<Incident, RecorderError> {
        self.recorder.remove(index)
    }

    pub fn reset_incidents(&mut self) -> Result<usize, RecorderError> {
        self.recorder.reset()
    }
}

/// Events delivered to the pipeline's owner.
#[derive(Debug)]
pub enum PipelineEvent {
    Connection(ConnectionStatus),
    Markers {
        timestamp: DateTime<Utc>,
        markers: Vec<AlertMarker>,
        episode_progress: Option<f64>,
    },
    IncidentRecorded(Incident),
    /// The transport gave up; no further connection events follow.
    Terminal(TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncidentSummary {
    pub incidents: Vec<Incident>,
    pub total_stabilized_loss: i64,
}

enum Command {
    SelectWindow {
        window: TimeWindow,
        reply: oneshot::Sender<bool>,
    },
    View {
        reply: oneshot::Sender<WindowView>,
    },
    Incidents {
        reply: oneshot::Sender<IncidentSummary>,
    },
    RemoveIncident {
        index: usize,
        reply: oneshot::Sender<Result<Incident, RecorderError>>,
    },
    ResetIncidents {
        reply: oneshot::Sender<Result<usize, RecorderError>>,
    },
}

enum FetchResult {
    Seed(Result<Vec<Sample>, BackendError>),
    Backfill(Result<MissedRange, BackendError>),
    Sweep(SweepRange, Result<Vec<Sample>, BackendError>),
    Window(u64, Result<Vec<Sample>, BackendError>),
}

/// Caller side of a running pipeline.
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Switch the displayed window. Returns whether a historical fetch was
    /// issued for it.
    pub async fn select_window(&self, window: TimeWindow) -> Result<bool, PipelineError> {
        self.request(|reply| Command::SelectWindow { window, reply }).await
    }

    pub async fn window_view(&self) -> Result<WindowView, PipelineError> {
        self.request(|reply| Command::View { reply }).await
    }

    pub async fn incidents(&self) -> Result<IncidentSummary, PipelineError> {
        self.request(|reply| Command::Incidents { reply }).await
    }

    pub async fn remove_incident(&self, index: usize) -> Result<Incident, PipelineError> {
        Ok(self
            .request(|reply| Command::RemoveIncident { index, reply })
            .await??)
    }

    pub async fn reset_incidents(&self) -> Result<usize, PipelineError> {
        Ok(self.request(|reply| Command::ResetIncidents { reply }).await??)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the event loop and the transport and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "pipeline task ended abnormally");
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PipelineError::Closed)?;
        response.await.map_err(|_| PipelineError::Closed)
    }
}

/// Start the event loop. The transport is connected immediately and the
/// buffer is seeded from `[now - seed_lookback, now]`.
pub fn spawn_pipeline(
    state: PipelineState,
    transport: StreamTransport,
    backend: Arc<dyn TelemetryBackend>,
    options: &PipelineOptions,
    cancel: CancellationToken,
) -> (PipelineHandle, mpsc::Receiver<PipelineEvent>) {
    let (events, event_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (commands, command_receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (fetches, fetch_receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let metrics = Arc::clone(state.metrics());
    let transport_events = transport.connect(cancel.child_token());

    let event_loop = EventLoop {
        state,
        backend,
        events,
        fetches,
        cancel: cancel.clone(),
        pending_window: Some(options.initial_window).filter(|window| *window != TimeWindow::Live),
    };
    let task = tokio::spawn(event_loop.run(
        transport_events,
        command_receiver,
        fetch_receiver,
        options.clone(),
    ));

    let handle = PipelineHandle {
        commands,
        metrics,
        cancel,
        task,
    };
    (handle, event_receiver)
}

/// Wire the HTTP stream source, the HTTP backend and the incident history
/// described by `config`, then start the pipeline.
pub fn spawn_from_config(
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> Result<(PipelineHandle, mpsc::Receiver<PipelineEvent>), PipelineError> {
    config.validate()?;
    let options = PipelineOptions::from_config(config)?;
    let resolver = config.resolver()?;

    let recorder = match &config.recorder.incidents_path {
        Some(path) => IncidentRecorder::open(path, config.cycle_period())?,
        None => IncidentRecorder::new(config.cycle_period()),
    };
    let state = PipelineState::new(&options, recorder, Arc::new(PipelineMetrics::new()));

    let policy = config.reconnect_policy();
    let source = Arc::new(HttpStreamSource::new(policy.connect_timeout));
    let transport = StreamTransport::new(source, Arc::clone(&resolver), policy);
    let backend = Arc::new(HttpBackend::new(resolver, config.request_timeout()));

    Ok(spawn_pipeline(state, transport, backend, &options, cancel))
}

struct EventLoop {
    state: PipelineState,
    backend: Arc<dyn TelemetryBackend>,
    events: mpsc::Sender<PipelineEvent>,
    fetches: mpsc::Sender<FetchResult>,
    cancel: CancellationToken,
    pending_window: Option<TimeWindow>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut fetch_results: mpsc::Receiver<FetchResult>,
        options: PipelineOptions,
    ) {
        self.start_seed(options.seed_lookback);

        let mut sweep = tokio::time::interval_at(
            Instant::now() + options.sweep_interval,
            options.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = transport.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport(event),
                    None => transport_open = false,
                },
                Some(result) = fetch_results.recv() => self.handle_fetch(result),
                _ = sweep.tick() => self.start_sweep(),
            }
        }

        debug!("pipeline event loop stopped");
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(status) => {
                if status.state == ConnectionState::Reconnecting {
                    self.state.metrics().increment_reconnects();
                }
                self.emit(PipelineEvent::Connection(status));
            }
            TransportEvent::Sample(sample) => self.handle_sample(*sample),
            TransportEvent::FrameDropped(_) => self.state.metrics().increment_frames_dropped(),
            TransportEvent::Terminal(error) => self.emit(PipelineEvent::Terminal(error)),
        }
    }

    fn handle_sample(&mut self, sample: Sample) {
        let timestamp = sample.timestamp;
        let outcome = self.state.admit_live(sample);

        if let Some(gap) = outcome.backfill {
            let backend = Arc::clone(&self.backend);
            self.spawn_fetch(async move {
                FetchResult::Backfill(backend.missed_range(gap.from, gap.to).await)
            });
        }

        if let Some(interpretation) = outcome.interpretation {
            if !interpretation.markers.is_empty() || interpretation.episode_progress.is_some() {
                for marker in &interpretation.markers {
                    debug!(%timestamp, %marker, "alert marker");
                }
                self.emit(PipelineEvent::Markers {
                    timestamp,
                    markers: interpretation.markers,
                    episode_progress: interpretation.episode_progress,
                });
            }
        }

        if let Some(incident) = outcome.incident {
            self.emit(PipelineEvent::IncidentRecorded(incident));
        }
    }

    fn handle_fetch(&mut self, result: FetchResult) {
        match result {
            FetchResult::Seed(result) => {
                match result {
                    Ok(samples) => {
                        self.state.apply_seed(samples);
                    }
                    Err(err) => warn!(error = %err, "seed fetch failed, starting from live samples"),
                }
                if let Some(window) = self.pending_window.take() {
                    self.select_window(window);
                }
            }
            FetchResult::Backfill(result) => {
                self.state.apply_backfill(result);
            }
            FetchResult::Sweep(range, result) => {
                self.state.apply_sweep(range, result);
            }
            FetchResult::Window(generation, result) => {
                if !self.state.apply_window_history(generation, result) {
                    debug!(generation, "discarding history for a superseded window");
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SelectWindow { window, reply } => {
                // an explicit selection overrides the configured initial one
                self.pending_window = None;
                let _ = reply.send(self.select_window(window));
            }
            Command::View { reply } => {
                let _ = reply.send(self.state.window_view());
            }
            Command::Incidents { reply } => {
                let _ = reply.send(IncidentSummary {
                    incidents: self.state.incidents().to_vec(),
                    total_stabilized_loss: self.state.total_stabilized_loss(),
                });
            }
            Command::RemoveIncident { index, reply } => {
                let _ = reply.send(self.state.remove_incident(index));
            }
            Command::ResetIncidents { reply } => {
                let _ = reply.send(self.state.reset_incidents());
            }
        }
    }

    fn select_window(&mut self, window: TimeWindow) -> bool {
        let Some(request) = self.state.select_window(window, Utc::now()) else {
            return false;
        };
        info!(%window, start = %request.start, end = %request.end, "fetching window history");
        let backend = Arc::clone(&self.backend);
        self.spawn_fetch(async move {
            let result = backend.history_range(request.start, request.end).await;
            FetchResult::Window(request.generation, result)
        });
        true
    }

    fn start_seed(&self, lookback: Duration) {
        let end = Utc::now();
        let start = TimeDelta::from_std(lookback)
            .ok()
            .and_then(|delta| end.checked_sub_signed(delta))
            .unwrap_or(end);
        let backend = Arc::clone(&self.backend);
        self.spawn_fetch(async move { FetchResult::Seed(backend.history_range(start, end).await) });
    }

    fn start_sweep(&mut self) {
        let Some(range) = self.state.begin_sweep(Utc::now()) else {
            return;
        };
        debug!(start = %range.start, end = %range.end, "buffer tail is stale, sweeping");
        let backend = Arc::clone(&self.backend);
        self.spawn_fetch(async move {
            let result = backend.history_range(range.start, range.end).await;
            FetchResult::Sweep(range, result)
        });
    }

    /// Run `fetch` off the loop. The result is dropped if the pipeline is
    /// disposed first.
    fn spawn_fetch<F>(&self, fetch: F)
    where
        F: Future<Output = FetchResult> + Send + 'static,
    {
        let results = self.fetches.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = fetch => {
                    let _ = results.send(result).await;
                }
            }
        });
    }

    fn emit(&self, event: PipelineEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event consumer is lagging, dropping pipeline event");
            }
        }
    }
}
