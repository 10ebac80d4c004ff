//! Telemetry ingestion and reconciliation pipeline.
//!
//! A reconnecting stream of per-cycle [`Sample`]s feeds a fixed-capacity
//! [`RollingBuffer`]. Sequence gaps are backfilled on demand, a periodic
//! sweep re-fetches a stale tail, and a [`TimeWindowCompositor`] combines a
//! one-shot historical fetch with the live tail for longer windows. Every new
//! tail sample is run through the [`AlertStateInterpreter`], and completed
//! divergence episodes end up in the [`IncidentRecorder`].
//!
//! [`spawn_pipeline`] ties the pieces together on a single event loop;
//! [`PipelineHandle`] is the caller-facing API.

pub mod backend;
pub mod backfill;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod gap;
pub mod interpreter;
pub mod metrics;
pub mod pipeline;
pub mod recorder;
pub mod sample;
pub mod transport;
pub mod window;

pub use backend::{HttpBackend, MissedRange, TelemetryBackend};
pub use buffer::RollingBuffer;
pub use config::PipelineConfig;
pub use error::{BackendError, DecodeError, PipelineError, TransportError};
pub use interpreter::{AlertMarker, AlertStateInterpreter};
pub use pipeline::{
    PipelineEvent, PipelineHandle, PipelineOptions, PipelineState, spawn_from_config,
    spawn_pipeline,
};
pub use recorder::{Incident, IncidentRecorder};
pub use sample::Sample;
pub use transport::{StreamSource, StreamTransport};
pub use window::{TimeWindow, TimeWindowCompositor};
