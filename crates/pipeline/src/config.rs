//! TOML configuration for the pipeline.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working local setup:
//!
//! ```toml
//! [stream]
//! base_url = "http://127.0.0.1:8080"
//! token_env = "PULSEWATCH_TOKEN"
//! connect_timeout_secs = 30
//! backoff_secs = [2, 4, 8, 16, 32]
//!
//! [buffer]
//! capacity = 60
//! seed_lookback_secs = 300
//!
//! [backfill]
//! sweep_interval_secs = 30
//! staleness_threshold_secs = 5
//!
//! [window]
//! initial = "live"
//! max_points = 300
//!
//! [recorder]
//! cycle_period_ms = 2000
//! incidents_path = "incidents.jsonl"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport::{
    Endpoint, EndpointResolver, EnvCredentialEndpoint, ReconnectPolicy, StaticEndpoint,
};
use crate::window::TimeWindow;

pub const DEFAULT_TOKEN_ENV: &str = "PULSEWATCH_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid base url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub buffer: BufferConfig,
    pub backfill: BackfillConfig,
    pub window: WindowConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub base_url: String,
    /// Environment variable holding the bearer credential. Unset means the
    /// source is unauthenticated.
    pub token_env: Option<String>,
    pub connect_timeout_secs: u64,
    /// Timeout for history and missed-range queries.
    pub request_timeout_secs: u64,
    pub backoff_secs: Vec<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_owned(),
            token_env: Some(DEFAULT_TOKEN_ENV.to_owned()),
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
            backoff_secs: vec![2, 4, 8, 16, 32],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    /// How far back the startup fetch pre-seeds the buffer.
    pub seed_lookback_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::buffer::DEFAULT_CAPACITY,
            seed_lookback_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub sweep_interval_secs: u64,
    pub staleness_threshold_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            staleness_threshold_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// `live` or `<n>m|h|d`.
    pub initial: String,
    pub max_points: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial: "live".to_owned(),
            max_points: crate::window::DEFAULT_MAX_POINTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Duration of one telemetry cycle at the source.
    pub cycle_period_ms: u64,
    pub incidents_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 2_000,
            incidents_path: None,
        }
    }
}

impl PipelineConfig {
    /// Load from `path`, or the defaults when no path is given. The result
    /// is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_url()?;
        self.initial_window()?;
        if self.stream.backoff_secs.is_empty() {
            return Err(invalid("stream.backoff_secs must list at least one delay"));
        }
        if self.stream.connect_timeout_secs == 0 {
            return Err(invalid("stream.connect_timeout_secs must be > 0"));
        }
        if self.stream.request_timeout_secs == 0 {
            return Err(invalid("stream.request_timeout_secs must be > 0"));
        }
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer.capacity must be > 0"));
        }
        if self.backfill.sweep_interval_secs == 0 {
            return Err(invalid("backfill.sweep_interval_secs must be > 0"));
        }
        if self.window.max_points == 0 {
            return Err(invalid("window.max_points must be > 0"));
        }
        if self.recorder.cycle_period_ms == 0 {
            return Err(invalid("recorder.cycle_period_ms must be > 0"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.stream.base_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.stream.base_url.clone(),
            source,
        })
    }

    pub fn initial_window(&self) -> Result<TimeWindow, ConfigError> {
        self.window
            .initial
            .parse()
            .map_err(|err| invalid(format!("window.initial: {err}")))
    }

    /// Endpoint resolver for both the stream and the history queries.
    pub fn resolver(&self) -> Result<Arc<dyn EndpointResolver>, ConfigError> {
        let base_url = self.base_url()?;
        let resolver: Arc<dyn EndpointResolver> = match &self.stream.token_env {
            Some(token_env) => Arc::new(EnvCredentialEndpoint::new(base_url, token_env.clone())),
            None => Arc::new(StaticEndpoint(Endpoint {
                base_url,
                credential: None,
            })),
        };
        Ok(resolver)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: self
                .stream
                .backoff_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.stream.request_timeout_secs)
    }

    pub fn seed_lookback(&self) -> Duration {
        Duration::from_secs(self.buffer.seed_lookback_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.backfill.sweep_interval_secs)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.backfill.staleness_threshold_secs)
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.recorder.cycle_period_ms)
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").expect("valid");

        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.buffer.capacity, 60);
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.cycle_period(), Duration::from_secs(2));
        assert_eq!(config.reconnect_policy().backoff, ReconnectPolicy::default().backoff);
        assert_eq!(config.initial_window().expect("window"), TimeWindow::Live);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [stream]
            base_url = "https://telemetry.example/api/"
            backoff_secs = [1, 1]

            [window]
            initial = "6h"

            [recorder]
            incidents_path = "/var/lib/pulsewatch/incidents.jsonl"
            "#,
        )
        .expect("valid");

        assert_eq!(config.stream.connect_timeout_secs, 30);
        assert_eq!(config.reconnect_policy().max_attempts(), 2);
        assert_eq!(config.initial_window().expect("window"), TimeWindow::PRESETS[1]);
        assert_eq!(config.buffer.seed_lookback_secs, 300);
        assert_eq!(
            config.recorder.incidents_path.as_deref(),
            Some(Path::new("/var/lib/pulsewatch/incidents.jsonl"))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        for (contents, needle) in [
            ("[buffer]\ncapacity = 0", "buffer.capacity"),
            ("[stream]\nbackoff_secs = []", "stream.backoff_secs"),
            ("[backfill]\nsweep_interval_secs = 0", "backfill.sweep_interval_secs"),
            ("[window]\ninitial = \"3w\"", "window.initial"),
            ("[stream]\nbase_url = \"not a url\"", "invalid base url"),
        ] {
            let err = PipelineConfig::from_toml_str(contents).expect_err(contents);
            assert!(err.to_string().contains(needle), "{contents}: {err}");
        }
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            PipelineConfig::from_toml_str("[buffer\ncapacity = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_without_path_returns_defaults() {
        assert_eq!(PipelineConfig::load(None).expect("defaults"), PipelineConfig::default());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");

        assert!(matches!(
            PipelineConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn unauthenticated_source_resolves_without_credential() {
        let config = PipelineConfig {
            stream: StreamConfig {
                token_env: None,
                ..StreamConfig::default()
            },
            ..PipelineConfig::default()
        };

        let endpoint = config.resolver().expect("resolver").resolve().expect("endpoint");

        assert_eq!(endpoint.credential, None);
        assert_eq!(endpoint.base_url.as_str(), "http://127.0.0.1:8080/");
    }
}
