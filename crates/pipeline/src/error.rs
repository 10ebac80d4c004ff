//! Error types shared by the transport, codec and backend layers.

/// A single frame or record that could not be turned into a sample.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid sample: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("partial frame exceeded {limit} bytes")]
    Oversized { limit: usize },
}

/// Failures of the streaming connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {cause}")]
    ConnectionFailed { url: String, cause: String },

    #[error("connection attempt timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("stream rejected with HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("credential rejected with HTTP {status}")]
    Unauthorized { status: u16 },

    #[error("no credential available from {source_name}")]
    MissingCredential { source_name: String },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("stream closed by source")]
    StreamClosed,

    #[error("stream read failed: {0}")]
    Read(String),

    #[error("gave up after {attempts} reconnect attempt(s): {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether the failure is likely transient and worth a reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ConnectionFailed { .. }
            | TransportError::Timeout { .. }
            | TransportError::StreamClosed
            | TransportError::Read(_) => true,
            // 429 = rate limited, 5xx = source side trouble
            TransportError::HttpStatus { status } => *status == 429 || *status >= 500,
            TransportError::Unauthorized { .. }
            | TransportError::MissingCredential { .. }
            | TransportError::InvalidEndpoint(_)
            | TransportError::RetryExhausted { .. } => false,
        }
    }

    /// Authentication failures are terminal and reported separately from
    /// ordinary disconnects.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            TransportError::Unauthorized { .. } | TransportError::MissingCredential { .. }
        )
    }
}

/// Failures of the historical and missed-range queries.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{endpoint} request failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} response is not a JSON array: {source}")]
    Body {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("endpoint unavailable: {0}")]
    Endpoint(#[from] TransportError),
}

/// Failures surfaced by the pipeline and its handle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Recorder(#[from] crate::recorder::RecorderError),

    #[error("pipeline event loop has stopped")]
    Closed,
}
