//! Reconnecting stream transport.
//!
//! [`StreamTransport::connect`] spawns a task that keeps one authenticated
//! streaming connection open, decodes frames into samples and reports every
//! status change to the caller:
//!
//! ```text
//!   connecting -> connected -> (stream error) -> reconnecting #1 (2s)
//!              -> reconnecting #2 (4s) ... #5 (32s) -> disconnected + terminal
//! ```
//!
//! The endpoint and credential are re-resolved before every attempt, so a
//! rotated credential is picked up without restarting the pipeline. Any
//! received sample resets the attempt counter.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, HeaderValue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::codec::FrameDecoder;
use crate::error::{DecodeError, TransportError};
use crate::sample::Sample;

/// Resolved connection target for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: Url,
    pub credential: Option<String>,
}

impl Endpoint {
    /// Append `path` to the base URL, keeping any path prefix of the base.
    pub fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        join_path(&self.base_url, path)
    }
}

pub(crate) fn join_path(base: &Url, path: &str) -> Result<Url, TransportError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|err| TransportError::InvalidEndpoint(format!("{joined}: {err}")))
}

/// Supplies the endpoint and credential for each connection attempt.
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self) -> Result<Endpoint, TransportError>;
}

/// Fixed endpoint, for tests and unauthenticated sources.
#[derive(Debug, Clone)]
pub struct StaticEndpoint(pub Endpoint);

impl EndpointResolver for StaticEndpoint {
    fn resolve(&self) -> Result<Endpoint, TransportError> {
        Ok(self.0.clone())
    }
}

/// Reads the bearer credential from an environment variable on every
/// attempt.
#[derive(Debug, Clone)]
pub struct EnvCredentialEndpoint {
    base_url: Url,
    token_env: String,
}

impl EnvCredentialEndpoint {
    pub fn new(base_url: Url, token_env: impl Into<String>) -> Self {
        Self {
            base_url,
            token_env: token_env.into(),
        }
    }
}

impl EndpointResolver for EnvCredentialEndpoint {
    fn resolve(&self) -> Result<Endpoint, TransportError> {
        let credential = std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| TransportError::MissingCredential {
                source_name: self.token_env.clone(),
            })?;
        Ok(Endpoint {
            base_url: self.base_url.clone(),
            credential: Some(credential),
        })
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Opens the raw byte stream for one connection attempt.
#[async_trait::async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<ByteStream, TransportError>;
}

/// `GET {base}/stream` over HTTP with a bearer credential.
#[derive(Debug, Clone)]
pub struct HttpStreamSource {
    client: reqwest::Client,
}

impl HttpStreamSource {
    pub fn new(connect_timeout: Duration) -> Self {
        // No overall request timeout: the response body is the long-lived stream.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait::async_trait]
impl StreamSource for HttpStreamSource {
    async fn open(&self, endpoint: &Endpoint) -> Result<ByteStream, TransportError> {
        let url = endpoint.url_for("stream")?;
        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        if let Some(credential) = &endpoint.credential {
            request = request.bearer_auth(credential);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::ConnectionFailed {
                url: url.to_string(),
                cause: err.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| TransportError::Read(err.to_string())))
            .boxed())
    }
}

/// Backoff schedule and per-attempt timeout.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before reconnect attempt `n` is `backoff[n - 1]`; once the
    /// schedule is exhausted the transport gives up.
    pub backoff: Vec<Duration>,
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: [2, 4, 8, 16, 32]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.backoff.len()).unwrap_or(u32::MAX)
    }

    /// Delay before the 1-based reconnect `attempt`, `None` once exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
        self.backoff.get(index).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Status reported on every transition, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Reconnect attempt number; zero for the initial connection and after
    /// any received sample.
    pub attempt: u32,
}

#[derive(Debug)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Sample(Box<Sample>),
    FrameDropped(DecodeError),
    /// No further events follow.
    Terminal(TransportError),
}

pub struct StreamTransport {
    source: Arc<dyn StreamSource>,
    resolver: Arc<dyn EndpointResolver>,
    policy: ReconnectPolicy,
}

impl StreamTransport {
    pub fn new(
        source: Arc<dyn StreamSource>,
        resolver: Arc<dyn EndpointResolver>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            source,
            resolver,
            policy,
        }
    }

    /// Start the connection task. Cancelling `cancel` stops any in-flight
    /// request and pending backoff; no event is sent afterwards.
    pub fn connect(self, cancel: CancellationToken) -> mpsc::Receiver<TransportEvent> {
        let (events, receiver) = mpsc::channel(256);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => debug!("stream transport disposed"),
                _ = self.run(events) => {}
            }
        });
        receiver
    }

    async fn run(self, events: mpsc::Sender<TransportEvent>) {
        let mut attempt: u32 = 0;

        loop {
            if !send(&events, status(ConnectionState::Connecting, attempt)).await {
                return;
            }
            let error = match self.session(&events, &mut attempt).await {
                SessionEnd::ReceiverGone => return,
                SessionEnd::Failed(error) => error,
            };

            if !error.is_retryable() {
                if error.is_auth() {
                    error!(error = %error, "stream authentication failed");
                } else {
                    error!(error = %error, "stream failed with a non-retryable error");
                }
                let _ = send(&events, status(ConnectionState::Disconnected, attempt)).await;
                let _ = send(&events, TransportEvent::Terminal(error)).await;
                return;
            }

            attempt += 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                let attempts = self.policy.max_attempts();
                error!(attempts, error = %error, "stream reconnect attempts exhausted");
                let _ = send(&events, status(ConnectionState::Disconnected, attempts)).await;
                let _ = send(
                    &events,
                    TransportEvent::Terminal(TransportError::RetryExhausted {
                        attempts,
                        last_error: Box::new(error),
                    }),
                )
                .await;
                return;
            };

            warn!(
                attempt,
                delay_secs = delay.as_secs(),
                error = %error,
                "stream disconnected, scheduling reconnect"
            );
            if !send(&events, status(ConnectionState::Reconnecting, attempt)).await {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection attempt, from resolving the endpoint to the end of the
    /// byte stream.
    async fn session(&self, events: &mpsc::Sender<TransportEvent>, attempt: &mut u32) -> SessionEnd {
        let endpoint = match self.resolver.resolve() {
            Ok(endpoint) => endpoint,
            Err(error) => return SessionEnd::Failed(error),
        };

        let timeout = self.policy.connect_timeout;
        let mut stream = match tokio::time::timeout(timeout, self.source.open(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return SessionEnd::Failed(error),
            Err(_) => {
                return SessionEnd::Failed(TransportError::Timeout {
                    elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        info!(url = %endpoint.base_url, attempt = *attempt, "stream connected");
        if !send(events, status(ConnectionState::Connected, *attempt)).await {
            return SessionEnd::ReceiverGone;
        }

        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => return SessionEnd::Failed(error),
            };

            for frame in decoder.push(&chunk) {
                let event = match frame {
                    Ok(sample) => {
                        *attempt = 0;
                        TransportEvent::Sample(Box::new(sample))
                    }
                    Err(error) => {
                        debug!(error = %error, "dropping malformed frame");
                        TransportEvent::FrameDropped(error)
                    }
                };
                if !send(events, event).await {
                    return SessionEnd::ReceiverGone;
                }
            }
        }

        let dropped = decoder.reset();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding partial frame at end of stream");
        }
        SessionEnd::Failed(TransportError::StreamClosed)
    }
}

enum SessionEnd {
    Failed(TransportError),
    ReceiverGone,
}

fn status(state: ConnectionState, attempt: u32) -> TransportEvent {
    TransportEvent::Status(ConnectionStatus { state, attempt })
}

async fn send(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    events.send(event).await.is_ok()
}
