//! Historical and missed-range queries against the telemetry backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::BackendError;
use crate::sample::Sample;
use crate::transport::EndpointResolver;

/// Result of a missed-range query.
#[derive(Debug, Clone, PartialEq)]
pub enum MissedRange {
    Samples(Vec<Sample>),
    /// The range has aged out of the source's retention window.
    Unavailable,
}

#[async_trait::async_trait]
pub trait TelemetryBackend: Send + Sync + 'static {
    /// Samples with `start <= timestamp <= end`, oldest first.
    async fn history_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, BackendError>;

    /// Samples from the last `hours` hours, oldest first.
    async fn history_hours(&self, hours: u32) -> Result<Vec<Sample>, BackendError>;

    /// Samples of the current session with `from <= sequence <= to`.
    async fn missed_range(&self, from: u64, to: u64) -> Result<MissedRange, BackendError>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    resolver: Arc<dyn EndpointResolver>,
}

impl HttpBackend {
    pub fn new(resolver: Arc<dyn EndpointResolver>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, resolver }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Option<Vec<Sample>>, BackendError> {
        let endpoint = self.resolver.resolve()?;
        let url = endpoint.url_for(path)?;

        let mut request = self.client.get(url).query(query);
        if let Some(credential) = &endpoint.credential {
            request = request.bearer_auth(credential);
        }

        let response = request.send().await.map_err(|source| BackendError::Http {
            endpoint: path.to_owned(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                endpoint: path.to_owned(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|source| BackendError::Http {
            endpoint: path.to_owned(),
            source,
        })?;
        let records: Vec<Value> =
            serde_json::from_slice(&body).map_err(|source| BackendError::Body {
                endpoint: path.to_owned(),
                source,
            })?;

        Ok(Some(decode_records(records)))
    }
}

#[async_trait::async_trait]
impl TelemetryBackend for HttpBackend {
    async fn history_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Sample>, BackendError> {
        let query = [
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
        ];
        Ok(self.get("history", &query).await?.unwrap_or_default())
    }

    async fn history_hours(&self, hours: u32) -> Result<Vec<Sample>, BackendError> {
        let query = [("hours", hours.to_string())];
        Ok(self.get("history", &query).await?.unwrap_or_default())
    }

    async fn missed_range(&self, from: u64, to: u64) -> Result<MissedRange, BackendError> {
        let query = [("from", from.to_string()), ("to", to.to_string())];
        Ok(match self.get("missed", &query).await? {
            Some(samples) => MissedRange::Samples(samples),
            None => MissedRange::Unavailable,
        })
    }
}

/// Decode each record on its own; a malformed record is dropped without
/// failing the whole response.
pub fn decode_records(records: Vec<Value>) -> Vec<Sample> {
    let total = records.len();
    let samples: Vec<Sample> = records
        .into_iter()
        .filter_map(|record| match serde_json::from_value::<Sample>(record) {
            Ok(sample) => Some(sample),
            Err(err) => {
                debug!(error = %err, "dropping malformed historical record");
                None
            }
        })
        .collect();

    if samples.len() < total {
        debug!(
            dropped = total - samples.len(),
            total, "historical response contained malformed records"
        );
    }
    samples
}
