use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::ClientError;

/// Upper bound accepted by the server for `limit`.
pub const MAX_SLO_LIMIT: u32 = 50;

/// One request latency/usage record from `GET /metrics/slo/latest`.
///
/// The server emits snake_case fields while the shared client types use
/// camelCase; both spellings decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloMetric {
    pub method: String,
    pub path: String,
    #[serde(alias = "duration_ms")]
    pub duration_ms: f64,
    pub tokens: u64,
    #[serde(alias = "cache_hit")]
    pub cache_hit: bool,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
struct SloMetricsResponse {
    records: Vec<SloMetric>,
}

/// Limits a metric is judged against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SloThresholds {
    pub max_duration_ms: f64,
    pub max_tokens: u64,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self {
            max_duration_ms: 2000.0,
            max_tokens: 120,
        }
    }
}

/// Per-dimension verdict for one metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SloReport {
    pub duration_ok: bool,
    pub tokens_ok: bool,
    pub cache_ok: bool,
}

impl SloReport {
    pub fn evaluate(metric: &SloMetric, thresholds: &SloThresholds) -> Self {
        Self {
            duration_ok: metric.duration_ms <= thresholds.max_duration_ms,
            tokens_ok: metric.tokens <= thresholds.max_tokens,
            cache_ok: metric.cache_hit,
        }
    }

    /// True when every dimension passes.
    pub fn all_ok(&self) -> bool {
        self.duration_ok && self.tokens_ok && self.cache_ok
    }
}

/// Plain request/response client for the SLO metrics endpoint.
#[derive(Clone, Debug)]
pub struct SloClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl SloClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = config.http_client()?;
        Ok(Self::with_client(client, config))
    }

    pub(crate) fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    /// Fetches the newest records for `path`, newest first.
    pub async fn latest(&self, path: &str, limit: u32) -> Result<Vec<SloMetric>, ClientError> {
        if !(1..=MAX_SLO_LIMIT).contains(&limit) {
            return Err(ClientError::Validation(format!(
                "limit must be between 1 and {MAX_SLO_LIMIT}, got {limit}"
            )));
        }
        debug!(path, limit, "fetching latest SLO metrics");
        let response = self
            .client
            .get(self.config.slo_url())
            .query(&[("path", path.to_string()), ("limit", limit.to_string())])
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(ClientError::transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.bytes().await.map_err(ClientError::transport)?;
        let parsed: SloMetricsResponse = serde_json::from_slice(&body)
            .map_err(|e| ClientError::Decode(format!("invalid SLO metrics response: {e}")))?;
        Ok(parsed.records)
    }
}
