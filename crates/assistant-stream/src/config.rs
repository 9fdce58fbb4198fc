use std::str::FromStr;
use std::time::Duration;

use crate::errors::ClientError;

/// Path of the chat token stream.
pub const CHAT_STREAM_PATH: &str = "/chat/stream";
/// Path of the tool execution stream.
pub const TOOL_STREAM_PATH: &str = "/tools/tests/generate";
/// Path of the SLO metrics lookup.
pub const SLO_METRICS_PATH: &str = "/metrics/slo/latest";

const DEFAULT_BASE_URL: &str = "http://localhost:8001";

/// Configuration shared by the stream transports and the SLO client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the assistant API.
    pub base_url: String,
    /// Timeout for establishing TCP/TLS connections.
    ///
    /// Streaming reads have no idle timeout; liveness is left to the
    /// transport.
    pub connect_timeout: Duration,
    /// Total timeout for plain request/response calls.
    pub request_timeout: Duration,
    /// Number of SLO records fetched after a chat stream completes.
    pub slo_limit: u32,
    /// Bounded buffer between the push transport reader and its session.
    pub stream_buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ClientConfig {
    /// Creates a config with defaults for everything except the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            slo_limit: 1,
            stream_buffer_capacity: 128,
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `ASSISTANT_API_BASE_URL` (default `http://localhost:8001`)
    /// - `ASSISTANT_CONNECT_TIMEOUT_SECS` (default 10)
    /// - `ASSISTANT_SLO_LIMIT` (default 1)
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = match std::env::var("ASSISTANT_API_BASE_URL") {
            Ok(base_url) if !base_url.trim().is_empty() => Self::new(base_url.trim()),
            _ => Self::default(),
        };
        if let Some(secs) = env_parse::<u64>("ASSISTANT_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(limit) = env_parse::<u32>("ASSISTANT_SLO_LIMIT")? {
            config.slo_limit = limit;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the API base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the request/response timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides how many SLO records are fetched after completion.
    pub fn slo_limit(mut self, limit: u32) -> Self {
        self.slo_limit = limit;
        self
    }

    /// Overrides the push transport buffer capacity.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(ClientError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, ClientError> {
        self.validate()?;
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim().trim_end_matches('/'))
    }

    pub(crate) fn chat_stream_url(&self) -> String {
        self.url(CHAT_STREAM_PATH)
    }

    pub(crate) fn tool_stream_url(&self) -> String {
        self.url(TOOL_STREAM_PATH)
    }

    pub(crate) fn slo_url(&self) -> String {
        self.url(SLO_METRICS_PATH)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ClientError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("invalid {key} `{raw}`: {e}"))),
        _ => Ok(None),
    }
}
