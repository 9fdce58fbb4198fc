use crate::events::StreamKind;

/// Message recorded when a stream closes without a terminal event.
pub const INCOMPLETE_STREAM_MESSAGE: &str = "stream ended before completion";

/// Terminal failure recorded in a session's state.
///
/// Exactly one failure (or a completion, or a cancellation) ends a session.
/// [`StreamFailure::message`] is the text surfaced as `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum StreamFailure {
    /// Connection refused, dropped, or the body read failed.
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// The server answered with a non-success HTTP status.
    #[error("API error: {status}")]
    Status { status: u16 },
    /// A frame did not decode into a known event shape.
    #[error("decode failure: {message}")]
    Decode { message: String },
    /// The server sent an explicit `error` event.
    #[error("server error: {message}")]
    Server { message: String },
    /// The tool pipeline reached its final stage without succeeding.
    #[error("tool pipeline failed: {message}")]
    ToolFailed { message: String },
    /// The transport closed cleanly without a completion signal.
    #[error("stream ended before completion")]
    Incomplete,
}

impl StreamFailure {
    /// Creates a transport failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a server-reported failure.
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Returns the user-facing message for this failure.
    ///
    /// Server and tool messages are returned verbatim.
    pub fn message(&self) -> String {
        match self {
            Self::Transport { message }
            | Self::Decode { message }
            | Self::Server { message }
            | Self::ToolFailed { message } => message.clone(),
            Self::Status { status } => format!("API error: {status}"),
            Self::Incomplete => INCOMPLETE_STREAM_MESSAGE.to_string(),
        }
    }
}

impl From<DecodeError> for StreamFailure {
    fn from(value: DecodeError) -> Self {
        Self::Decode {
            message: value.to_string(),
        }
    }
}

/// A frame's `data` could not be turned into a domain event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    #[error("malformed {kind} event JSON: {source}")]
    Json {
        kind: StreamKind,
        #[source]
        source: serde_json::Error,
    },
    /// The payload is JSON but matches none of the known event shapes.
    #[error("unexpected {kind} event shape: {message}")]
    Shape { kind: StreamKind, message: String },
}

/// Top-level error type for calls made outside a live session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Request could not be sent or its body could not be read.
    #[error("transport error: {0}")]
    Transport(String),
    /// The server answered with a non-success status.
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
