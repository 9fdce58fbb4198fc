//! Client for the assistant's server-sent-event streams.
//!
//! Two logical streams are supported: the chat token stream
//! (`GET /chat/stream`) and the tool execution stream
//! (`POST /tools/tests/generate`). Each is driven by a [`StreamController`]
//! that owns at most one live connection, records decoded events in wire
//! order and exposes the resulting [`SessionState`] through a watch channel.
//!
//! ```no_run
//! use assistant_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let mut chat = ChatStream::new(ChatTransport::from_env()?);
//! chat.restart().await;
//! let state = chat.wait().await;
//! println!("{} ({})", state.message_text(), state.status());
//! # Ok(())
//! # }
//! ```

/// Endpoint paths and client configuration.
pub mod config;
/// Failure and error types.
pub mod errors;
/// Typed events of the chat and tool streams.
pub mod events;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Session controller and cancellation handle.
pub mod session;
/// SLO metrics lookup.
pub mod slo;
/// SSE frame parsing and buffering.
pub mod sse;
/// Per-session state machine and derived views.
pub mod state;
/// HTTP connection adapters.
pub mod transport;

pub use config::ClientConfig;
pub use errors::{ClientError, DecodeError, StreamFailure};
pub use events::{
    ChatStreamEvent, ChatTokenPayload, ConversationTurn, DomainEvent, EventOutcome, Role,
    StreamKind, ToolStage, ToolStatus, ToolStatusPayload, ToolStreamEvent, ToolStreamRequest,
    ToolTokenPayload, Usage,
};
pub use observability::init_observability;
pub use session::{AbortHandle, ChatStream, StreamController, ToolStream};
pub use slo::{SloClient, SloMetric, SloReport, SloThresholds};
pub use sse::{SseDecoder, SseFrame, parse_sse_frame};
pub use state::{SessionId, SessionState, StreamStatus, TokenMeter, Transition};
pub use transport::{ChatTransport, EventStream, StreamTransport, ToolTransport};
