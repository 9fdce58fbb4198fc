//! Common imports for driving the chat and tool streams.
pub use crate::{
    AbortHandle, ChatStream, ChatStreamEvent, ChatTransport, ClientConfig, ClientError,
    ConversationTurn, Role, SessionId, SessionState, StreamController, StreamFailure,
    StreamStatus, ToolStage, ToolStatus, ToolStream, ToolStreamEvent, ToolTransport, Usage,
};
