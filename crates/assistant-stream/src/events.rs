use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, StreamFailure};
use crate::sse::SseFrame;

/// Fallback `last_error` when the tool pipeline fails without a summary.
pub const TOOL_FAILURE_FALLBACK: &str = "pytest run failed";

/// Which logical stream an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Token-by-token chat stream.
    Chat,
    /// Multi-stage tool execution stream.
    Tool,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Chat => "chat",
            Self::Tool => "tool",
        })
    }
}

/// Effect a decoded event has on its session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Session keeps streaming.
    Progress,
    /// Session completed successfully.
    Completed,
    /// Session failed with the given failure.
    Failed(StreamFailure),
}

/// A closed event union decodable from one stream's wire payloads.
pub trait DomainEvent: DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Stream this event union belongs to.
    const KIND: StreamKind;

    /// Classifies the event for the session state machine.
    fn outcome(&self) -> EventOutcome;

    /// Running usage figures carried by the event, if any.
    fn usage(&self) -> Option<Usage> {
        None
    }

    /// Checks constraints serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Running token and cost totals reported by the chat stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// One streamed chat token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTokenPayload {
    pub id: String,
    pub token: String,
    pub index: u64,
    pub timestamp: DateTime<Utc>,
}

/// Events carried by `GET /chat/stream`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    Token {
        payload: ChatTokenPayload,
        usage: Usage,
    },
    Completed {
        usage: Usage,
    },
    Error {
        message: String,
    },
}

impl DomainEvent for ChatStreamEvent {
    const KIND: StreamKind = StreamKind::Chat;

    fn outcome(&self) -> EventOutcome {
        match self {
            Self::Token { .. } => EventOutcome::Progress,
            Self::Completed { .. } => EventOutcome::Completed,
            Self::Error { message } => EventOutcome::Failed(StreamFailure::server(message.clone())),
        }
    }

    fn usage(&self) -> Option<Usage> {
        match self {
            Self::Token { usage, .. } | Self::Completed { usage } => Some(*usage),
            Self::Error { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self.usage() {
            Some(usage) if !usage.total_cost_usd.is_finite() || usage.total_cost_usd < 0.0 => Err(
                format!("totalCostUsd must be a non-negative number, got {}", usage.total_cost_usd),
            ),
            _ => Ok(()),
        }
    }
}

/// Phase of the tool pipeline, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    TestGeneration,
    PytestInitialRun,
    FixApplication,
    PytestRerun,
    Completed,
}

impl ToolStage {
    /// All stages in pipeline order.
    pub const ALL: [ToolStage; 5] = [
        ToolStage::TestGeneration,
        ToolStage::PytestInitialRun,
        ToolStage::FixApplication,
        ToolStage::PytestRerun,
        ToolStage::Completed,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::TestGeneration => "test generation",
            Self::PytestInitialRun => "initial pytest",
            Self::FixApplication => "fix application",
            Self::PytestRerun => "pytest rerun",
            Self::Completed => "completed",
        }
    }
}

/// Status reported for a tool stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    InProgress,
    Failed,
    Succeeded,
}

impl ToolStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }
}

/// Log line emitted while a stage runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolTokenPayload {
    pub stage: ToolStage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Status change of a stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolStatusPayload {
    pub stage: ToolStage,
    pub status: ToolStatus,
    #[serde(default)]
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ToolStatusPayload {
    fn is_final_stage(&self) -> bool {
        self.stage == ToolStage::Completed
    }
}

/// Events carried by `POST /tools/tests/generate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolStreamEvent {
    Token {
        payload: ToolTokenPayload,
    },
    Tool {
        payload: ToolStatusPayload,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ToolStreamEvent {
    /// Stage the event refers to; `None` for error events.
    pub fn stage(&self) -> Option<ToolStage> {
        match self {
            Self::Token { payload } => Some(payload.stage),
            Self::Tool { payload } => Some(payload.stage),
            Self::Error { .. } => None,
        }
    }
}

impl DomainEvent for ToolStreamEvent {
    const KIND: StreamKind = StreamKind::Tool;

    fn outcome(&self) -> EventOutcome {
        match self {
            Self::Token { .. } => EventOutcome::Progress,
            Self::Tool { payload } if payload.is_final_stage() => match payload.status {
                ToolStatus::Succeeded => EventOutcome::Completed,
                _ => EventOutcome::Failed(StreamFailure::ToolFailed {
                    message: payload
                        .summary
                        .clone()
                        .filter(|summary| !summary.is_empty())
                        .unwrap_or_else(|| TOOL_FAILURE_FALLBACK.to_string()),
                }),
            },
            Self::Tool { .. } => EventOutcome::Progress,
            Self::Error { message, .. } => {
                EventOutcome::Failed(StreamFailure::server(message.clone()))
            }
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// One message of the conversation sent to the tool stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request body of `POST /tools/tests/generate`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStreamRequest {
    pub conversation: Vec<ConversationTurn>,
}

impl ToolStreamRequest {
    pub fn new(conversation: Vec<ConversationTurn>) -> Self {
        Self { conversation }
    }
}

/// Decodes one JSON event payload of stream `E`.
///
/// Syntax errors and shape mismatches are reported separately; both are
/// fatal for the session that received them.
pub fn decode_event<E: DomainEvent>(data: &str) -> Result<E, DecodeError> {
    let event: E = serde_json::from_str(data).map_err(|source| match source.classify() {
        serde_json::error::Category::Data => DecodeError::Shape {
            kind: E::KIND,
            message: source.to_string(),
        },
        _ => DecodeError::Json {
            kind: E::KIND,
            source,
        },
    })?;
    event.validate().map_err(|message| DecodeError::Shape {
        kind: E::KIND,
        message,
    })?;
    Ok(event)
}

/// Decodes a frame's `data` field; frames without data carry no event.
pub fn decode_frame<E: DomainEvent>(frame: &SseFrame) -> Result<Option<E>, DecodeError> {
    frame.data.as_deref().map(decode_event::<E>).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: Some(data.to_string()),
        }
    }

    #[test]
    fn decodes_chat_token_event() {
        let event: ChatStreamEvent = decode_event(
            r#"{"type":"token","payload":{"id":"a1","token":" chat","index":1,"timestamp":"2025-01-01T00:00:00.123456+00:00"},"usage":{"totalTokens":2,"totalCostUsd":0.000004}}"#,
        )
        .expect("token event");
        match event {
            ChatStreamEvent::Token { payload, usage } => {
                assert_eq!(payload.token, " chat");
                assert_eq!(payload.index, 1);
                assert_eq!(usage.total_tokens, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn chat_completed_and_error_outcomes() {
        let completed: ChatStreamEvent =
            decode_event(r#"{"type":"completed","usage":{"totalTokens":13,"totalCostUsd":0.000026}}"#)
                .expect("completed");
        assert_eq!(completed.outcome(), EventOutcome::Completed);
        assert_eq!(completed.usage().map(|u| u.total_tokens), Some(13));

        let error: ChatStreamEvent =
            decode_event(r#"{"type":"error","message":"model overloaded"}"#).expect("error");
        assert_eq!(
            error.outcome(),
            EventOutcome::Failed(StreamFailure::server("model overloaded"))
        );
        assert_eq!(error.usage(), None);
    }

    #[test]
    fn tool_completed_stage_decides_terminal_outcome() {
        let succeeded: ToolStreamEvent = decode_event(
            r#"{"type":"tool","payload":{"stage":"completed","status":"succeeded","summary":null,"timestamp":"2025-01-01T00:00:00Z"}}"#,
        )
        .expect("succeeded");
        assert_eq!(succeeded.outcome(), EventOutcome::Completed);

        let failed: ToolStreamEvent = decode_event(
            r#"{"type":"tool","payload":{"stage":"completed","status":"failed","summary":"X","timestamp":"2025-01-01T00:00:00Z"}}"#,
        )
        .expect("failed");
        assert_eq!(
            failed.outcome(),
            EventOutcome::Failed(StreamFailure::ToolFailed { message: "X".into() })
        );

        let unsummarized: ToolStreamEvent = decode_event(
            r#"{"type":"tool","payload":{"stage":"completed","status":"in_progress","timestamp":"2025-01-01T00:00:00Z"}}"#,
        )
        .expect("no summary");
        assert_eq!(
            unsummarized.outcome(),
            EventOutcome::Failed(StreamFailure::ToolFailed {
                message: TOOL_FAILURE_FALLBACK.into()
            })
        );
    }

    #[test]
    fn intermediate_tool_failure_is_progress() {
        let event: ToolStreamEvent = decode_event(
            r#"{"type":"tool","payload":{"stage":"pytest_initial_run","status":"failed","summary":"pytest exited with code 1","timestamp":"2025-01-01T00:00:00Z"}}"#,
        )
        .expect("tool event");
        assert_eq!(event.outcome(), EventOutcome::Progress);
        assert_eq!(event.stage(), Some(ToolStage::PytestInitialRun));
    }

    #[test]
    fn syntax_and_shape_errors_are_distinguished() {
        let syntax = decode_event::<ToolStreamEvent>("{\"type\":").expect_err("syntax");
        assert!(matches!(syntax, DecodeError::Json { kind: StreamKind::Tool, .. }));

        let unknown = decode_event::<ToolStreamEvent>(r#"{"type":"progress"}"#).expect_err("shape");
        assert!(matches!(unknown, DecodeError::Shape { .. }));

        let missing = decode_event::<ChatStreamEvent>(r#"{"type":"completed"}"#).expect_err("shape");
        assert!(matches!(missing, DecodeError::Shape { kind: StreamKind::Chat, .. }));
    }

    #[test]
    fn negative_cost_is_a_shape_error() {
        let err = decode_event::<ChatStreamEvent>(
            r#"{"type":"completed","usage":{"totalTokens":1,"totalCostUsd":-1.0}}"#,
        )
        .expect_err("negative cost");
        assert!(matches!(err, DecodeError::Shape { message, .. } if message.contains("totalCostUsd")));
    }

    #[test]
    fn frame_without_data_carries_no_event() {
        let frame = SseFrame {
            event: Some("token".into()),
            data: None,
        };
        assert!(decode_frame::<ToolStreamEvent>(&frame).expect("no data").is_none());
        let frame = data_frame(r#"{"type":"error","message":"boom","timestamp":"2025-01-01T00:00:00Z"}"#);
        assert!(matches!(
            decode_frame::<ToolStreamEvent>(&frame),
            Ok(Some(ToolStreamEvent::Error { .. }))
        ));
    }

    #[test]
    fn stages_are_ordered_and_request_serializes_roles() {
        assert!(ToolStage::ALL.windows(2).all(|pair| pair[0] < pair[1]));
        let body = serde_json::to_value(ToolStreamRequest::new(vec![
            ConversationTurn::new(Role::User, "divide by zero"),
            ConversationTurn::new(Role::Assistant, "ok"),
        ]))
        .expect("serialize");
        assert_eq!(body["conversation"][0]["role"], "user");
        assert_eq!(body["conversation"][1]["role"], "assistant");
        assert_eq!("System".parse::<Role>(), Ok(Role::System));
    }
}
