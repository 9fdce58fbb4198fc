use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::StreamFailure;
use crate::events::{
    ChatStreamEvent, ChatTokenPayload, DomainEvent, EventOutcome, ToolStage, ToolStatus,
    ToolStreamEvent, Usage,
};
use crate::slo::SloMetric;

/// Identifier of one session; a restart always mints a new one.
pub type SessionId = uuid::Uuid;

/// Token count at which the chat usage meter reads full.
pub const TOKEN_METER_CAPACITY: u64 = 100;

/// Observable status of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Completed,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Connecting or streaming.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of feeding one input to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The input was accepted; carries the status afterwards.
    Applied(StreamStatus),
    /// The input belongs to a stale, cancelled or finished session.
    Ignored,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// State of the current session of one logical stream.
///
/// Every mutation names the session it comes from. Inputs from any session
/// other than the current live one are ignored, which is what makes
/// cancellation and restart final even when a reader still has data
/// buffered.
#[derive(Clone, Debug)]
pub struct SessionState<E> {
    session_id: Option<SessionId>,
    status: StreamStatus,
    events: Vec<E>,
    failure: Option<StreamFailure>,
    last_error: Option<String>,
    slo_metric: Option<SloMetric>,
    live: bool,
}

impl<E> Default for SessionState<E> {
    fn default() -> Self {
        Self {
            session_id: None,
            status: StreamStatus::Idle,
            events: Vec::new(),
            failure: None,
            last_error: None,
            slo_metric: None,
            live: false,
        }
    }
}

impl<E: DomainEvent> SessionState<E> {
    /// Idle state with no session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was here with a fresh `connecting` session.
    pub fn begin(&mut self, session_id: SessionId) {
        *self = Self {
            session_id: Some(session_id),
            status: StreamStatus::Connecting,
            live: true,
            ..Self::default()
        };
    }

    /// True when `session_id` is current and still accepts input.
    pub fn is_live(&self, session_id: SessionId) -> bool {
        self.live && self.session_id == Some(session_id)
    }

    /// The transport reported an established connection.
    pub fn mark_connected(&mut self, session_id: SessionId) -> Transition {
        if !self.is_live(session_id) {
            return Transition::Ignored;
        }
        if self.status == StreamStatus::Connecting {
            self.status = StreamStatus::Streaming;
        }
        Transition::Applied(self.status)
    }

    /// Appends a decoded event and derives the resulting status.
    pub fn apply(&mut self, session_id: SessionId, event: E) -> Transition {
        if !self.is_live(session_id) {
            return Transition::Ignored;
        }
        let outcome = event.outcome();
        self.events.push(event);
        match outcome {
            EventOutcome::Progress => self.status = StreamStatus::Streaming,
            EventOutcome::Completed => {
                self.status = StreamStatus::Completed;
                self.live = false;
            }
            EventOutcome::Failed(failure) => self.record_failure(failure),
        }
        Transition::Applied(self.status)
    }

    /// Records a transport or decode failure.
    pub fn fail(&mut self, session_id: SessionId, failure: StreamFailure) -> Transition {
        if !self.is_live(session_id) {
            return Transition::Ignored;
        }
        self.record_failure(failure);
        Transition::Applied(self.status)
    }

    /// The transport reached end of input.
    ///
    /// Only a session that never saw a terminal event is still live here, so
    /// this fires the incomplete-stream failure exactly when no completion
    /// was observed.
    pub fn finish(&mut self, session_id: SessionId) -> Transition {
        self.fail(session_id, StreamFailure::Incomplete)
    }

    /// User abort: back to `idle` without touching the event log.
    ///
    /// Returns `false` (and changes nothing) when `session_id` is not the
    /// current session or the state is already idle.
    pub fn cancel(&mut self, session_id: SessionId) -> bool {
        if self.session_id != Some(session_id) {
            return false;
        }
        if self.status == StreamStatus::Idle && !self.live {
            return false;
        }
        self.live = false;
        self.status = StreamStatus::Idle;
        true
    }

    /// Stores the SLO record fetched after a completed session.
    pub fn record_slo(&mut self, session_id: SessionId, metric: SloMetric) -> Transition {
        if self.session_id != Some(session_id) || self.status != StreamStatus::Completed {
            return Transition::Ignored;
        }
        self.slo_metric = Some(metric);
        Transition::Applied(self.status)
    }

    fn record_failure(&mut self, failure: StreamFailure) {
        self.status = StreamStatus::Error;
        self.last_error = Some(failure.message());
        self.failure = Some(failure);
        self.live = false;
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Decoded events in wire arrival order.
    pub fn events(&self) -> &[E] {
        &self.events
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn failure(&self) -> Option<&StreamFailure> {
        self.failure.as_ref()
    }

    pub fn slo_metric(&self) -> Option<&SloMetric> {
        self.slo_metric.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.status.is_streaming()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Usage carried by the most recent event that has any.
    pub fn latest_usage(&self) -> Option<Usage> {
        self.events.iter().rev().find_map(DomainEvent::usage)
    }
}

/// Usage summary shown next to the chat output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenMeter {
    pub tokens: u64,
    pub cost_usd: f64,
    /// Fill ratio in `0.0..=1.0`.
    pub progress: f64,
}

impl TokenMeter {
    pub fn from_usage(usage: Option<Usage>) -> Self {
        let usage = usage.unwrap_or_default();
        Self {
            tokens: usage.total_tokens,
            cost_usd: usage.total_cost_usd,
            progress: (usage.total_tokens as f64 / TOKEN_METER_CAPACITY as f64).min(1.0),
        }
    }
}

impl SessionState<ChatStreamEvent> {
    /// Token payloads in arrival order.
    pub fn tokens(&self) -> impl Iterator<Item = &ChatTokenPayload> {
        self.events.iter().filter_map(|event| match event {
            ChatStreamEvent::Token { payload, .. } => Some(payload),
            _ => None,
        })
    }

    /// The assistant message reconstructed from the token log.
    pub fn message_text(&self) -> String {
        self.tokens().map(|payload| payload.token.as_str()).collect()
    }

    pub fn token_meter(&self) -> TokenMeter {
        TokenMeter::from_usage(self.latest_usage())
    }
}

impl SessionState<ToolStreamEvent> {
    /// Stage of the most recent token or tool event.
    pub fn current_stage(&self) -> Option<ToolStage> {
        self.events.iter().rev().find_map(ToolStreamEvent::stage)
    }

    /// Most recent status reported for `stage`.
    pub fn stage_status(&self, stage: ToolStage) -> Option<ToolStatus> {
        self.events.iter().rev().find_map(|event| match event {
            ToolStreamEvent::Tool { payload } if payload.stage == stage => Some(payload.status),
            _ => None,
        })
    }
}
