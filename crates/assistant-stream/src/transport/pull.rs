use std::collections::VecDeque;

use futures::StreamExt as _;
use futures::stream;
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::{ClientError, StreamFailure};
use crate::events::{DomainEvent, ToolStreamEvent, ToolStreamRequest, decode_frame};
use crate::sse::SseDecoder;

use super::{ByteStream, EventStream, StreamTransport, ensure_success};

/// Pull adapter for `POST /tools/tests/generate`.
#[derive(Clone, Debug)]
pub struct ToolTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl ToolTransport {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = config.http_client()?;
        Ok(Self { client, config })
    }

    /// Creates a transport from [`ClientConfig::from_env`].
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl StreamTransport for ToolTransport {
    type Event = ToolStreamEvent;
    type Request = ToolStreamRequest;

    async fn open(&self, request: ToolStreamRequest) -> Result<EventStream<ToolStreamEvent>, StreamFailure> {
        debug!(turns = request.conversation.len(), "opening tool stream");
        let response = self
            .client
            .post(self.config.tool_stream_url())
            .header(ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| StreamFailure::transport(format!("tool stream request failed: {e}")))?;
        let response = ensure_success(response)?;
        let bytes: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(sse_event_stream::<ToolStreamEvent>(bytes)))
    }
}

/// Reads SSE-framed events from `bytes` on demand.
///
/// Events decoded before a bad frame are still yielded, then the bad frame's
/// failure, then the stream ends.
pub(crate) fn sse_event_stream<E: DomainEvent>(
    bytes: ByteStream,
) -> impl futures::Stream<Item = Result<E, StreamFailure>> + Send + 'static {
    struct State<E> {
        bytes: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<Result<E, StreamFailure>>,
        done: bool,
    }

    stream::unfold(
        State {
            bytes,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }

                let frames = match state.bytes.next().await {
                    Some(Ok(chunk)) => state.decoder.push_bytes(&chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        let failure = StreamFailure::transport(format!("stream read failed: {e}"));
                        return Some((Err(failure), state));
                    }
                    None => {
                        state.done = true;
                        state.decoder.finish()
                    }
                };
                for frame in frames {
                    match decode_frame::<E>(&frame) {
                        Ok(Some(event)) => state.pending.push_back(Ok(event)),
                        Ok(None) => {}
                        Err(err) => {
                            state.pending.push_back(Err(err.into()));
                            state.done = true;
                            break;
                        }
                    }
                }
            }
        },
    )
}
