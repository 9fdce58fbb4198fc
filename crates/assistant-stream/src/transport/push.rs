use std::pin::Pin;
use std::task::{Context, Poll};

use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{CHAT_STREAM_PATH, ClientConfig};
use crate::errors::{ClientError, StreamFailure};
use crate::events::{ChatStreamEvent, decode_event};
use crate::slo::{SloClient, SloMetric};
use crate::sse::{SseDecoder, SseFrame};

use super::{ByteStream, EventStream, StreamTransport, ensure_success};

/// Failure message when the chat connection closes or errors.
pub const CONNECTION_LOST: &str = "SSE connection lost";

type Message = Result<ChatStreamEvent, StreamFailure>;

/// Push adapter for `GET /chat/stream`.
///
/// A reader task owns the connection and delivers each message body as one
/// decoded event. Dropping the returned stream stops the reader and closes
/// the connection.
#[derive(Clone, Debug)]
pub struct ChatTransport {
    client: reqwest::Client,
    config: ClientConfig,
    slo: SloClient,
}

impl ChatTransport {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = config.http_client()?;
        let slo = SloClient::with_client(client.clone(), config.clone());
        Ok(Self {
            client,
            config,
            slo,
        })
    }

    /// Creates a transport from [`ClientConfig::from_env`].
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl StreamTransport for ChatTransport {
    type Event = ChatStreamEvent;
    type Request = ();

    async fn open(&self, _request: ()) -> Result<EventStream<ChatStreamEvent>, StreamFailure> {
        debug!("opening chat stream");
        let response = self
            .client
            .get(self.config.chat_stream_url())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| StreamFailure::transport(format!("{CONNECTION_LOST}: {e}")))?;
        let response = ensure_success(response)?;

        let (tx, rx) = mpsc::channel(self.config.stream_buffer_capacity);
        let bytes: ByteStream = Box::pin(response.bytes_stream());
        let reader = tokio::spawn(pump_messages(bytes, tx));
        Ok(Box::pin(MessageStream { rx, reader }))
    }

    /// Fetches the latest SLO record for the chat endpoint.
    ///
    /// Lookup failures are logged and never affect the session.
    async fn after_completion(&self) -> Option<SloMetric> {
        if self.config.slo_limit == 0 {
            return None;
        }
        match self.slo.latest(CHAT_STREAM_PATH, self.config.slo_limit).await {
            Ok(records) => records.into_iter().next(),
            Err(err) => {
                warn!(error = %err, "failed to load SLO metrics");
                None
            }
        }
    }
}

struct MessageStream {
    rx: mpsc::Receiver<Message>,
    reader: JoinHandle<()>,
}

impl futures::Stream for MessageStream {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Body of a frame dispatched as a plain message.
///
/// Named events other than `message` and frames without data are not
/// message deliveries.
fn message_body(frame: &SseFrame) -> Option<&str> {
    match frame.event.as_deref() {
        None | Some("message") => frame.data.as_deref(),
        Some(other) => {
            debug!(event = other, "skipping named SSE event on chat stream");
            None
        }
    }
}

async fn pump_messages(mut bytes: ByteStream, tx: mpsc::Sender<Message>) {
    let mut decoder = SseDecoder::default();
    loop {
        let (frames, ended) = match bytes.next().await {
            Some(Ok(chunk)) => (decoder.push_bytes(&chunk), false),
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(StreamFailure::transport(format!("{CONNECTION_LOST}: {e}"))))
                    .await;
                return;
            }
            None => (decoder.finish(), true),
        };
        for frame in &frames {
            let Some(body) = message_body(frame) else {
                continue;
            };
            let message = decode_event::<ChatStreamEvent>(body).map_err(StreamFailure::from);
            let fatal = message.is_err();
            if tx.send(message).await.is_err() || fatal {
                return;
            }
        }
        if ended {
            let _ = tx.send(Err(StreamFailure::transport(CONNECTION_LOST))).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, reqwest::Error>(bytes::Bytes::from_static(chunk.as_bytes()))),
        ))
    }

    async fn pumped(chunks: Vec<&'static str>) -> Vec<Message> {
        let (tx, mut rx) = mpsc::channel(16);
        pump_messages(byte_stream(chunks), tx).await;
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(message);
        }
        out
    }

    const TOKEN: &str = "data: {\"type\":\"token\",\"payload\":{\"id\":\"1\",\"token\":\"AI\",\"index\":0,\"timestamp\":\"2025-01-01T00:00:00Z\"},\"usage\":{\"totalTokens\":1,\"totalCostUsd\":0.000002}}\n\n";

    #[tokio::test]
    async fn close_after_messages_reports_connection_lost() {
        let messages = pumped(vec![TOKEN, ": keep-alive\n\n", "event: ping\ndata: {}\n\n"]).await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Ok(ChatStreamEvent::Token { .. })));
        assert_eq!(
            messages[1],
            Err(StreamFailure::transport(CONNECTION_LOST))
        );
    }

    #[tokio::test]
    async fn malformed_message_stops_the_reader() {
        let messages = pumped(vec!["data: nope\n\n", TOKEN]).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], Err(StreamFailure::Decode { .. })));
    }

    #[test]
    fn only_message_frames_have_bodies() {
        let unnamed = SseFrame {
            event: None,
            data: Some("{}".into()),
        };
        let named = SseFrame {
            event: Some("message".into()),
            data: Some("{}".into()),
        };
        let other = SseFrame {
            event: Some("ping".into()),
            data: Some("{}".into()),
        };
        assert_eq!(message_body(&unnamed), Some("{}"));
        assert_eq!(message_body(&named), Some("{}"));
        assert_eq!(message_body(&other), None);
        assert_eq!(message_body(&SseFrame::default()), None);
    }
}
