//! Connection adapters that turn an HTTP response into decoded events.
//!
//! The chat stream uses a push adapter: a reader task owns the connection and
//! pushes every message into a bounded channel. The tool stream uses a pull
//! adapter: the session reads the response body on demand and nothing runs
//! when it stops polling.
mod pull;
mod push;

pub use pull::ToolTransport;
pub use push::{CONNECTION_LOST, ChatTransport};

use std::pin::Pin;

use crate::errors::StreamFailure;
use crate::events::DomainEvent;
use crate::slo::SloMetric;

/// Decoded events of one open connection, in wire order.
///
/// The stream ends after the first `Err`. Dropping it releases the
/// connection.
pub type EventStream<E> = Pin<Box<dyn futures::Stream<Item = Result<E, StreamFailure>> + Send + 'static>>;

pub(crate) type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Opens connections for one logical stream.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Event union carried by the stream.
    type Event: DomainEvent;
    /// Parameters needed to open a connection.
    type Request: Send + 'static;

    /// Opens a connection. `Ok` means the connection is established.
    async fn open(&self, request: Self::Request) -> Result<EventStream<Self::Event>, StreamFailure>;

    /// Runs once after a session completes successfully.
    async fn after_completion(&self) -> Option<SloMetric> {
        None
    }
}

pub(crate) fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, StreamFailure> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StreamFailure::Status {
            status: status.as_u16(),
        })
    }
}
