use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{stream, Stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use turnstream_core::errors::ConnectionError;
use turnstream_core::ids::{AgentId, ThreadId};
use turnstream_core::messages::WireMessage;

/// One server-sent event, before JSON decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    /// The SSE `event:` field, if the server sent one.
    pub event: Option<String>,
    pub data: String,
}

impl RawFrame {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(value.to_string())
    }
}

/// Payload of one streaming request: the whole replayable history.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub thread_id: ThreadId,
    pub agent_id: AgentId,
    pub messages: Vec<WireMessage>,
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<RawFrame, ConnectionError>> + Send>>;

/// A single open streaming connection.
///
/// Yields frames in receipt order. Once an error has been yielded, the inner
/// stream has ended, the cancellation token has fired or the consumer has
/// called [`Connection::close`], the connection is closed: the inner stream is
/// dropped and every later poll returns `None`.
///
/// Frames are not decoded here. The consumer closes the connection when it
/// decodes a terminal event, so nothing after `done` or `error` is pulled.
pub struct Connection {
    inner: FrameStream,
    cancel: CancellationToken,
    closed: bool,
}

impl Connection {
    pub fn new(
        frames: impl Stream<Item = Result<RawFrame, ConnectionError>> + Send + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Box::pin(frames),
            cancel,
            closed: false,
        }
    }

    /// Fire the token and release the stream immediately.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Release the stream without firing the token.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner = Box::pin(stream::empty());
        }
    }
}

impl Stream for Connection {
    type Item = Result<RawFrame, ConnectionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        if self.cancel.is_cancelled() {
            self.close();
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => {
                self.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Opens streaming connections to the chat service.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Establish exactly one connection for `request`.
    ///
    /// Errors here mean no frame was ever received; the caller surfaces them
    /// as a terminal error for the turn.
    async fn open(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectionError>;
}
