//! Server-sent-events framing over a chunked byte stream.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use turnstream_core::errors::ConnectionError;

use crate::transport::RawFrame;

/// Default maximum silence between two chunks.
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Parse one SSE event block (the text between two blank lines).
///
/// Multiple `data:` lines are joined with `\n`; comment lines starting with
/// `:` and the `id`/`retry` fields are ignored. Returns `None` for a block
/// that carries neither an event name nor data.
pub fn parse_sse_block(block: &str) -> Option<RawFrame> {
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(RawFrame {
        event,
        data: data.join("\n"),
    })
}

/// Parse a complete SSE body into frames. Handles a trailing block without
/// the final blank line.
pub fn parse_sse_body(raw: &str) -> Vec<RawFrame> {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .split("\n\n")
        .filter_map(parse_sse_block)
        .collect()
}

pin_project! {
    /// Turns a byte stream into [`RawFrame`]s, failing with
    /// [`ConnectionError::IdleTimeout`] when no chunk arrives for `idle_duration`.
    ///
    /// Bytes are buffered until a full event is present, so a UTF-8 sequence
    /// split across chunks decodes correctly. `\r\n` and a lone `\r` are
    /// stored as `\n`, including a pair split across two chunks.
    pub struct SseFrameStream<S> {
        #[pin]
        inner: S,
        #[pin]
        idle_deadline: Sleep,
        idle_duration: Duration,
        buffer: Vec<u8>,
        // Prefix of `buffer` already searched for a blank line.
        scanned: usize,
        after_cr: bool,
        pending: VecDeque<RawFrame>,
        finished: bool,
    }
}

impl<S> SseFrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_idle_timeout(inner, SSE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(inner: S, idle_duration: Duration) -> Self {
        Self {
            inner,
            idle_deadline: tokio::time::sleep(idle_duration),
            idle_duration,
            buffer: Vec::new(),
            scanned: 0,
            after_cr: false,
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

fn push_normalized(buffer: &mut Vec<u8>, chunk: &[u8], after_cr: &mut bool) {
    for &byte in chunk {
        match byte {
            b'\r' => buffer.push(b'\n'),
            b'\n' if *after_cr => {}
            _ => buffer.push(byte),
        }
        *after_cr = byte == b'\r';
    }
}

fn drain_events(buffer: &mut Vec<u8>, scanned: &mut usize, pending: &mut VecDeque<RawFrame>) {
    loop {
        let from = *scanned;
        let Some(pos) = buffer[from..].windows(2).position(|w| w == b"\n\n") else {
            // Keep the last byte: it may pair with the next chunk's first.
            *scanned = buffer.len().saturating_sub(1);
            return;
        };
        let block: Vec<u8> = buffer.drain(..from + pos + 2).collect();
        *scanned = 0;
        if let Some(frame) = parse_sse_block(&String::from_utf8_lossy(&block)) {
            pending.push_back(frame);
        }
    }
}

impl<S, E> Stream for SseFrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<RawFrame, ConnectionError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let deadline = Instant::now() + *this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);

                    push_normalized(this.buffer, &chunk, this.after_cr);
                    drain_events(this.buffer, this.scanned, this.pending);
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(ConnectionError::Interrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    *this.finished = true;
                    if !this.buffer.is_empty() {
                        let rest = std::mem::take(this.buffer);
                        *this.scanned = 0;
                        if let Some(frame) = parse_sse_block(&String::from_utf8_lossy(&rest)) {
                            this.pending.push_back(frame);
                        }
                    }
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        *this.finished = true;
                        tracing::warn!(
                            idle_ms = this.idle_duration.as_millis() as u64,
                            "sse stream idle timeout"
                        );
                        return Poll::Ready(Some(Err(ConnectionError::IdleTimeout(
                            *this.idle_duration,
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
