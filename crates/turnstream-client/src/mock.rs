use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use turnstream_core::errors::ConnectionError;
use turnstream_core::trace::TraceStatus;

use crate::transport::{ChatRequest, ChatTransport, Connection, RawFrame};

/// One step of a scripted stream.
#[derive(Clone, Debug)]
pub enum MockStep {
    Frame(RawFrame),
    /// Sleep before the next step (use a paused clock in tests).
    Delay(Duration),
    /// Yield a transport error.
    Fail(ConnectionError),
    /// Stay open forever without sending anything.
    Hang,
}

impl MockStep {
    pub fn json(value: Value) -> Self {
        Self::Frame(RawFrame::json(&value))
    }

    pub fn token(content: &str) -> Self {
        Self::json(json!({"type": "token", "content": content}))
    }

    pub fn trace_start(step_id: &str, tool_name: &str, tool_type: &str) -> Self {
        Self::json(json!({
            "type": "trace_start",
            "step_id": step_id,
            "tool_name": tool_name,
            "tool_type": tool_type,
            "input": {}
        }))
    }

    pub fn trace_update(step_id: &str, status: TraceStatus) -> Self {
        Self::json(json!({"type": "trace_update", "step_id": step_id, "status": status.as_str()}))
    }

    pub fn trace_end(step_id: &str, status: TraceStatus) -> Self {
        Self::json(json!({"type": "trace_end", "step_id": step_id, "status": status.as_str()}))
    }

    pub fn done() -> Self {
        Self::json(json!({"type": "done"}))
    }

    pub fn error(message: &str) -> Self {
        Self::json(json!({"type": "error", "message": message}))
    }
}

/// What the mock does for one `open` call.
#[derive(Clone, Debug)]
pub enum MockScript {
    Stream(Vec<MockStep>),
    /// Fail the `open` call itself.
    Reject(ConnectionError),
}

/// Transport that plays pre-programmed scripts, one per `open` call, in order.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<MockScript>>,
    requests: Mutex<Vec<ChatRequest>>,
    delivered: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Convenience: a transport with a single streamed script.
    pub fn streaming(steps: Vec<MockStep>) -> Self {
        Self::new(vec![MockScript::Stream(steps)])
    }

    pub fn push(&self, script: MockScript) {
        self.scripts.lock().push_back(script);
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Frames actually pulled from scripted streams, across all calls.
    pub fn frames_delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

fn script_stream(
    steps: Vec<MockStep>,
    delivered: Arc<AtomicUsize>,
) -> impl Stream<Item = Result<RawFrame, ConnectionError>> + Send {
    stream::unfold(steps.into_iter(), move |mut steps| {
        let delivered = Arc::clone(&delivered);
        async move {
            loop {
                match steps.next()? {
                    MockStep::Frame(frame) => {
                        let _ = delivered.fetch_add(1, Ordering::Relaxed);
                        return Some((Ok(frame), steps));
                    }
                    MockStep::Fail(e) => return Some((Err(e), steps)),
                    MockStep::Delay(d) => tokio::time::sleep(d).await,
                    MockStep::Hang => std::future::pending::<()>().await,
                }
            }
        }
    })
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectionError> {
        let idx = {
            let mut requests = self.requests.lock();
            requests.push(request);
            requests.len() - 1
        };
        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            ConnectionError::InvalidRequest(format!(
                "MockTransport: no script configured for call {idx}"
            ))
        })?;
        match script {
            MockScript::Stream(steps) => Ok(Connection::new(
                script_stream(steps, Arc::clone(&self.delivered)),
                cancel,
            )),
            MockScript::Reject(e) => Err(e),
        }
    }
}
