use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A captured warn+ log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub thread_id: Option<String>,
    pub step_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub thread_id: Option<String>,
    pub limit: Option<usize>,
}

/// Bounded in-memory buffer of recent warn+ records, newest last.
pub struct LogCapture {
    inner: Mutex<CaptureState>,
    capacity: usize,
}

struct CaptureState {
    records: VecDeque<LogRecord>,
    next_seq: u64,
}

impl LogCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CaptureState {
                records: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, mut record: LogRecord) {
        let mut state = self.inner.lock();
        record.seq = state.next_seq;
        state.next_seq += 1;
        if state.records.len() == self.capacity {
            let _ = state.records.pop_front();
        }
        state.records.push_back(record);
    }

    /// Matching records, newest first.
    pub fn query(&self, q: &LogQuery) -> Vec<LogRecord> {
        let state = self.inner.lock();
        state
            .records
            .iter()
            .rev()
            .filter(|r| q.level.as_ref().map_or(true, |l| r.level.eq_ignore_ascii_case(l)))
            .filter(|r| q.target.as_ref().map_or(true, |t| r.target.contains(t.as_str())))
            .filter(|r| {
                q.thread_id
                    .as_ref()
                    .map_or(true, |t| r.thread_id.as_deref() == Some(t.as_str()))
            })
            .take(q.limit.unwrap_or(100))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }
}

/// tracing Layer that feeds warn+ events into a [`LogCapture`].
pub struct CaptureLayer {
    capture: Arc<LogCapture>,
}

impl CaptureLayer {
    pub fn new(capture: Arc<LogCapture>) -> Self {
        Self { capture }
    }
}

/// Splits an event's fields into the promoted ones and the rest.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    thread_id: Option<String>,
    step_id: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        let _ = self.fields.insert(field.name().to_owned(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.record_str(field, text.trim_matches('"'));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        let slot = match field.name() {
            "message" => &mut self.message,
            "thread_id" => &mut self.thread_id,
            "step_id" => &mut self.step_id,
            _ => return self.put(field, value.into()),
        };
        *slot = Some(value.to_owned());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Stored on spans so child events inherit the thread id.
struct SpanThread(String);

impl<S> Layer<S> for CaptureLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.thread_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(SpanThread(id)) = span.extensions().get::<SpanThread>() {
                        visitor.thread_id = Some(id.clone());
                        break;
                    }
                }
            }
        }

        self.capture.push(LogRecord {
            seq: 0,
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            thread_id: visitor.thread_id,
            step_id: visitor.step_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if let (Some(thread_id), Some(span)) = (visitor.thread_id, ctx.span(id)) {
            span.extensions_mut().insert(SpanThread(thread_id));
        }
    }

    /// Spans declared with `thread_id = Empty` fill it in later.
    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);

        if let (Some(thread_id), Some(span)) = (visitor.thread_id, ctx.span(id)) {
            let _ = span.extensions_mut().replace(SpanThread(thread_id));
        }
    }
}
