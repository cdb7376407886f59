//! Flat trace events → call tree.
//!
//! A trace_start attaches its node under the step at the top of the parent
//! stack (or to the root list when the stack is empty) and pushes itself. A
//! trace_end pops only when it closes the current top. Nodes are kept in an
//! arena keyed by step id; child lists hold ids in arrival order.
//!
//! Events that cannot be applied cleanly never fail the stream. They are
//! returned as a [`TraceAnomaly`], recorded, and logged at warn.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use turnstream_core::events::{StreamEvent, TraceEnd, TraceStart, TraceUpdate};
use turnstream_core::ids::StepId;
use turnstream_core::trace::{TraceNode, TraceStatus, TraceTree};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceAnomaly {
    /// trace_update for a step that was never started.
    OrphanUpdate { step_id: StepId },
    /// trace_end for a step that was never started.
    OrphanEnd { step_id: StepId },
    /// Second trace_start for an existing step; the node is left as is.
    DuplicateStart { step_id: StepId },
    /// Second trace_end for a step; the first end wins.
    DuplicateEnd { step_id: StepId },
    UpdateAfterEnd { step_id: StepId },
    /// trace_end for a step that is not the current top of the parent stack.
    /// The node is ended but the stack is not popped.
    StackMismatch {
        step_id: StepId,
        top: Option<StepId>,
    },
}

impl TraceAnomaly {
    pub fn step_id(&self) -> &StepId {
        match self {
            Self::OrphanUpdate { step_id }
            | Self::OrphanEnd { step_id }
            | Self::DuplicateStart { step_id }
            | Self::DuplicateEnd { step_id }
            | Self::UpdateAfterEnd { step_id }
            | Self::StackMismatch { step_id, .. } => step_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrphanUpdate { .. } => "orphan_update",
            Self::OrphanEnd { .. } => "orphan_end",
            Self::DuplicateStart { .. } => "duplicate_start",
            Self::DuplicateEnd { .. } => "duplicate_end",
            Self::UpdateAfterEnd { .. } => "update_after_end",
            Self::StackMismatch { .. } => "stack_mismatch",
        }
    }
}

impl fmt::Display for TraceAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackMismatch {
                step_id,
                top: Some(top),
            } => write!(f, "stack_mismatch: ended {step_id} while {top} is open"),
            other => write!(f, "{}: {}", other.kind(), other.step_id()),
        }
    }
}

/// Result of applying one trace event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceOutcome {
    Applied,
    /// The event changed the node, with a side condition worth reporting.
    AppliedWith(TraceAnomaly),
    /// The event changed nothing.
    Ignored(TraceAnomaly),
}

impl TraceOutcome {
    pub fn applied(&self) -> bool {
        !matches!(self, Self::Ignored(_))
    }

    pub fn anomaly(&self) -> Option<&TraceAnomaly> {
        match self {
            Self::Applied => None,
            Self::AppliedWith(a) | Self::Ignored(a) => Some(a),
        }
    }
}

/// Per-turn call tree builder.
#[derive(Debug, Default)]
pub struct TraceAggregator {
    nodes: HashMap<StepId, TraceNode>,
    stack: Vec<StepId>,
    roots: Vec<StepId>,
    anomalies: Vec<TraceAnomaly>,
}

impl TraceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a trace event. Returns `None` for non-trace events.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<TraceOutcome> {
        match event {
            StreamEvent::TraceStart(e) => Some(self.on_trace_start(e)),
            StreamEvent::TraceUpdate(e) => Some(self.on_trace_update(e)),
            StreamEvent::TraceEnd(e) => Some(self.on_trace_end(e)),
            _ => None,
        }
    }

    pub fn on_trace_start(&mut self, event: &TraceStart) -> TraceOutcome {
        self.on_trace_start_at(event, Utc::now())
    }

    pub fn on_trace_start_at(&mut self, event: &TraceStart, now: DateTime<Utc>) -> TraceOutcome {
        if self.nodes.contains_key(&event.step_id) {
            return self.reject(TraceAnomaly::DuplicateStart {
                step_id: event.step_id.clone(),
            });
        }

        let parent_id = self.stack.last().cloned();
        match &parent_id {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(parent) {
                    p.children.push(event.step_id.clone());
                }
            }
            None => self.roots.push(event.step_id.clone()),
        }

        let node = TraceNode {
            id: event.step_id.clone(),
            parent_id,
            name: event.name.clone(),
            tool_type: event.tool_type.clone(),
            status: TraceStatus::Pending,
            start_time: now,
            end_time: None,
            latency_ms: None,
            input: event.input.clone(),
            output: None,
            error: None,
            tokens: Default::default(),
            metadata: event.metadata.clone(),
            children: Vec::new(),
        };
        let _ = self.nodes.insert(event.step_id.clone(), node);
        self.stack.push(event.step_id.clone());
        TraceOutcome::Applied
    }

    /// Status changes are accepted only while the step is open.
    pub fn on_trace_update(&mut self, event: &TraceUpdate) -> TraceOutcome {
        let Some(node) = self.nodes.get_mut(&event.step_id) else {
            return self.reject(TraceAnomaly::OrphanUpdate {
                step_id: event.step_id.clone(),
            });
        };
        if node.is_ended() {
            return self.reject(TraceAnomaly::UpdateAfterEnd {
                step_id: event.step_id.clone(),
            });
        }
        node.status = event.status;
        TraceOutcome::Applied
    }

    pub fn on_trace_end(&mut self, event: &TraceEnd) -> TraceOutcome {
        self.on_trace_end_at(event, Utc::now())
    }

    pub fn on_trace_end_at(&mut self, event: &TraceEnd, now: DateTime<Utc>) -> TraceOutcome {
        let Some(node) = self.nodes.get_mut(&event.step_id) else {
            return self.reject(TraceAnomaly::OrphanEnd {
                step_id: event.step_id.clone(),
            });
        };
        if node.is_ended() {
            return self.reject(TraceAnomaly::DuplicateEnd {
                step_id: event.step_id.clone(),
            });
        }

        let elapsed = (now - node.start_time).num_milliseconds().max(0) as u64;
        node.status = event.status;
        node.end_time = Some(now);
        node.latency_ms = Some(event.latency_ms.unwrap_or(elapsed));
        node.output = event.output.clone();
        node.error = event.error.clone();
        node.tokens = event.tokens;

        if self.stack.last() == Some(&event.step_id) {
            let _ = self.stack.pop();
            return TraceOutcome::Applied;
        }
        let anomaly = TraceAnomaly::StackMismatch {
            step_id: event.step_id.clone(),
            top: self.stack.last().cloned(),
        };
        self.record(&anomaly);
        TraceOutcome::AppliedWith(anomaly)
    }

    fn reject(&mut self, anomaly: TraceAnomaly) -> TraceOutcome {
        self.record(&anomaly);
        TraceOutcome::Ignored(anomaly)
    }

    fn record(&mut self, anomaly: &TraceAnomaly) {
        warn!(
            step_id = %anomaly.step_id(),
            anomaly = anomaly.kind(),
            stack_depth = self.stack.len(),
            "trace event absorbed: {anomaly}"
        );
        self.anomalies.push(anomaly.clone());
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.stack.clear();
        self.roots.clear();
        self.anomalies.clear();
    }

    pub fn get_node(&self, id: &StepId) -> Option<&TraceNode> {
        self.nodes.get(id)
    }

    pub fn roots(&self) -> &[StepId] {
        &self.roots
    }

    /// Open ancestor chain, outermost first.
    pub fn stack(&self) -> &[StepId] {
        &self.stack
    }

    pub fn anomalies(&self) -> &[TraceAnomaly] {
        &self.anomalies
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Steps without a trace_end, depth-first in child order.
    pub fn pending(&self) -> Vec<&TraceNode> {
        let mut out = Vec::new();
        let mut todo: Vec<&StepId> = self.roots.iter().rev().collect();
        while let Some(id) = todo.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if !node.is_ended() {
                out.push(node);
            }
            todo.extend(node.children.iter().rev());
        }
        out
    }

    pub fn snapshot(&self) -> TraceTree {
        TraceTree {
            roots: self.roots.clone(),
            nodes: self.nodes.clone(),
        }
    }
}
