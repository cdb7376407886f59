use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::StepId;

/// Lifecycle status of a trace step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    #[default]
    #[serde(alias = "running", alias = "in_progress")]
    Pending,
    #[serde(alias = "completed", alias = "ok")]
    Success,
    #[serde(alias = "failed")]
    Error,
}

impl TraceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad classification of `tool_type` strings sent by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolKind {
    Mcp,
    OpenApi,
    A2a,
    Function,
    Other,
}

impl ToolKind {
    pub fn classify(tool_type: &str) -> Self {
        match tool_type.to_ascii_lowercase().as_str() {
            "mcp" => Self::Mcp,
            "openapi" | "open_api" => Self::OpenApi,
            "a2a" | "agent" => Self::A2a,
            "function" | "tool" => Self::Function,
            _ => Self::Other,
        }
    }
}

/// Token usage reported on `trace_end`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl TokenCounts {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none() && self.total.is_none()
    }

    /// Reported total, or input + output when the server omitted it.
    pub fn effective_total(&self) -> Option<u64> {
        self.total.or(match (self.input, self.output) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        })
    }
}

/// Where a step was dispatched to, when the server says so.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openapi_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a2a_agent: Option<String>,
}

/// One tool, model or agent invocation inside a turn.
///
/// Nodes live in an arena keyed by [`StepId`]; `children` holds ids, never
/// references, in `trace_start` arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceNode {
    pub id: StepId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<StepId>,
    pub name: String,
    pub tool_type: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "TokenCounts::is_empty")]
    pub tokens: TokenCounts,
    #[serde(default)]
    pub metadata: TraceMetadata,
    #[serde(default)]
    pub children: Vec<StepId>,
}

impl TraceNode {
    /// True once a `trace_end` has been applied.
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn kind(&self) -> ToolKind {
        ToolKind::classify(&self.tool_type)
    }
}

/// Owned, read-only copy of one turn's call tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceTree {
    pub roots: Vec<StepId>,
    pub nodes: HashMap<StepId, TraceNode>,
}

/// Recursive owned view of a trace node, for exporters and renderers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NestedTraceNode {
    #[serde(flatten)]
    pub node: TraceNode,
    pub depth: usize,
    #[serde(rename = "nested")]
    pub nested: Vec<NestedTraceNode>,
}

/// Aggregate numbers over a trace tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub total: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub max_depth: usize,
    pub total_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TraceTree {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: &StepId) -> Option<&TraceNode> {
        self.nodes.get(id)
    }

    /// Depth-first walk in child order, yielding `(depth, node)`.
    pub fn walk(&self) -> Vec<(usize, &TraceNode)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut todo: Vec<(usize, &StepId)> = self.roots.iter().rev().map(|id| (0, id)).collect();
        while let Some((depth, id)) = todo.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push((depth, node));
            todo.extend(node.children.iter().rev().map(|c| (depth + 1, c)));
        }
        out
    }

    pub fn nested(&self) -> Vec<NestedTraceNode> {
        self.roots
            .iter()
            .filter_map(|id| self.nest(id, 0))
            .collect()
    }

    fn nest(&self, id: &StepId, depth: usize) -> Option<NestedTraceNode> {
        let node = self.nodes.get(id)?;
        let nested = node
            .children
            .iter()
            .filter_map(|c| self.nest(c, depth + 1))
            .collect();
        Some(NestedTraceNode {
            node: node.clone(),
            depth,
            nested,
        })
    }

    pub fn summary(&self) -> TraceSummary {
        let mut s = TraceSummary::default();
        for (depth, node) in self.walk() {
            s.total += 1;
            s.max_depth = s.max_depth.max(depth + 1);
            match node.status {
                TraceStatus::Pending => s.pending += 1,
                TraceStatus::Success => s.succeeded += 1,
                TraceStatus::Error => s.failed += 1,
            }
            s.total_latency_ms += node.latency_ms.unwrap_or(0);
            s.input_tokens += node.tokens.input.unwrap_or(0);
            s.output_tokens += node.tokens.output.unwrap_or(0);
            s.total_tokens += node.tokens.effective_total().unwrap_or(0);
        }
        s
    }
}
