use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use flowgate_core::types::RunStatus;

use crate::dispatch::FaultKind;

/// How a single node invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    /// Every incoming edge was dead.
    Skipped,
}

/// One entry in a run's trace.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTrace {
    pub node_id: String,
    pub node_type: String,
    /// Loop iteration indices from the outermost loop inwards.
    pub iteration: Vec<usize>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
    pub cached: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Result of executing an entire workflow graph.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Output per node id. Loop body nodes map to the array of their
    /// per-iteration outputs.
    pub outputs: BTreeMap<String, Value>,
    /// Node invocations in completion order.
    pub trace: Vec<NodeTrace>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeTrace> {
        self.trace.iter().filter(|t| t.status == NodeStatus::Failed)
    }

    /// Every trace entry for a node, across iterations.
    pub fn trace_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeTrace> + 'a {
        self.trace.iter().filter(move |t| t.node_id == node_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
