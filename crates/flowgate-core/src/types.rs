use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::traits::CredentialResolver;

// ── Workflow graph ──────────────────────────────────────────────

/// A node in a workflow graph.
///
/// Deserializes from either the plain `{ id, type, config }` form or the
/// editor form `{ id, data: { id: <node type>, ... } }` used by stored
/// templates, where `data` doubles as the node config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub config: Value,
}

#[derive(Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type", default)]
    node_type: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

impl From<RawNode> for GraphNode {
    fn from(raw: RawNode) -> Self {
        match (raw.config, raw.data) {
            (None, Some(data)) if data.is_object() => {
                let node_type = data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or(raw.node_type)
                    .unwrap_or_default();
                Self {
                    id: raw.id,
                    node_type,
                    config: data,
                }
            }
            (config, _) => Self {
                id: raw.id,
                node_type: raw.node_type.unwrap_or_default(),
                config: config.unwrap_or_else(|| Value::Object(Default::default())),
            },
        }
    }
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
        }
    }

    /// Execution knobs read from this node's config.
    pub fn settings(&self) -> NodeSettings {
        NodeSettings::from_config(&self.config)
    }
}

/// A directed edge, optionally tagged with the source handle it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    #[serde(
        default,
        rename = "sourceHandle",
        alias = "source_handle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

impl GraphEdge {
    /// Create an untagged edge carrying the source's generic payload.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    /// Create an edge that only fires when the source emits `handle`.
    pub fn with_handle(
        source: impl Into<String>,
        target: impl Into<String>,
        handle: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: Some(handle.into()),
        }
    }
}

/// The read-only graph a run traverses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a serialized graph, such as one cloned verbatim from a template.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ── Node settings ───────────────────────────────────────────────

/// Config keys that tune how a node is executed rather than what it does.
pub const VOLATILE_CONFIG_KEYS: &[&str] = &[
    "retry_count",
    "timeout",
    "cacheable",
    "cache_ttl",
    "continue_on_fail",
];

/// Execution-mechanics knobs carried in a node's config.
///
/// Numbers are accepted as JSON numbers or numeric strings since editor
/// forms often store everything as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSettings {
    pub retry_count: u32,
    pub timeout_secs: Option<u64>,
    pub cacheable: Option<bool>,
    pub cache_ttl_secs: Option<u64>,
    pub continue_on_fail: bool,
}

impl NodeSettings {
    pub fn from_config(config: &Value) -> Self {
        Self {
            retry_count: lenient_u64(config.get("retry_count"))
                .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX)),
            timeout_secs: lenient_u64(config.get("timeout")),
            cacheable: lenient_bool(config.get("cacheable")),
            cache_ttl_secs: lenient_u64(config.get("cache_ttl")),
            continue_on_fail: lenient_bool(config.get("continue_on_fail")).unwrap_or(false),
        }
    }
}

fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a flag written as a JSON bool, a number, or text such as `"yes"`.
pub fn lenient_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_u64().map(|v| v != 0),
        _ => None,
    }
}

// ── Execution contract ──────────────────────────────────────────

/// Outcome of one handler invocation.
///
/// Success carries a generic payload, optional named handles for routing,
/// and an optional fan-out list that makes the engine run the downstream
/// subgraph once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        handles: BTreeMap<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fan_out: Option<Vec<Value>>,
    },
    Error {
        error: String,
    },
}

impl ExecutionResult {
    pub fn success(data: Value) -> Self {
        Self::Success {
            data,
            handles: BTreeMap::new(),
            fan_out: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Attach a named output handle. No effect on an error result.
    pub fn with_handle(mut self, name: impl Into<String>, value: Value) -> Self {
        if let Self::Success { handles, .. } = &mut self {
            handles.insert(name.into(), value);
        }
        self
    }

    /// Mark this result as a loop/batch source. No effect on an error result.
    pub fn with_fan_out(mut self, items: Vec<Value>) -> Self {
        if let Self::Success { fan_out, .. } = &mut self {
            *fan_out = Some(items);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Error { .. } => None,
        }
    }

    pub fn handles(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Success { handles, .. } => Some(handles),
            Self::Error { .. } => None,
        }
    }

    pub fn fan_out(&self) -> Option<&[Value]> {
        match self {
            Self::Success { fan_out, .. } => fan_out.as_deref(),
            Self::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error } => Some(error),
            Self::Success { .. } => None,
        }
    }
}

/// Optional metadata a handler binding declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_handles: Vec<String>,
    #[serde(default)]
    pub required_credentials: Vec<String>,
    #[serde(default)]
    pub cacheable_by_default: bool,
    /// Closes a loop body: receives the collected per-iteration values.
    #[serde(default)]
    pub joins_iterations: bool,
    /// Emits fan-out lists. A joiner downstream of it closes its loop
    /// rather than an enclosing one.
    #[serde(default)]
    pub opens_iterations: bool,
}

impl HandlerMetadata {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }
}

/// Per-invocation context handed to a handler by reference.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub node_id: String,
    pub graph: Arc<WorkflowGraph>,
    pub history: Option<Arc<Vec<Value>>>,
    /// Loop iteration indices from the outermost loop inwards.
    pub iteration: Vec<usize>,
    pub attempt: u32,
    credentials: Arc<dyn CredentialResolver>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        graph: Arc<WorkflowGraph>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: String::new(),
            graph,
            history: None,
            iteration: Vec::new(),
            attempt: 0,
            credentials,
        }
    }

    pub fn with_history(mut self, history: Arc<Vec<Value>>) -> Self {
        self.history = Some(history);
        self
    }

    /// Derive the context for one node invocation.
    pub fn for_node(&self, node_id: &str, iteration: &[usize]) -> Self {
        let mut ctx = self.clone();
        ctx.node_id = node_id.to_string();
        ctx.iteration = iteration.to_vec();
        ctx.attempt = 0;
        ctx
    }

    /// The node currently being executed, if present in the graph.
    pub fn node(&self) -> Option<&GraphNode> {
        self.graph.node(&self.node_id)
    }

    /// Resolve a credential by key.
    pub async fn credential(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        self.credentials.get_credential(key).await
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("nodes", &self.graph.nodes.len())
            .field("iteration", &self.iteration)
            .field("attempt", &self.attempt)
            .finish()
    }
}

// ── Runs ────────────────────────────────────────────────────────

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A run waiting on a worker queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRun {
    pub run_id: String,
    pub workflow: WorkflowGraph,
    #[serde(default)]
    pub input: Value,
    pub queued_at: DateTime<Utc>,
}

impl QueuedRun {
    pub fn new(workflow: WorkflowGraph, input: Value) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow,
            input,
            queued_at: Utc::now(),
        }
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        node_count: usize,
    },
    NodeStarted {
        run_id: String,
        node_id: String,
        node_type: String,
        iteration: Vec<usize>,
    },
    NodeCompleted {
        run_id: String,
        node_id: String,
        cached: bool,
        elapsed_ms: u64,
    },
    NodeFailed {
        run_id: String,
        node_id: String,
        error: String,
    },
    NodeSkipped {
        run_id: String,
        node_id: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        elapsed_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_node_shape() {
        let node: GraphNode = serde_json::from_value(json!({
            "id": "n1",
            "type": "conditional_branch",
            "config": {"operator": "equals"}
        }))
        .unwrap();
        assert_eq!(node.node_type, "conditional_branch");
        assert_eq!(node.config["operator"], "equals");
    }

    #[test]
    fn test_editor_node_shape() {
        let node: GraphNode = serde_json::from_value(json!({
            "id": "node-7",
            "type": "custom",
            "position": {"x": 10, "y": 20},
            "data": {"id": "split_in_batches", "label": "Split", "batch_size": 2}
        }))
        .unwrap();
        assert_eq!(node.node_type, "split_in_batches");
        assert_eq!(node.config["batch_size"], 2);
    }

    #[test]
    fn test_node_without_config_gets_empty_object() {
        let node: GraphNode = serde_json::from_value(json!({"id": "a", "type": "noop"})).unwrap();
        assert!(node.config.as_object().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn test_edge_handle_aliases() {
        let e: GraphEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "sourceHandle": "true_result"}))
                .unwrap();
        assert_eq!(e.source_handle.as_deref(), Some("true_result"));

        let e: GraphEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "source_handle": "x"})).unwrap();
        assert_eq!(e.source_handle.as_deref(), Some("x"));

        let e: GraphEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "sourceHandle": null})).unwrap();
        assert!(e.source_handle.is_none());
    }

    #[test]
    fn test_settings_lenient_parsing() {
        let s = NodeSettings::from_config(&json!({
            "retry_count": "2",
            "timeout": 15,
            "cacheable": "true",
            "continue_on_fail": true
        }));
        assert_eq!(s.retry_count, 2);
        assert_eq!(s.timeout_secs, Some(15));
        assert_eq!(s.cacheable, Some(true));
        assert!(s.continue_on_fail);

        let s = NodeSettings::from_config(&json!({}));
        assert_eq!(s, NodeSettings::default());
    }

    #[test]
    fn test_oversized_retry_count_saturates() {
        let s = NodeSettings::from_config(&json!({"retry_count": 4_294_967_299u64}));
        assert_eq!(s.retry_count, u32::MAX);
        let s = NodeSettings::from_config(&json!({"retry_count": "99999999999"}));
        assert_eq!(s.retry_count, u32::MAX);
    }

    #[test]
    fn test_lenient_bool_forms() {
        assert_eq!(lenient_bool(Some(&json!(" Yes "))), Some(true));
        assert_eq!(lenient_bool(Some(&json!("0"))), Some(false));
        assert_eq!(lenient_bool(Some(&json!(1))), Some(true));
        assert_eq!(lenient_bool(Some(&json!("maybe"))), None);
        assert_eq!(lenient_bool(None), None);
    }

    #[test]
    fn test_result_builders_ignore_error_variant() {
        let r = ExecutionResult::error("boom").with_handle("x", json!(1));
        assert_eq!(r.error_message(), Some("boom"));
        assert!(r.handles().is_none());

        let r = ExecutionResult::success(json!(1))
            .with_handle("true_result", json!(1))
            .with_fan_out(vec![json!(1), json!(2)]);
        assert_eq!(r.handles().unwrap().len(), 1);
        assert_eq!(r.fan_out().unwrap().len(), 2);
    }

    #[test]
    fn test_result_wire_shape() {
        let r = ExecutionResult::success(json!({"a": 1})).with_handle("false_result", json!({"a": 1}));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "success");
        assert_eq!(v["handles"]["false_result"]["a"], 1);
        assert!(v.get("fan_out").is_none());

        let parsed: ExecutionResult =
            serde_json::from_value(json!({"status": "error", "error": "bad token"})).unwrap();
        assert_eq!(parsed.error_message(), Some("bad token"));
    }
}
