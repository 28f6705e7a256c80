//! How results travel along edges and how a node's input is assembled.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use flowgate_core::types::ExecutionResult;

use super::plan::GraphPlan;

/// State of one edge within a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeState {
    Pending,
    Delivered(Value),
    /// Settled without a value; the target does not receive anything on it.
    Dead,
}

impl EdgeState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What a result sends along an edge tagged with `handle`.
///
/// Untagged edges carry `data`. Tagged edges carry the named handle; if the
/// result declared no handles at all, the tag is only a port label and the
/// edge carries `data`. Errors send nothing.
pub fn route(result: &ExecutionResult, handle: Option<&str>) -> EdgeState {
    let ExecutionResult::Success { data, handles, .. } = result else {
        return EdgeState::Dead;
    };
    match handle {
        None => EdgeState::Delivered(data.clone()),
        Some(_) if handles.is_empty() => EdgeState::Delivered(data.clone()),
        Some(h) => handles
            .get(h)
            .cloned()
            .map_or(EdgeState::Dead, EdgeState::Delivered),
    }
}

/// Result routed in place of a failure when the node continues on fail.
pub fn failure_payload(message: &str) -> ExecutionResult {
    ExecutionResult::success(json!({ "error": message }))
}

/// A node's input once all its incoming edges have settled.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    Ready(Value),
    /// Every incoming edge is dead.
    Skip,
}

/// Assemble the input of `node` from its settled incoming edges.
///
/// One delivered edge passes its value through; several produce an object
/// keyed by source node id. Entry nodes receive `payload`.
pub fn gather(
    plan: &GraphPlan,
    node: usize,
    edges: &HashMap<usize, EdgeState>,
    payload: &Value,
) -> NodeInput {
    let incoming = plan.incoming(node);
    if incoming.is_empty() {
        return NodeInput::Ready(payload.clone());
    }

    let delivered: Vec<(usize, &Value)> = incoming
        .iter()
        .filter_map(|e| match edges.get(e) {
            Some(EdgeState::Delivered(v)) => Some((*e, v)),
            _ => None,
        })
        .collect();

    match delivered.as_slice() {
        [] => NodeInput::Skip,
        [(_, value)] => NodeInput::Ready((*value).clone()),
        many => {
            let nodes = &plan.graph().nodes;
            let mut by_source = Map::new();
            for (e, value) in many {
                let source = &nodes[plan.source_of(*e)].id;
                by_source.insert(source.clone(), (*value).clone());
            }
            NodeInput::Ready(Value::Object(by_source))
        }
    }
}

/// Whether every incoming edge of `node` has settled.
pub fn is_ready(plan: &GraphPlan, node: usize, edges: &HashMap<usize, EdgeState>) -> bool {
    plan.incoming(node)
        .iter()
        .all(|e| edges.get(e).is_some_and(EdgeState::is_settled))
}
