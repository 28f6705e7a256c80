use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgate_core::config::EngineConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::traits::CredentialResolver;
use flowgate_core::types::{ExecutionContext, ExecutionResult, RunEvent, RunStatus, WorkflowGraph};

use super::plan::{self, GraphPlan, ValidationReport};
use super::report::{NodeStatus, NodeTrace, RunReport};
use super::routing::{failure_payload, gather, is_ready, route, EdgeState, NodeInput};
use crate::dispatch::{DispatchOutcome, NodeDispatcher};

/// Per-run knobs for [`GraphEngine::run_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Generated when absent.
    pub run_id: Option<String>,
    /// Earlier conversation turns, for handlers that need them.
    pub history: Option<Arc<Vec<Value>>>,
    pub cancel: CancellationToken,
}

/// Executes workflow graphs.
///
/// Ready nodes run concurrently. A node whose result carries a fan-out list
/// opens a loop: the nodes downstream of it, up to the first node that joins
/// iterations, run once per item and their outgoing values are collected in
/// iteration order.
pub struct GraphEngine {
    dispatcher: Arc<NodeDispatcher>,
    credentials: Arc<dyn CredentialResolver>,
    events: Option<Arc<EventBus>>,
    max_parallel_iterations: usize,
}

impl GraphEngine {
    pub fn new(
        dispatcher: Arc<NodeDispatcher>,
        credentials: Arc<dyn CredentialResolver>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            dispatcher,
            credentials,
            events: None,
            max_parallel_iterations: config.max_parallel_iterations.max(1),
        }
    }

    /// Publish run progress on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn dispatcher(&self) -> &NodeDispatcher {
        &self.dispatcher
    }

    pub fn validate(&self, graph: &WorkflowGraph) -> ValidationReport {
        plan::validate(graph, self.dispatcher.registry())
    }

    pub async fn run(&self, graph: Arc<WorkflowGraph>, input: Value) -> Result<RunReport> {
        self.run_with(graph, input, RunOptions::default()).await
    }

    /// Execute `graph` with `input` as the payload of every entry node.
    ///
    /// Fails only when the graph does not validate; node faults are reported
    /// in the returned trace.
    pub async fn run_with(
        &self,
        graph: Arc<WorkflowGraph>,
        input: Value,
        options: RunOptions,
    ) -> Result<RunReport> {
        let validation = self.validate(&graph);
        if !validation.is_valid() {
            return Err(FlowgateError::InvalidGraph(validation.errors.join("; ")));
        }
        for warning in &validation.warnings {
            warn!(warning = %warning, "Workflow graph warning");
        }

        let plan = GraphPlan::build(graph)?;
        let run_id = options
            .run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut ctx = ExecutionContext::new(
            run_id.clone(),
            Arc::clone(plan.graph()),
            Arc::clone(&self.credentials),
        );
        if let Some(history) = options.history {
            ctx = ctx.with_history(history);
        }

        let joiners = plan
            .graph()
            .nodes
            .iter()
            .map(|n| self.dispatcher.joins_iterations(&n.node_type))
            .collect();
        let openers = plan
            .graph()
            .nodes
            .iter()
            .map(|n| self.dispatcher.opens_iterations(&n.node_type))
            .collect();
        let node_count = plan.node_count();
        let edge_count = plan.graph().edges.len();

        let state = RunState {
            plan,
            dispatcher: Arc::clone(&self.dispatcher),
            ctx,
            cancel: options.cancel,
            events: self.events.clone(),
            max_parallel: self.max_parallel_iterations,
            joiners,
            openers,
            payload: input,
            trace: Mutex::new(Vec::new()),
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, nodes = node_count, "Workflow run started");
        state.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            node_count,
        });

        let top = Scope::new(
            (0..node_count).collect(),
            (0..edge_count).map(|e| (e, EdgeState::Pending)).collect(),
            Vec::new(),
        );
        let outcome = state.run_scope(top).await;

        let status = if outcome.cancelled {
            RunStatus::Cancelled
        } else if !outcome.failed {
            RunStatus::Completed
        } else if outcome.outputs.keys().any(|&n| state.plan.is_sink(n)) {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Failed
        };
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        info!(run_id = %run_id, status = %status, elapsed_ms, "Workflow run finished");
        state.publish(RunEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            elapsed_ms,
        });

        let nodes = &state.plan.graph().nodes;
        let outputs = outcome
            .outputs
            .into_iter()
            .map(|(n, value)| (nodes[n].id.clone(), value))
            .collect();
        let trace = std::mem::take(&mut *state.trace.lock().unwrap_or_else(PoisonError::into_inner));

        Ok(RunReport {
            run_id,
            status,
            outputs,
            trace,
            started_at,
            elapsed_ms,
        })
    }
}

/// Nodes executed together: the whole graph, or one iteration of a loop body.
struct Scope {
    nodes: BTreeSet<usize>,
    edges: HashMap<usize, EdgeState>,
    iteration: Vec<usize>,
    /// Started, skipped, or claimed by a loop.
    settled: HashSet<usize>,
    loops: Vec<PendingLoop>,
    outputs: BTreeMap<usize, Value>,
    failed: bool,
}

impl Scope {
    fn new(nodes: BTreeSet<usize>, edges: HashMap<usize, EdgeState>, iteration: Vec<usize>) -> Self {
        Self {
            nodes,
            edges,
            iteration,
            settled: HashSet::new(),
            loops: Vec::new(),
            outputs: BTreeMap::new(),
            failed: false,
        }
    }

    fn finish(self, cancelled: bool) -> ScopeOutcome {
        ScopeOutcome {
            edges: self.edges,
            outputs: self.outputs,
            failed: self.failed,
            cancelled,
        }
    }
}

struct ScopeOutcome {
    edges: HashMap<usize, EdgeState>,
    outputs: BTreeMap<usize, Value>,
    failed: bool,
    cancelled: bool,
}

/// A fan-out whose body is waiting for its other inputs to settle.
struct PendingLoop {
    node: usize,
    result: ExecutionResult,
    items: Vec<Value>,
    body: BTreeSet<usize>,
}

enum Completion {
    Node {
        node: usize,
        outcome: DispatchOutcome,
        elapsed_ms: u64,
    },
    Loop {
        node: usize,
        body: BTreeSet<usize>,
        items: usize,
        iterations: Vec<ScopeOutcome>,
    },
}

struct RunState {
    plan: GraphPlan,
    dispatcher: Arc<NodeDispatcher>,
    ctx: ExecutionContext,
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
    max_parallel: usize,
    joiners: Vec<bool>,
    openers: Vec<bool>,
    payload: Value,
    trace: Mutex<Vec<NodeTrace>>,
}

impl RunState {
    fn run_scope(&self, mut scope: Scope) -> BoxFuture<'_, ScopeOutcome> {
        Box::pin(async move {
            let mut in_flight: FuturesUnordered<BoxFuture<'_, Completion>> =
                FuturesUnordered::new();

            loop {
                if self.cancel.is_cancelled() {
                    return scope.finish(true);
                }

                // Skips can make further nodes ready, so repeat until stable
                loop {
                    let ready: Vec<usize> = scope
                        .nodes
                        .iter()
                        .copied()
                        .filter(|n| {
                            !scope.settled.contains(n) && is_ready(&self.plan, *n, &scope.edges)
                        })
                        .collect();
                    if ready.is_empty() {
                        break;
                    }
                    for node in ready {
                        scope.settled.insert(node);
                        match gather(&self.plan, node, &scope.edges, &self.payload) {
                            NodeInput::Ready(input) => {
                                in_flight.push(self.invoke(node, input, scope.iteration.clone()))
                            }
                            NodeInput::Skip => self.skip(&mut scope, node),
                        }
                    }
                }

                let (launch, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut scope.loops)
                    .into_iter()
                    .partition(|l| self.can_launch(l, &scope.edges));
                scope.loops = waiting;
                for pending in launch {
                    in_flight.push(self.launch(&scope, pending));
                }

                if in_flight.is_empty() {
                    if scope.loops.is_empty() {
                        break;
                    }
                    for pending in std::mem::take(&mut scope.loops) {
                        self.abandon(&mut scope, pending);
                    }
                    continue;
                }

                let completion = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    next = in_flight.next() => next,
                };
                match completion {
                    Some(Completion::Node {
                        node,
                        outcome,
                        elapsed_ms,
                    }) => self.complete_node(&mut scope, node, outcome, elapsed_ms),
                    Some(Completion::Loop {
                        node,
                        body,
                        items,
                        iterations,
                    }) => {
                        if iterations.iter().any(|o| o.cancelled) {
                            return scope.finish(true);
                        }
                        self.complete_loop(&mut scope, node, &body, items, iterations);
                    }
                    None => return scope.finish(self.cancel.is_cancelled()),
                }
            }

            scope.finish(false)
        })
    }

    fn invoke(&self, node: usize, input: Value, iteration: Vec<usize>) -> BoxFuture<'_, Completion> {
        Box::pin(async move {
            let graph_node = &self.plan.graph().nodes[node];
            let ctx = self.ctx.for_node(&graph_node.id, &iteration);
            debug!(
                run_id = %self.ctx.run_id,
                node_id = %graph_node.id,
                node_type = %graph_node.node_type,
                iteration = ?iteration,
                "Executing node"
            );
            self.publish(RunEvent::NodeStarted {
                run_id: self.ctx.run_id.clone(),
                node_id: graph_node.id.clone(),
                node_type: graph_node.node_type.clone(),
                iteration,
            });

            let started = Instant::now();
            let outcome = self.dispatcher.dispatch(graph_node, input, &ctx).await;
            Completion::Node {
                node,
                outcome,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        })
    }

    fn complete_node(
        &self,
        scope: &mut Scope,
        node: usize,
        outcome: DispatchOutcome,
        elapsed_ms: u64,
    ) {
        let graph_node = &self.plan.graph().nodes[node];
        let DispatchOutcome {
            result,
            fault,
            cached,
            attempts,
        } = outcome;
        let error = result.error_message().map(String::from);

        self.record(NodeTrace {
            node_id: graph_node.id.clone(),
            node_type: graph_node.node_type.clone(),
            iteration: scope.iteration.clone(),
            status: if error.is_some() {
                NodeStatus::Failed
            } else {
                NodeStatus::Succeeded
            },
            error: error.clone(),
            fault,
            cached,
            attempts,
            elapsed_ms,
        });

        let routed = match error {
            None => {
                self.publish(RunEvent::NodeCompleted {
                    run_id: self.ctx.run_id.clone(),
                    node_id: graph_node.id.clone(),
                    cached,
                    elapsed_ms,
                });
                result
            }
            Some(message) => {
                scope.failed = true;
                let continue_on_fail = graph_node.settings().continue_on_fail;
                warn!(
                    run_id = %self.ctx.run_id,
                    node_id = %graph_node.id,
                    node_type = %graph_node.node_type,
                    fault = ?fault,
                    continue_on_fail,
                    error = %message,
                    "Node failed"
                );
                self.publish(RunEvent::NodeFailed {
                    run_id: self.ctx.run_id.clone(),
                    node_id: graph_node.id.clone(),
                    error: message.clone(),
                });
                if continue_on_fail {
                    failure_payload(&message)
                } else {
                    result
                }
            }
        };

        if let Some(data) = routed.data() {
            scope.outputs.insert(node, data.clone());
        }

        if let Some(items) = routed.fan_out() {
            let body: BTreeSet<usize> = self
                .plan
                .loop_body(node, |n| self.joiners[n], |n| self.openers[n])
                .into_iter()
                .filter(|n| scope.nodes.contains(n) && !scope.settled.contains(n))
                .collect();
            if !body.is_empty() {
                debug!(
                    node_id = %graph_node.id,
                    items = items.len(),
                    body = body.len(),
                    "Opening loop"
                );
                scope.settled.extend(body.iter().copied());
                for &e in self.plan.outgoing(node) {
                    if !body.contains(&self.plan.target_of(e)) {
                        scope.edges.insert(e, route(&routed, self.handle(e)));
                    }
                }
                scope.loops.push(PendingLoop {
                    node,
                    items: items.to_vec(),
                    result: routed,
                    body,
                });
                return;
            }
        }

        for &e in self.plan.outgoing(node) {
            scope.edges.insert(e, route(&routed, self.handle(e)));
        }
    }

    /// A loop starts once every edge entering its body from elsewhere has settled.
    fn can_launch(&self, pending: &PendingLoop, edges: &HashMap<usize, EdgeState>) -> bool {
        pending.body.iter().all(|&b| {
            self.plan.incoming(b).iter().all(|e| {
                let source = self.plan.source_of(*e);
                source == pending.node
                    || pending.body.contains(&source)
                    || edges.get(e).is_some_and(EdgeState::is_settled)
            })
        })
    }

    fn launch(&self, scope: &Scope, pending: PendingLoop) -> BoxFuture<'_, Completion> {
        let iterations: Vec<Scope> = pending
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| self.iteration_scope(scope, &pending, i, item))
            .collect();
        let PendingLoop { node, items, body, .. } = pending;
        let items = items.len();

        Box::pin(async move {
            let iterations = stream::iter(iterations)
                .map(|s| self.run_scope(s))
                .buffered(self.max_parallel)
                .collect::<Vec<_>>()
                .await;
            Completion::Loop {
                node,
                body,
                items,
                iterations,
            }
        })
    }

    fn iteration_scope(&self, outer: &Scope, pending: &PendingLoop, index: usize, item: &Value) -> Scope {
        let mut edges = HashMap::new();
        for &b in &pending.body {
            for &e in self.plan.incoming(b) {
                let source = self.plan.source_of(e);
                let state = if source == pending.node {
                    match route(&pending.result, self.handle(e)) {
                        EdgeState::Delivered(_) => EdgeState::Delivered(item.clone()),
                        other => other,
                    }
                } else if pending.body.contains(&source) {
                    EdgeState::Pending
                } else {
                    outer.edges.get(&e).cloned().unwrap_or(EdgeState::Dead)
                };
                edges.insert(e, state);
            }
            for &e in self.plan.outgoing(b) {
                edges.entry(e).or_insert(EdgeState::Pending);
            }
        }

        let mut iteration = outer.iteration.clone();
        iteration.push(index);
        Scope::new(pending.body.clone(), edges, iteration)
    }

    /// Fan-in: each edge leaving the body delivers, in iteration order, the
    /// values it carried in the iterations where it fired.
    fn complete_loop(
        &self,
        scope: &mut Scope,
        node: usize,
        body: &BTreeSet<usize>,
        items: usize,
        iterations: Vec<ScopeOutcome>,
    ) {
        for &b in body {
            for &e in self.plan.outgoing(b) {
                if body.contains(&self.plan.target_of(e)) {
                    continue;
                }
                let delivered: Vec<Value> = iterations
                    .iter()
                    .filter_map(|it| match it.edges.get(&e) {
                        Some(EdgeState::Delivered(v)) => Some(v.clone()),
                        _ => None,
                    })
                    .collect();
                let state = if items == 0 || !delivered.is_empty() {
                    EdgeState::Delivered(Value::Array(delivered))
                } else {
                    EdgeState::Dead
                };
                scope.edges.insert(e, state);
            }

            let per_iteration: Vec<Value> = iterations
                .iter()
                .filter_map(|it| it.outputs.get(&b).cloned())
                .collect();
            if !per_iteration.is_empty() {
                scope.outputs.insert(b, Value::Array(per_iteration));
            }
        }

        if iterations.iter().any(|it| it.failed) {
            scope.failed = true;
        }
        debug!(
            node_id = %self.plan.graph().nodes[node].id,
            iterations = items,
            "Loop finished"
        );
    }

    /// Drop a loop whose body waits on nodes that can never settle.
    fn abandon(&self, scope: &mut Scope, pending: PendingLoop) {
        warn!(
            run_id = %self.ctx.run_id,
            node_id = %self.plan.graph().nodes[pending.node].id,
            "Loop body waits on its own output; skipping it"
        );
        scope.failed = true;
        for &b in &pending.body {
            self.skip(scope, b);
        }
    }

    fn skip(&self, scope: &mut Scope, node: usize) {
        let graph_node = &self.plan.graph().nodes[node];
        debug!(node_id = %graph_node.id, "Skipping node on dead path");
        self.record(NodeTrace {
            node_id: graph_node.id.clone(),
            node_type: graph_node.node_type.clone(),
            iteration: scope.iteration.clone(),
            status: NodeStatus::Skipped,
            error: None,
            fault: None,
            cached: false,
            attempts: 0,
            elapsed_ms: 0,
        });
        self.publish(RunEvent::NodeSkipped {
            run_id: self.ctx.run_id.clone(),
            node_id: graph_node.id.clone(),
        });
        for &e in self.plan.outgoing(node) {
            scope.edges.insert(e, EdgeState::Dead);
        }
    }

    fn handle(&self, edge: usize) -> Option<&str> {
        self.plan.graph().edges[edge].source_handle.as_deref()
    }

    fn record(&self, entry: NodeTrace) {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}
