//! Shared fixtures for Flowgate tests: handlers with call counters, a
//! manually driven clock, an always-failing store, and graph builders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use flowgate_core::clock::Clock;
use flowgate_core::credentials::NoCredentials;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::{Handler, KvStore, QueueStore};
use flowgate_core::types::{
    ExecutionContext, ExecutionResult, GraphEdge, GraphNode, WorkflowGraph,
};

// ── Call counting ───────────────────────────────────────────────

/// Shared invocation counter handed to mock handlers.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call, returning the number of calls before this one.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Mock handlers ───────────────────────────────────────────────

/// Returns its input as the payload.
pub struct EchoHandler {
    calls: CallCounter,
}

impl EchoHandler {
    pub fn new(calls: CallCounter) -> Self {
        Self { calls }
    }
}

impl Handler for EchoHandler {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        self.calls.hit();
        Box::pin(async move { Ok(ExecutionResult::success(input)) })
    }
}

/// Always fails with the same message.
pub struct FailingHandler {
    message: String,
    calls: CallCounter,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>, calls: CallCounter) -> Self {
        Self {
            message: message.into(),
            calls,
        }
    }
}

impl Handler for FailingHandler {
    fn execute<'a>(
        &'a self,
        _input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        self.calls.hit();
        let message = self.message.clone();
        Box::pin(async move { Ok(ExecutionResult::error(message)) })
    }
}

/// Fails the first `failures` calls with `Err`, then echoes.
pub struct FlakyHandler {
    failures: usize,
    calls: CallCounter,
}

impl FlakyHandler {
    pub fn new(failures: usize, calls: CallCounter) -> Self {
        Self { failures, calls }
    }
}

impl Handler for FlakyHandler {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let before = self.calls.hit();
        let fail = before < self.failures;
        Box::pin(async move {
            if fail {
                Err(FlowgateError::HandlerExecution {
                    node_type: "flaky".into(),
                    message: format!("transient failure #{}", before + 1),
                })
            } else {
                Ok(ExecutionResult::success(input))
            }
        })
    }
}

/// Sleeps before echoing its input.
pub struct SlowHandler {
    delay: Duration,
    calls: CallCounter,
}

impl SlowHandler {
    pub fn new(delay: Duration, calls: CallCounter) -> Self {
        Self { delay, calls }
    }
}

impl Handler for SlowHandler {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        self.calls.hit();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ExecutionResult::success(input))
        })
    }
}

/// Handler driven by a plain function of its input.
pub struct FnHandler<F> {
    f: F,
    calls: CallCounter,
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> ExecutionResult + Send + Sync,
{
    pub fn new(f: F, calls: CallCounter) -> Self {
        Self { f, calls }
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(Value) -> ExecutionResult + Send + Sync,
{
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        self.calls.hit();
        let result = (self.f)(input);
        Box::pin(async move { Ok(result) })
    }
}

// ── Clock ───────────────────────────────────────────────────────

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at 2025-01-01T00:00:00Z.
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::at(start)
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ── Faulty store ────────────────────────────────────────────────

/// Backing store that is permanently unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct FaultyStore;

fn unavailable<T: Send + 'static>() -> BoxFuture<'static, Result<T>> {
    Box::pin(async { Err(FlowgateError::Store("connection refused".into())) })
}

impl KvStore for FaultyStore {
    fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        unavailable()
    }

    fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }

    fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<String>,
        _ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<bool>> {
        unavailable()
    }

    fn incr(&self, _key: &str) -> BoxFuture<'_, Result<i64>> {
        unavailable()
    }

    fn delete(&self, _key: &str) -> BoxFuture<'_, Result<bool>> {
        unavailable()
    }

    fn scan_prefix(&self, _prefix: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        unavailable()
    }

    fn expire(&self, _key: &str, _ttl: Duration) -> BoxFuture<'_, Result<bool>> {
        unavailable()
    }

    fn purge_expired(&self) -> BoxFuture<'_, Result<usize>> {
        unavailable()
    }
}

impl QueueStore for FaultyStore {
    fn push(&self, _queue: &str, _item: String) -> BoxFuture<'_, Result<()>> {
        unavailable()
    }

    fn pop(&self, _queue: &str) -> BoxFuture<'_, Result<Option<String>>> {
        unavailable()
    }

    fn len(&self, _queue: &str) -> BoxFuture<'_, Result<u64>> {
        unavailable()
    }
}

// ── Graph builders ──────────────────────────────────────────────

pub fn node(id: &str, node_type: &str) -> GraphNode {
    GraphNode::new(id, node_type, Value::Object(Default::default()))
}

pub fn node_with(id: &str, node_type: &str, config: Value) -> GraphNode {
    GraphNode::new(id, node_type, config)
}

pub fn edge(source: &str, target: &str) -> GraphEdge {
    GraphEdge::new(source, target)
}

pub fn handle_edge(source: &str, target: &str, handle: &str) -> GraphEdge {
    GraphEdge::with_handle(source, target, handle)
}

pub fn graph(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Arc<WorkflowGraph> {
    Arc::new(WorkflowGraph::new(nodes, edges))
}

/// Context for invoking a handler outside of a run.
pub fn test_context(node_id: &str) -> ExecutionContext {
    let ctx = ExecutionContext::new("test-run", Arc::new(WorkflowGraph::default()), Arc::new(NoCredentials));
    ctx.for_node(node_id, &[])
}
