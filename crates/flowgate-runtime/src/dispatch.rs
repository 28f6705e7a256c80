use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use flowgate_core::error::FlowgateError;
use flowgate_core::types::{ExecutionContext, ExecutionResult, GraphNode, HandlerMetadata};
use flowgate_nodes::NodeRegistry;

use crate::cache::ResultCache;
use crate::circuit::{Admission, CircuitBreaker};

/// Why a node invocation ended in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The handler ran and failed, timed out, or could not be built.
    Handler,
    /// The circuit breaker declined the call. Not counted against the circuit.
    Admission,
    /// No handler is registered for the node type.
    NotFound,
}

/// Everything the engine learns from one node invocation.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: ExecutionResult,
    pub fault: Option<FaultKind>,
    pub cached: bool,
    /// Handler executions performed, retries included.
    pub attempts: u32,
}

impl DispatchOutcome {
    fn failed(message: impl Into<String>, fault: FaultKind, attempts: u32) -> Self {
        Self {
            result: ExecutionResult::error(message),
            fault: Some(fault),
            cached: false,
            attempts,
        }
    }
}

/// Runs one node: cache, then admission, then the handler.
pub struct NodeDispatcher {
    registry: Arc<NodeRegistry>,
    circuit: Arc<CircuitBreaker>,
    cache: Arc<ResultCache>,
    default_timeout: Duration,
}

impl NodeDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        circuit: Arc<CircuitBreaker>,
        cache: Arc<ResultCache>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            circuit,
            cache,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Whether a node type closes loop bodies.
    pub fn joins_iterations(&self, node_type: &str) -> bool {
        self.registry
            .resolve(node_type)
            .map(|b| b.metadata().joins_iterations)
            .unwrap_or(false)
    }

    /// Whether a node type opens loops.
    pub fn opens_iterations(&self, node_type: &str) -> bool {
        self.registry
            .resolve(node_type)
            .map(|b| b.metadata().opens_iterations)
            .unwrap_or(false)
    }

    /// Invoke `node` with `input`. Never fails: every fault comes back as an
    /// error result tagged with its kind.
    pub async fn dispatch(
        &self,
        node: &GraphNode,
        input: Value,
        ctx: &ExecutionContext,
    ) -> DispatchOutcome {
        let node_type = node.node_type.as_str();
        let binding = match self.registry.resolve(node_type) {
            Ok(b) => b,
            Err(e) => {
                warn!(node_id = %node.id, node_type, "Unknown node type");
                return DispatchOutcome::failed(e.to_string(), FaultKind::NotFound, 0);
            }
        };

        let cache_config = effective_cache_config(&node.config, binding.metadata());
        if let Some(hit) = self.cache.get(node_type, &input, &cache_config).await {
            debug!(node_id = %node.id, node_type, "Served from cache");
            return DispatchOutcome {
                result: hit,
                fault: None,
                cached: true,
                attempts: 0,
            };
        }

        if let Admission::Rejected(reason) = self.circuit.check(node_type).await {
            warn!(node_id = %node.id, node_type, reason = %reason, "Call rejected by circuit breaker");
            return DispatchOutcome::failed(reason, FaultKind::Admission, 0);
        }

        let handler = match self.registry.instantiate(node_type, &node.config) {
            Ok(h) => h,
            Err(e) => {
                let message = e.to_string();
                self.circuit.record_failure(node_type, &message).await;
                return DispatchOutcome::failed(message, FaultKind::Handler, 0);
            }
        };

        let settings = node.settings();
        let timeout = settings
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut attempt = 0;
        let result = loop {
            let mut attempt_ctx = ctx.clone();
            attempt_ctx.attempt = attempt;

            let result =
                match tokio::time::timeout(timeout, handler.execute(input.clone(), &attempt_ctx))
                    .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => ExecutionResult::error(e.to_string()),
                    Err(_) => ExecutionResult::error(
                        FlowgateError::HandlerTimeout {
                            node_type: node_type.to_string(),
                            timeout_secs: timeout.as_secs(),
                        }
                        .to_string(),
                    ),
                };

            if result.is_success() || attempt >= settings.retry_count {
                break result;
            }
            attempt += 1;
            debug!(
                node_id = %node.id,
                node_type,
                attempt,
                max_retries = settings.retry_count,
                error = result.error_message().unwrap_or_default(),
                "Retrying node"
            );
        };

        let fault = match result.error_message().map(String::from) {
            None => {
                self.circuit.record_success(node_type).await;
                self.cache.set(node_type, &input, &cache_config, &result).await;
                None
            }
            Some(message) => {
                self.circuit.record_failure(node_type, &message).await;
                Some(FaultKind::Handler)
            }
        };
        DispatchOutcome {
            result,
            fault,
            cached: false,
            attempts: attempt + 1,
        }
    }
}

/// Node config as seen by the cache: a handler that is cacheable by default
/// opts in unless the node config says otherwise. `cacheable` is a volatile
/// key, so adding it does not change the cache key.
fn effective_cache_config<'a>(config: &'a Value, metadata: &HandlerMetadata) -> Cow<'a, Value> {
    match config {
        Value::Object(map) if metadata.cacheable_by_default && !map.contains_key("cacheable") => {
            let mut map = map.clone();
            map.insert("cacheable".into(), Value::Bool(true));
            Cow::Owned(Value::Object(map))
        }
        _ => Cow::Borrowed(config),
    }
}
