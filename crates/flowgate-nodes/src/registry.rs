use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::Handler;
use flowgate_core::types::{ExecutionContext, ExecutionResult, HandlerMetadata};

type Constructor = dyn Fn(&Value) -> Result<Box<dyn Handler>> + Send + Sync;

/// A constructible handler plus the metadata it declares.
///
/// A fresh handler is built from the node config for every invocation.
pub struct HandlerBinding {
    construct: Box<Constructor>,
    metadata: HandlerMetadata,
}

impl HandlerBinding {
    pub fn new<F>(construct: F) -> Self
    where
        F: Fn(&Value) -> Result<Box<dyn Handler>> + Send + Sync + 'static,
    {
        Self {
            construct: Box::new(construct),
            metadata: HandlerMetadata::default(),
        }
    }

    /// Binding that reuses one handler instance regardless of config.
    pub fn shared(handler: Arc<dyn Handler>) -> Self {
        Self::new(move |_| Ok(Box::new(SharedHandler(handler.clone())) as Box<dyn Handler>))
    }

    pub fn with_metadata(mut self, metadata: HandlerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata(&self) -> &HandlerMetadata {
        &self.metadata
    }

    pub fn construct(&self, config: &Value) -> Result<Box<dyn Handler>> {
        (self.construct)(config)
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("metadata", &self.metadata)
            .finish()
    }
}

struct SharedHandler(Arc<dyn Handler>);

impl Handler for SharedHandler {
    fn execute<'a>(
        &'a self,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        self.0.execute(input, ctx)
    }
}

/// Registry of executable node types.
///
/// Built once at startup and handed to the engine. The first binding
/// registered for an id stays in effect; later ones are ignored.
pub struct NodeRegistry {
    bindings: HashMap<String, Arc<HandlerBinding>>,
    pub(crate) scanned: bool,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
            scanned: false,
        }
    }

    /// Register a node type. Returns `false` if the id was already taken.
    pub fn register(&mut self, id: impl Into<String>, binding: HandlerBinding) -> bool {
        self.register_arc(id.into(), Arc::new(binding))
    }

    /// Register one binding under several ids. Returns how many were new.
    pub fn bulk_register(&mut self, ids: &[&str], binding: HandlerBinding) -> usize {
        let binding = Arc::new(binding);
        ids.iter()
            .filter(|id| self.register_arc(id.to_string(), binding.clone()))
            .count()
    }

    pub(crate) fn register_arc(&mut self, id: String, binding: Arc<HandlerBinding>) -> bool {
        if self.bindings.contains_key(&id) {
            debug!(node_type = %id, "Node type already registered, keeping first binding");
            return false;
        }
        self.bindings.insert(id, binding);
        true
    }

    /// Look up a node type.
    pub fn resolve(&self, id: &str) -> Result<Arc<HandlerBinding>> {
        self.bindings
            .get(id)
            .cloned()
            .ok_or_else(|| FlowgateError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bindings.contains_key(id)
    }

    /// Resolve a node type and build a handler for the given config.
    pub fn instantiate(&self, id: &str, config: &Value) -> Result<Box<dyn Handler>> {
        let binding = self.resolve(id)?;
        binding.construct(config).map_err(|e| match e {
            FlowgateError::HandlerInit { .. } => e,
            other => FlowgateError::HandlerInit {
                node_type: id.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// All registered node types, sorted by id.
    pub fn list_all(&self) -> BTreeMap<String, Arc<HandlerBinding>> {
        self.bindings
            .iter()
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Create a registry with the built-in flow-control handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::{test_context, CallCounter, EchoHandler, FailingHandler};
    use serde_json::json;

    fn echo(calls: &CallCounter) -> HandlerBinding {
        HandlerBinding::shared(Arc::new(EchoHandler::new(calls.clone())))
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let first = CallCounter::new();
        let second = CallCounter::new();
        let mut registry = NodeRegistry::new();

        assert!(registry.register("http_request", echo(&first)));
        assert!(!registry.register(
            "http_request",
            HandlerBinding::shared(Arc::new(FailingHandler::new("second", second.clone())))
        ));

        let handler = registry.instantiate("http_request", &json!({})).unwrap();
        let ctx = test_context("n1");
        let result = handler.execute(json!("ping"), &ctx).await.unwrap();
        assert_eq!(result.data(), Some(&json!("ping")));
        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bulk_register_aliases() {
        let calls = CallCounter::new();
        let mut registry = NodeRegistry::new();
        registry.register("b", echo(&calls));

        let added = registry.bulk_register(&["a", "b", "c"], echo(&calls));
        assert_eq!(added, 2);
        assert!(Arc::ptr_eq(
            &registry.resolve("a").unwrap(),
            &registry.resolve("c").unwrap()
        ));
        assert!(!Arc::ptr_eq(
            &registry.resolve("a").unwrap(),
            &registry.resolve("b").unwrap()
        ));
    }

    #[test]
    fn test_resolve_missing() {
        let registry = NodeRegistry::new();
        assert!(matches!(
            registry.resolve("nope"),
            Err(FlowgateError::NodeNotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_instantiate_wraps_construction_errors() {
        let mut registry = NodeRegistry::new();
        registry.register(
            "broken",
            HandlerBinding::new(|_| Err(FlowgateError::Config("missing url".into()))),
        );
        match registry.instantiate("broken", &json!({})) {
            Err(FlowgateError::HandlerInit { node_type, message }) => {
                assert_eq!(node_type, "broken");
                assert!(message.contains("missing url"));
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_list_all_sorted() {
        let calls = CallCounter::new();
        let mut registry = NodeRegistry::new();
        registry.register("zeta", echo(&calls));
        registry.register("alpha", echo(&calls));
        let ids: Vec<_> = registry.list_all().into_keys().collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_builtins_present() {
        let registry = NodeRegistry::with_builtins();
        for id in [
            "conditional_branch",
            "loop_items",
            "split_in_batches",
            "collect_items",
            "merge",
            "set",
            "wait",
            "passthrough",
        ] {
            assert!(registry.contains(id), "missing builtin {}", id);
        }
        assert!(registry.resolve("collect_items").unwrap().metadata().joins_iterations);
        for opener in ["loop_items", "loop_over_items", "split_in_batches"] {
            assert!(registry.resolve(opener).unwrap().metadata().opens_iterations);
        }
        assert!(!registry.resolve("collect_items").unwrap().metadata().opens_iterations);
    }
}
