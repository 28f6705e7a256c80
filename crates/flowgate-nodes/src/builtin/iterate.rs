//! Loop and batch sources, and the node that closes a loop body.

use futures::future::BoxFuture;
use serde_json::{json, Value};

use flowgate_core::error::Result;
use flowgate_core::traits::Handler;
use flowgate_core::types::{lenient_bool, ExecutionContext, ExecutionResult};

use super::{config_f64, config_str, lookup_path};

const DEFAULT_BATCH_SIZE: usize = 10;

/// Pick the list a loop iterates over.
///
/// Order: a literal `items` array in config, the array at `field` in the
/// input, the input itself when it is an array, else the input as a single
/// item. A null input yields no items.
fn items_from(config: &Value, field: Option<&str>, input: &Value) -> Vec<Value> {
    if let Some(Value::Array(items)) = config.get("items") {
        return items.clone();
    }
    if let Some(field) = field {
        return match lookup_path(input, field) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
    }
    match input {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Runs its downstream nodes once per item.
#[derive(Debug)]
pub struct LoopItems {
    config: Value,
    field: Option<String>,
}

impl LoopItems {
    pub fn from_config(config: &Value) -> Self {
        Self {
            config: config.clone(),
            field: config_str(config, "field").map(String::from),
        }
    }
}

impl Handler for LoopItems {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let items = items_from(&self.config, self.field.as_deref(), &input);
        Box::pin(async move {
            Ok(ExecutionResult::success(Value::Array(items.clone())).with_fan_out(items))
        })
    }
}

/// Runs its downstream nodes once per batch of `batch_size` items.
#[derive(Debug)]
pub struct SplitInBatches {
    config: Value,
    field: Option<String>,
    batch_size: usize,
}

impl SplitInBatches {
    pub fn from_config(config: &Value) -> Self {
        let batch_size = config_f64(config, "batch_size")
            .map(|n| n.max(1.0) as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        Self {
            config: config.clone(),
            field: config_str(config, "field").map(String::from),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Handler for SplitInBatches {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let items = items_from(&self.config, self.field.as_deref(), &input);
        let batches: Vec<Value> = items
            .chunks(self.batch_size)
            .map(|chunk| Value::Array(chunk.to_vec()))
            .collect();
        let data = json!({
            "batches": batches,
            "batch_info": {
                "total_items": items.len(),
                "batch_size": self.batch_size,
                "total_batches": batches.len(),
            },
        });
        Box::pin(async move { Ok(ExecutionResult::success(data).with_fan_out(batches)) })
    }
}

/// Closes a loop body. Receives the collected per-iteration values and
/// passes them on, flattening one level when `flatten` is set.
#[derive(Debug)]
pub struct CollectItems {
    flatten: bool,
}

impl CollectItems {
    pub fn from_config(config: &Value) -> Self {
        Self {
            flatten: lenient_bool(config.get("flatten")).unwrap_or(false),
        }
    }
}

impl Handler for CollectItems {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let data = match input {
            Value::Array(items) if self.flatten => Value::Array(
                items
                    .into_iter()
                    .flat_map(|item| match item {
                        Value::Array(inner) => inner,
                        other => vec![other],
                    })
                    .collect(),
            ),
            other => other,
        };
        Box::pin(async move { Ok(ExecutionResult::success(data)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::test_context;

    #[tokio::test]
    async fn loop_items_sources() {
        let ctx = test_context("loop");

        let from_input = LoopItems::from_config(&json!({}));
        let r = from_input.execute(json!([1, 2, 3]), &ctx).await.unwrap();
        assert_eq!(r.fan_out().unwrap(), &[json!(1), json!(2), json!(3)]);

        let from_field = LoopItems::from_config(&json!({"field": "rows"}));
        let r = from_field.execute(json!({"rows": ["a", "b"]}), &ctx).await.unwrap();
        assert_eq!(r.fan_out().unwrap().len(), 2);

        let literal = LoopItems::from_config(&json!({"items": [true]}));
        let r = literal.execute(json!([1, 2, 3]), &ctx).await.unwrap();
        assert_eq!(r.fan_out().unwrap(), &[json!(true)]);

        let single = LoopItems::from_config(&json!({}));
        let r = single.execute(json!({"x": 1}), &ctx).await.unwrap();
        assert_eq!(r.fan_out().unwrap(), &[json!({"x": 1})]);
    }

    #[tokio::test]
    async fn loop_items_empty_input() {
        let ctx = test_context("loop");
        let handler = LoopItems::from_config(&json!({"field": "missing"}));
        let r = handler.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(r.fan_out().unwrap().len(), 0);
        assert_eq!(r.data(), Some(&json!([])));
    }

    #[tokio::test]
    async fn split_in_batches_chunks() {
        let ctx = test_context("split");
        let handler = SplitInBatches::from_config(&json!({"batch_size": "2"}));
        let r = handler.execute(json!([1, 2, 3, 4, 5]), &ctx).await.unwrap();
        assert_eq!(
            r.fan_out().unwrap(),
            &[json!([1, 2]), json!([3, 4]), json!([5])]
        );
        let info = &r.data().unwrap()["batch_info"];
        assert_eq!(info["total_items"], 5);
        assert_eq!(info["total_batches"], 3);
    }

    #[test]
    fn split_in_batches_size_floor() {
        assert_eq!(SplitInBatches::from_config(&json!({"batch_size": 0})).batch_size(), 1);
        assert_eq!(SplitInBatches::from_config(&json!({})).batch_size(), DEFAULT_BATCH_SIZE);
    }

    #[tokio::test]
    async fn collect_items_flatten() {
        let ctx = test_context("collect");
        let plain = CollectItems::from_config(&json!({}));
        let r = plain.execute(json!([[1, 2], [3]]), &ctx).await.unwrap();
        assert_eq!(r.data(), Some(&json!([[1, 2], [3]])));

        let flat = CollectItems::from_config(&json!({"flatten": true}));
        let r = flat.execute(json!([[1, 2], [3], 4]), &ctx).await.unwrap();
        assert_eq!(r.data(), Some(&json!([1, 2, 3, 4])));
    }
}
