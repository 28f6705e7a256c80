use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::Handler;
use flowgate_core::types::{ExecutionContext, ExecutionResult};

use super::{config_f64, config_str};

/// How `merge` combines several upstream payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// Concatenate every input into one list, flattening array inputs.
    Append,
    /// Shallow-merge object inputs, later sources winning.
    Combine,
    /// Forward the input of one named source.
    ChooseBranch(String),
}

/// Combines the inputs delivered by several branches.
///
/// A node with more than one delivered edge receives an object keyed by
/// source node id; a single delivered edge arrives as the bare value.
#[derive(Debug)]
pub struct Merge {
    mode: MergeMode,
}

impl Merge {
    pub fn from_config(config: &Value) -> Result<Self> {
        let mode = match config_str(config, "mode").unwrap_or("append") {
            "append" => MergeMode::Append,
            "combine" => MergeMode::Combine,
            "choose_branch" => {
                let branch = config_str(config, "branch").ok_or_else(|| {
                    FlowgateError::Config("merge mode 'choose_branch' needs a 'branch'".into())
                })?;
                MergeMode::ChooseBranch(branch.to_string())
            }
            other => {
                return Err(FlowgateError::Config(format!(
                    "unknown merge mode '{}'",
                    other
                )))
            }
        };
        Ok(Self { mode })
    }

    fn merge(&self, input: Value) -> ExecutionResult {
        let sources = match input {
            Value::Object(map) => map,
            single => return ExecutionResult::success(single),
        };

        match &self.mode {
            MergeMode::Append => {
                let items = sources
                    .into_iter()
                    .flat_map(|(_, v)| match v {
                        Value::Array(inner) => inner,
                        other => vec![other],
                    })
                    .collect();
                ExecutionResult::success(Value::Array(items))
            }
            MergeMode::Combine => {
                let mut merged = Map::new();
                for (_, value) in sources {
                    if let Value::Object(fields) = value {
                        merged.extend(fields);
                    }
                }
                ExecutionResult::success(Value::Object(merged))
            }
            MergeMode::ChooseBranch(branch) => match sources.get(branch) {
                Some(value) => ExecutionResult::success(value.clone()),
                None => ExecutionResult::error(format!("branch '{}' delivered no input", branch)),
            },
        }
    }
}

impl Handler for Merge {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let result = self.merge(input);
        Box::pin(async move { Ok(result) })
    }
}

/// Writes the `values` object from config into the input object.
#[derive(Debug)]
pub struct SetFields {
    values: Map<String, Value>,
}

impl SetFields {
    pub fn from_config(config: &Value) -> Self {
        let values = config
            .get("values")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Self { values }
    }
}

impl Handler for SetFields {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        let mut object = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        object.extend(self.values.clone());
        Box::pin(async move { Ok(ExecutionResult::success(Value::Object(object))) })
    }
}

/// Sleeps for `seconds`, then passes the input through.
#[derive(Debug)]
pub struct Wait {
    delay: Duration,
}

impl Wait {
    pub fn from_config(config: &Value) -> Self {
        let secs = config_f64(config, "seconds").unwrap_or(0.0).max(0.0);
        Self {
            delay: Duration::from_secs_f64(secs),
        }
    }
}

impl Handler for Wait {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(ExecutionResult::success(input))
        })
    }
}

/// Returns its input unchanged. Also stands in for trigger nodes.
#[derive(Debug)]
pub struct Passthrough;

impl Handler for Passthrough {
    fn execute<'a>(
        &'a self,
        input: Value,
        _ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        Box::pin(async move { Ok(ExecutionResult::success(input)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::test_context;
    use serde_json::json;

    #[tokio::test]
    async fn merge_modes() {
        let ctx = test_context("merge");
        let input = json!({"a": {"x": 1}, "b": [{"y": 2}, {"z": 3}]});

        let append = Merge::from_config(&json!({})).unwrap();
        let r = append.execute(input.clone(), &ctx).await.unwrap();
        assert_eq!(r.data().unwrap().as_array().unwrap().len(), 3);

        let combine = Merge::from_config(&json!({"mode": "combine"})).unwrap();
        let r = combine
            .execute(json!({"a": {"x": 1, "k": "a"}, "b": {"k": "b"}}), &ctx)
            .await
            .unwrap();
        assert_eq!(r.data(), Some(&json!({"x": 1, "k": "b"})));

        let choose = Merge::from_config(&json!({"mode": "choose_branch", "branch": "a"})).unwrap();
        let r = choose.execute(input, &ctx).await.unwrap();
        assert_eq!(r.data(), Some(&json!({"x": 1})));
        let r = choose.execute(json!({"b": 1, "c": 2}), &ctx).await.unwrap();
        assert!(r.is_error());
    }

    #[test]
    fn merge_rejects_bad_config() {
        assert!(Merge::from_config(&json!({"mode": "zip"})).is_err());
        assert!(Merge::from_config(&json!({"mode": "choose_branch"})).is_err());
    }

    #[tokio::test]
    async fn merge_single_input_passes_through() {
        let ctx = test_context("merge");
        let merge = Merge::from_config(&json!({"mode": "combine"})).unwrap();
        let r = merge.execute(json!([1, 2]), &ctx).await.unwrap();
        assert_eq!(r.data(), Some(&json!([1, 2])));
    }

    #[tokio::test]
    async fn set_fields_overwrites() {
        let ctx = test_context("set");
        let set = SetFields::from_config(&json!({"values": {"status": "done", "n": 2}}));
        let r = set.execute(json!({"n": 1, "id": 9}), &ctx).await.unwrap();
        assert_eq!(r.data(), Some(&json!({"n": 2, "id": 9, "status": "done"})));

        let r = set.execute(json!("raw"), &ctx).await.unwrap();
        assert_eq!(r.data().unwrap()["value"], "raw");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_then_passes_through() {
        let ctx = test_context("wait");
        let wait = Wait::from_config(&json!({"seconds": 5}));
        let started = tokio::time::Instant::now();
        let r = wait.execute(json!({"a": 1}), &ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(r.data(), Some(&json!({"a": 1})));
    }
}
