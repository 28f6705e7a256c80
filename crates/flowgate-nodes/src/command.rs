use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::Handler;
use flowgate_core::types::{ExecutionContext, ExecutionResult};

use crate::manifest::{HandlerManifest, Protocol};
use crate::registry::HandlerBinding;

/// Adapter exposing an external command as a native handler.
///
/// The command receives `{input, config, credentials, context}` as JSON on
/// stdin and answers on stdout, either with a native `ExecutionResult` or in
/// the legacy loose shape, which is translated here and nowhere else.
pub struct CommandHandler {
    manifest: Arc<HandlerManifest>,
    handler_dir: PathBuf,
    config: Value,
}

impl CommandHandler {
    pub fn new(manifest: Arc<HandlerManifest>, handler_dir: PathBuf, config: Value) -> Self {
        Self {
            manifest,
            handler_dir,
            config,
        }
    }

    /// Binding that builds a `CommandHandler` per invocation.
    pub fn binding(manifest: HandlerManifest, handler_dir: PathBuf) -> Result<HandlerBinding> {
        let metadata = manifest.metadata()?;
        let manifest = Arc::new(manifest);
        let binding = HandlerBinding::new(move |config| {
            Ok(Box::new(CommandHandler::new(
                manifest.clone(),
                handler_dir.clone(),
                config.clone(),
            )) as Box<dyn Handler>)
        });
        Ok(binding.with_metadata(metadata))
    }

    async fn run(&self, input: Value, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        // Credentials are resolved before anything leaves the process
        let mut credentials = serde_json::Map::new();
        for key in &self.manifest.credentials {
            match ctx.credential(key).await? {
                Some(fields) => {
                    credentials.insert(key.clone(), json!(fields));
                }
                None => return Err(FlowgateError::MissingCredential(key.clone())),
            }
        }

        let payload = json!({
            "input": input,
            "config": self.config,
            "credentials": credentials,
            "context": {
                "run_id": ctx.run_id,
                "node_id": ctx.node_id,
                "iteration": ctx.iteration,
                "attempt": ctx.attempt,
            },
        });
        let stdin_bytes = serde_json::to_vec(&payload)?;
        let command = self
            .manifest
            .command
            .replace("$HANDLER_DIR", &self.handler_dir.display().to_string());
        let timeout_secs = self.manifest.timeout_secs;

        debug!(node_type = %self.manifest.node_type, command = %command, "Executing handler command");

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let mut cmd = if cfg!(windows) {
                let mut c = tokio::process::Command::new("cmd");
                c.arg("/C").arg(&command);
                c
            } else {
                let mut c = tokio::process::Command::new("bash");
                c.arg("-c").arg(&command);
                c
            };
            let mut child = cmd
                .current_dir(&self.handler_dir)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            // Feed stdin while stdout drains, or a large payload fills both pipes
            let stdin = child.stdin.take();
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    use tokio::io::AsyncWriteExt;
                    // A command that ignores stdin closes the pipe early; that is fine
                    stdin.write_all(&stdin_bytes).await.ok();
                }
            };
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        })
        .await
        .map_err(|_| FlowgateError::HandlerTimeout {
            node_type: self.manifest.node_type.clone(),
            timeout_secs,
        })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            return Ok(ExecutionResult::error(format!(
                "Exit code {}: {}",
                output.status.code().unwrap_or(-1),
                msg
            )));
        }

        match self.manifest.protocol {
            Protocol::Native => serde_json::from_str(stdout.trim()).map_err(|e| {
                FlowgateError::HandlerExecution {
                    node_type: self.manifest.node_type.clone(),
                    message: format!("malformed result: {}", e),
                }
            }),
            Protocol::Legacy => Ok(adapt_legacy_output(
                parse_stdout(&stdout),
                &self.manifest.outputs,
            )),
        }
    }
}

impl Handler for CommandHandler {
    fn execute<'a>(
        &'a self,
        input: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<ExecutionResult>> {
        Box::pin(self.run(input, ctx))
    }
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Translate a legacy handler answer into an `ExecutionResult`.
///
/// - an `error` key, or `status = "error"`, is a failure
/// - `data` is the payload when present, otherwise the whole object
/// - keys named in `outputs` become handles
/// - `is_loop: true` over an array payload, or a `batches` array, becomes fan-out
pub fn adapt_legacy_output(raw: Value, outputs: &[String]) -> ExecutionResult {
    let map = match raw {
        Value::Object(map) => map,
        other => return ExecutionResult::success(other),
    };

    if let Some(err) = map.get("error").filter(|e| !e.is_null()) {
        let message = err.as_str().map(String::from).unwrap_or_else(|| err.to_string());
        return ExecutionResult::error(message);
    }
    if map.get("status").and_then(|s| s.as_str()) == Some("error") {
        let message = map
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Handler reported an error");
        return ExecutionResult::error(message);
    }

    let data = map
        .get("data")
        .cloned()
        .unwrap_or_else(|| Value::Object(map.clone()));

    let mut result = ExecutionResult::success(data.clone());
    for handle in outputs {
        if let Some(value) = map.get(handle) {
            result = result.with_handle(handle.clone(), value.clone());
        }
    }

    let is_loop = map.get("is_loop").and_then(|v| v.as_bool()).unwrap_or(false);
    match (&data, map.get("batches")) {
        (Value::Array(items), _) if is_loop => result.with_fan_out(items.clone()),
        (_, Some(Value::Array(batches))) => result.with_fan_out(batches.clone()),
        _ => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::credentials::StaticCredentials;
    use flowgate_core::types::WorkflowGraph;
    use std::collections::HashMap;

    fn outputs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn legacy_error_key() {
        let r = adapt_legacy_output(json!({"error": "401 Unauthorized"}), &[]);
        assert_eq!(r.error_message(), Some("401 Unauthorized"));

        let r = adapt_legacy_output(json!({"status": "error", "message": "bad"}), &[]);
        assert_eq!(r.error_message(), Some("bad"));
    }

    #[test]
    fn legacy_handles_only_when_declared() {
        let raw = json!({"status": "success", "data": {"v": 1}, "true_result": {"v": 1}, "extra": 2});
        let r = adapt_legacy_output(raw, &outputs(&["true_result", "false_result"]));
        let handles = r.handles().unwrap();
        assert_eq!(handles.len(), 1);
        assert!(handles.contains_key("true_result"));
        assert_eq!(r.data(), Some(&json!({"v": 1})));
    }

    #[test]
    fn legacy_loop_markers() {
        let r = adapt_legacy_output(json!({"data": [1, 2, 3], "is_loop": true}), &[]);
        assert_eq!(r.fan_out().unwrap().len(), 3);

        let r = adapt_legacy_output(json!({"batches": [[1, 2], [3]], "batch_info": {}}), &[]);
        assert_eq!(r.fan_out().unwrap(), &[json!([1, 2]), json!([3])]);

        let r = adapt_legacy_output(json!({"data": {"not": "a list"}, "is_loop": true}), &[]);
        assert!(r.fan_out().is_none());
    }

    #[test]
    fn legacy_plain_values() {
        assert_eq!(adapt_legacy_output(json!("hi"), &[]).data(), Some(&json!("hi")));
        assert_eq!(
            adapt_legacy_output(json!({"a": 1}), &[]).data(),
            Some(&json!({"a": 1}))
        );
        assert_eq!(parse_stdout("  plain text \n"), json!("plain text"));
        assert_eq!(parse_stdout(""), Value::Null);
    }

    fn manifest(command: &str, protocol: Protocol, credentials: &[&str]) -> Arc<HandlerManifest> {
        Arc::new(HandlerManifest {
            node_type: "cmd".into(),
            aliases: vec![],
            description: String::new(),
            command: command.into(),
            timeout_secs: 5,
            protocol,
            outputs: vec![],
            credentials: credentials.iter().map(|s| s.to_string()).collect(),
            cacheable: false,
            fans_out: false,
            input_schema_json: None,
            prerequisites: Default::default(),
        })
    }

    fn ctx_with(creds: StaticCredentials) -> ExecutionContext {
        ExecutionContext::new("run", Arc::new(WorkflowGraph::default()), Arc::new(creds))
            .for_node("n1", &[])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_stdin_payload() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new(
            manifest("cat", Protocol::Legacy, &[]),
            dir.path().to_path_buf(),
            json!({"k": "v"}),
        );
        let ctx = ctx_with(StaticCredentials::new());
        let result = handler.execute(json!({"x": 1}), &ctx).await.unwrap();
        let data = result.data().unwrap();
        assert_eq!(data["input"]["x"], 1);
        assert_eq!(data["config"]["k"], "v");
        assert_eq!(data["context"]["node_id"], "n1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_payload_streams_through_command() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new(
            manifest("cat", Protocol::Legacy, &[]),
            dir.path().to_path_buf(),
            json!({}),
        );
        let blob = "x".repeat(512 * 1024);
        let ctx = ctx_with(StaticCredentials::new());

        let started = std::time::Instant::now();
        let result = handler
            .execute(json!({"blob": blob}), &ctx)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        let echoed = result.data().unwrap()["input"]["blob"].as_str().unwrap();
        assert_eq!(echoed.len(), 512 * 1024);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn native_protocol_and_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let native = CommandHandler::new(
            manifest(
                r#"echo '{"status":"success","data":5,"handles":{"ok":5}}'"#,
                Protocol::Native,
                &[],
            ),
            dir.path().to_path_buf(),
            json!({}),
        );
        let ctx = ctx_with(StaticCredentials::new());
        let result = native.execute(json!(null), &ctx).await.unwrap();
        assert_eq!(result.handles().unwrap()["ok"], json!(5));

        let failing = CommandHandler::new(
            manifest("echo nope >&2; exit 3", Protocol::Legacy, &[]),
            dir.path().to_path_buf(),
            json!({}),
        );
        let result = failing.execute(json!(null), &ctx).await.unwrap();
        assert_eq!(result.error_message(), Some("Exit code 3: nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn credentials_are_resolved_first() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new(
            manifest("cat", Protocol::Legacy, &["slack_main"]),
            dir.path().to_path_buf(),
            json!({}),
        );

        let err = handler
            .execute(json!(null), &ctx_with(StaticCredentials::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowgateError::MissingCredential(k) if k == "slack_main"));

        let mut creds = StaticCredentials::new();
        creds.insert(
            "slack_main",
            HashMap::from([("token".to_string(), "xoxb".to_string())]),
        );
        let result = handler.execute(json!(null), &ctx_with(creds)).await.unwrap();
        assert_eq!(result.data().unwrap()["credentials"]["slack_main"]["token"], "xoxb");
    }
}
