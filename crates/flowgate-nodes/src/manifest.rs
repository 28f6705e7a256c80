use serde::{Deserialize, Serialize};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::HandlerMetadata;

/// How a command handler speaks on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Loose legacy objects (`{"status": ..., "data": ..., "<handle>": ...}`).
    #[default]
    Legacy,
    /// A serialized `ExecutionResult`.
    Native,
}

/// Environment prerequisites for a handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prerequisites {
    /// Required binaries that must be on PATH (e.g., ["python3"]).
    #[serde(default)]
    pub required_binaries: Vec<String>,
    /// Required environment variables.
    #[serde(default)]
    pub required_env: Vec<String>,
}

/// TOML manifest for an external command handler.
///
/// A manifest file holds a single `[handler]` table:
///
/// ```toml
/// [handler]
/// node_type = "slack_send"
/// command = "python3 $HANDLER_DIR/slack.py"
/// credentials = ["slack_main"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerManifest {
    /// Node type id the handler is registered under.
    pub node_type: String,

    /// Extra ids bound to the same handler.
    #[serde(default)]
    pub aliases: Vec<String>,

    #[serde(default)]
    pub description: String,

    /// Shell command to execute. `$HANDLER_DIR` is substituted
    /// with the manifest's directory at runtime.
    pub command: String,

    /// Timeout for the command in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub protocol: Protocol,

    /// Named output handles the command may emit.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Credential keys resolved and passed to the command.
    #[serde(default)]
    pub credentials: Vec<String>,

    #[serde(default)]
    pub cacheable: bool,

    /// The command answers with loop or batch lists.
    #[serde(default)]
    pub fans_out: bool,

    /// JSON string containing the input schema.
    #[serde(default)]
    pub input_schema_json: Option<String>,

    #[serde(default)]
    pub prerequisites: Prerequisites,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    handler: HandlerManifest,
}

fn default_timeout() -> u64 {
    30
}

impl HandlerManifest {
    /// Parse and validate a manifest file body.
    pub fn parse(content: &str) -> Result<Self> {
        let file: ManifestFile =
            toml::from_str(content).map_err(|e| FlowgateError::Config(e.to_string()))?;
        let manifest = file.handler;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.node_type.trim().is_empty() || self.node_type.contains(char::is_whitespace) {
            return Err(FlowgateError::Config(format!(
                "invalid node_type '{}'",
                self.node_type
            )));
        }
        if self.command.trim().is_empty() {
            return Err(FlowgateError::Config(format!(
                "handler '{}' has an empty command",
                self.node_type
            )));
        }
        Ok(())
    }

    /// Every id this manifest binds, primary first.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.node_type.as_str()).chain(self.aliases.iter().map(|a| a.as_str()))
    }

    pub fn metadata(&self) -> Result<HandlerMetadata> {
        let input_schema = match &self.input_schema_json {
            Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                FlowgateError::Config(format!(
                    "Invalid input_schema_json for handler '{}': {}",
                    self.node_type, e
                ))
            })?),
            None => None,
        };
        Ok(HandlerMetadata {
            description: self.description.clone(),
            input_schema,
            output_handles: self.outputs.clone(),
            required_credentials: self.credentials.clone(),
            cacheable_by_default: self.cacheable,
            joins_iterations: false,
            opens_iterations: self.fans_out,
        })
    }
}
