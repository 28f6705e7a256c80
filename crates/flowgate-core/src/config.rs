use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};

/// Top-level Flowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Named credential tables, e.g. `[credentials.slack_main]`.
    #[serde(default)]
    pub credentials: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Handler timeout when a node config has no `timeout`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Loop iterations executed at the same time.
    #[serde(default = "default_max_parallel_iterations")]
    pub max_parallel_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_parallel_iterations: default_max_parallel_iterations(),
        }
    }
}

fn default_timeout_secs() -> u64 { 60 }
fn default_max_parallel_iterations() -> usize { 8 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database file, shared by every process on the host.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "~/.flowgate/state.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Global switch. Nodes must also opt in with `cacheable = true`.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_enabled() -> bool { true }
fn default_cache_ttl_secs() -> u64 { 3600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout_secs() -> u64 { 300 }
fn default_half_open_max_calls() -> u32 { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_type")]
    pub worker_type: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Queues polled by workers, highest priority first.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Pending runs above which health degrades to warning.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often a worker reclaims expired store records.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_type: default_worker_type(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            queues: default_queues(),
            warning_threshold: default_warning_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_worker_type() -> String { "default".to_string() }
fn default_heartbeat_interval_secs() -> u64 { 10 }
fn default_queues() -> Vec<String> {
    vec!["flowgate:queue".to_string(), "flowgate:queue:webhook".to_string()]
}
fn default_warning_threshold() -> u64 { 100 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_purge_interval_secs() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Directories scanned for handler manifests at startup.
    #[serde(default = "default_handler_dirs")]
    pub handler_dirs: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handler_dirs: default_handler_dirs(),
        }
    }
}

fn default_handler_dirs() -> Vec<String> { vec!["~/.flowgate/handlers".to_string()] }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowgateError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowgateError::Config(e.to_string()))
    }

    /// Resolve the SQLite store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the handler manifest directories (expand ~).
    pub fn handler_dirs(&self) -> Vec<PathBuf> {
        self.registry.handler_dirs.iter().map(|d| expand_home(d)).collect()
    }

    /// Copy of the config with credential values masked, for display.
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        for fields in shown.credentials.values_mut() {
            for value in fields.values_mut() {
                *value = "***".to_string();
            }
        }
        shown
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWGATE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWGATE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWGATE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWGATE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWGATE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 300);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.worker.heartbeat_interval_secs, 10);
        assert_eq!(config.worker.warning_threshold, 100);
        assert_eq!(config.worker.queues.len(), 2);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.engine.max_parallel_iterations, 8);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[circuit_breaker]
failure_threshold = 2

[store]
backend = "sqlite"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 300);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, "~/.flowgate/state.db");
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let toml_str = r#"
[credentials.slack_main]
token = "xoxb-secret"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let shown = config.redacted();
        assert_eq!(shown.credentials["slack_main"]["token"], "***");
        assert_eq!(config.credentials["slack_main"]["token"], "xoxb-secret");
    }
}
