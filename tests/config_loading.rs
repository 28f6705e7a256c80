use std::io::Write;

use flowgate_core::config::{AppConfig, StoreBackend};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
default_timeout_secs = 30
max_parallel_iterations = 4

[store]
backend = "sqlite"
path = "/tmp/flowgate-test/state.db"

[cache]
enabled = false
default_ttl_secs = 120

[circuit_breaker]
failure_threshold = 3
recovery_timeout_secs = 60
half_open_max_calls = 1

[worker]
worker_type = "webhook"
heartbeat_interval_secs = 5
queues = ["flowgate:queue:webhook"]
warning_threshold = 10
poll_interval_ms = 250
purge_interval_secs = 30

[registry]
handler_dirs = ["/opt/flowgate/handlers"]

[credentials.slack_main]
token = "xoxb-test"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_timeout_secs, 30);
    assert_eq!(config.engine.max_parallel_iterations, 4);
    assert!(matches!(config.store.backend, StoreBackend::Sqlite));
    assert_eq!(
        config.store_path().to_str(),
        Some("/tmp/flowgate-test/state.db")
    );
    assert!(!config.cache.enabled);
    assert_eq!(config.cache.default_ttl_secs, 120);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.circuit_breaker.half_open_max_calls, 1);
    assert_eq!(config.worker.worker_type, "webhook");
    assert_eq!(config.worker.queues, vec!["flowgate:queue:webhook"]);
    assert_eq!(config.worker.poll_interval_ms, 250);
    assert_eq!(config.worker.purge_interval_secs, 30);
    assert_eq!(config.handler_dirs().len(), 1);
    assert_eq!(config.credentials["slack_main"]["token"], "xoxb-test");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWGATE_TEST_SLACK_TOKEN", "expanded-token");

    let toml_content = r#"
[credentials.slack_main]
token = "${FLOWGATE_TEST_SLACK_TOKEN}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.credentials["slack_main"]["token"], "expanded-token");

    let shown = config.redacted();
    assert_eq!(shown.credentials["slack_main"]["token"], "***");

    std::env::remove_var("FLOWGATE_TEST_SLACK_TOKEN");
}

#[test]
fn test_empty_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_timeout_secs, 60);
    assert_eq!(config.engine.max_parallel_iterations, 8);
    assert!(matches!(config.store.backend, StoreBackend::Memory));
    assert!(config.cache.enabled);
    assert_eq!(config.cache.default_ttl_secs, 3600);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.circuit_breaker.recovery_timeout_secs, 300);
    assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
    assert_eq!(config.worker.heartbeat_interval_secs, 10);
    assert_eq!(config.worker.warning_threshold, 100);
    assert_eq!(config.worker.purge_interval_secs, 300);
    assert_eq!(
        config.worker.queues,
        vec!["flowgate:queue", "flowgate:queue:webhook"]
    );
    assert!(config.credentials.is_empty());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
}

#[test]
fn test_malformed_config_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\ndefault_timeout_secs = \"soon\"\n")
        .expect("write toml");
    assert!(AppConfig::load(tmp.path()).is_err());
}
