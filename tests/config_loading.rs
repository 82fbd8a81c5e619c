use std::io::Write;

use agentflow_core::config::AppConfig;
use agentflow_core::error::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrency = 8
global_concurrency = 16
default_timeout_secs = 60
retention_secs = 120
event_buffer = 1024

[retry]
max_attempts = 5
initial_backoff_ms = 250
max_backoff_ms = 10000
jitter = false

[cache]
enabled = true
max_entries = 50
max_bytes = 1048576
default_ttl_secs = 3600
version_scoped = true

[store]
path = "/tmp/agentflow-test/agentflow.db"

[run_log]
log_dir = "/tmp/agentflow-test/logs"
level = 3

[[providers.command]]
name = "local-llm"
capability = "agent"
program = "python3"
args = ["agent.py"]
priority = 10
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 8);
    assert_eq!(config.engine.global_concurrency, Some(16));
    assert_eq!(config.engine.default_timeout_secs, 60);
    assert_eq!(config.engine.event_buffer, 1024);
    assert_eq!(config.retry.max_attempts, 5);
    assert!(!config.retry.jitter);
    assert_eq!(config.cache.max_entries, 50);
    assert_eq!(config.cache.default_ttl_secs, Some(3600));
    assert!(config.cache.version_scoped);

    let store = config.store.expect("store present");
    assert_eq!(store.path, "/tmp/agentflow-test/agentflow.db");

    let log = config.run_log.expect("run_log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);

    assert_eq!(config.providers.command.len(), 1);
    let provider = &config.providers.command[0];
    assert_eq!(provider.capability, "agent");
    assert_eq!(provider.args, vec!["agent.py"]);
    assert_eq!(provider.priority, 10);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("AGENTFLOW_TEST_DB", "/tmp/expanded.db");

    let toml_content = r#"
[store]
path = "${AGENTFLOW_TEST_DB}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.store.expect("store").path, "/tmp/expanded.db");

    std::env::remove_var("AGENTFLOW_TEST_DB");
}

#[test]
fn test_empty_config_uses_defaults() {
    let tmp = tempfile::NamedTempFile::new().expect("create temp file");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.global_concurrency, None);
    assert_eq!(config.engine.default_timeout_secs, 300);
    assert_eq!(config.engine.retention_secs, 3600);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff_ms, 1000);
    assert_eq!(config.retry.max_backoff_ms, 30000);
    assert!(config.retry.jitter);
    assert!(config.cache.enabled);
    assert_eq!(config.cache.max_entries, 1024);
    assert!(!config.cache.version_scoped);
    assert!(config.store.is_none());
    assert!(config.run_log.is_none());
    assert!(config.providers.command.is_empty());
}

#[test]
fn test_run_log_defaults() {
    let (_dir, path) = agentflow_test_utils::temp_config("[run_log]\n");

    let config = AppConfig::load(&path).expect("load config");
    let log = config.run_log.expect("run_log present");
    assert!(log.enabled);
    assert_eq!(log.level, 2);
    assert!(log.resolved_dir().ends_with("logs"));
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let (_dir, path) = agentflow_test_utils::temp_config("[engine]\nmax_concurrency = 0\n");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));

    let (_dir, path) = agentflow_test_utils::temp_config("[retry]\nmax_attempts = 0\n");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));
}

#[test]
fn test_missing_file() {
    let result = AppConfig::load(std::path::Path::new("/nonexistent/agentflow.toml"));
    assert!(matches!(result, Err(FlowError::ConfigNotFound(_))));
}

#[test]
fn test_malformed_config() {
    let (_dir, path) = agentflow_test_utils::temp_config("[engine\nmax_concurrency = ");
    assert!(matches!(AppConfig::load(&path), Err(FlowError::Config(_))));
}
