use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level agentflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub run_log: Option<LogConfig>,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Scheduling and run lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum simultaneously in-flight node invocations per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Optional cap on in-flight invocations across all runs.
    #[serde(default)]
    pub global_concurrency: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// How long terminal runs are kept in memory.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            global_concurrency: None,
            default_timeout_secs: default_timeout_secs(),
            retention_secs: default_retention_secs(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_max_concurrency() -> usize { 4 }
fn default_timeout_secs() -> u64 { 300 }
fn default_retention_secs() -> u64 { 3600 }
fn default_event_buffer() -> usize { 256 }

/// Per-node retry policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total invocation attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }
fn default_jitter() -> bool { true }

/// Result cache budget and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// TTL applied to new entries. None keeps entries until evicted.
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
    /// Include the workflow id and version in every fingerprint.
    #[serde(default)]
    pub version_scoped: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            default_ttl_secs: None,
            version_scoped: false,
        }
    }
}

fn default_cache_enabled() -> bool { true }
fn default_max_entries() -> usize { 1024 }
fn default_max_bytes() -> usize { 64 * 1024 * 1024 }

/// SQLite persistence for cache entries and runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

impl StoreConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle only, 2 = + node results, 3 = every event (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("logs"))
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Capability providers configured for the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub command: Vec<CommandProviderConfig>,
}

/// An external program serving a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandProviderConfig {
    pub name: String,
    /// Capability tag served (e.g., "agent", "summarize").
    pub capability: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_priority() -> u32 { 100 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(FlowError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.engine.global_concurrency == Some(0) {
            return Err(FlowError::Config(
                "engine.global_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(FlowError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
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

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
