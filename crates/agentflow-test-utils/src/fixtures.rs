use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;

use agentflow_core::config::RetryConfig;
use agentflow_core::workflow::{AgentRole, InputPort, NodeDefinition, WorkflowDefinition};

use crate::provider::{Script, ScriptedProvider};

/// Capability tag served by `ScriptedProvider` fixtures.
pub const SCRIPTED: &str = "scripted";

/// A node served by the scripted capability. The node id is part of the role
/// config so that distinct nodes never share a fingerprint.
pub fn scripted_node(id: &str) -> NodeDefinition {
    NodeDefinition::new(id, AgentRole::custom(SCRIPTED, json!({ "task": id })))
}

/// `a -> b`, `a -> c`, `b, c -> d`.
///
/// `a` produces `x`; `b` and `c` read `x` and produce `y`; `d` reads `b` and
/// `c` and produces `out`.
pub fn diamond() -> WorkflowDefinition {
    WorkflowDefinition::new("diamond", 1)
        .with_node(scripted_node("a").with_output("x"))
        .with_node(
            scripted_node("b")
                .with_input(InputPort::required("x"))
                .with_output("y"),
        )
        .with_node(
            scripted_node("c")
                .with_input(InputPort::required("x"))
                .with_output("y"),
        )
        .with_node(
            scripted_node("d")
                .with_input(InputPort::required("b"))
                .with_input(InputPort::required("c"))
                .with_output("out"),
        )
        .connect("a", "x", "b", "x")
        .connect("a", "x", "c", "x")
        .connect("b", "y", "d", "b")
        .connect("c", "y", "d", "c")
}

/// Provider scripted for `diamond()`: `a -> {x: 1}`, `b -> {y: "b"}`,
/// `c -> {y: "c"}`, `d -> {out: "d"}`, each after `delay`.
pub fn diamond_provider(delay: Duration) -> ScriptedProvider {
    let provider = ScriptedProvider::new(SCRIPTED);
    provider.script("a", Script::succeed(json!({"x": 1})).with_delay(delay));
    provider.script("b", Script::succeed(json!({"y": "b"})).with_delay(delay));
    provider.script("c", Script::succeed(json!({"y": "c"})).with_delay(delay));
    provider.script("d", Script::succeed(json!({"out": "d"})).with_delay(delay));
    provider
}

/// A linear workflow: each node reads `in` from the previous node's `out`.
pub fn chain(ids: &[&str]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("chain", 1);
    for (i, id) in ids.iter().enumerate() {
        let mut node = scripted_node(id).with_output("out");
        if i > 0 {
            node = node.with_input(InputPort::required("in"));
        }
        def = def.with_node(node);
    }
    for pair in ids.windows(2) {
        def = def.connect(pair[0], "out", pair[1], "in");
    }
    def
}

/// Three attempts with millisecond backoff and no jitter.
pub fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        jitter: false,
    }
}

/// Write a workflow as TOML into `dir`.
pub fn write_workflow(dir: &Path, def: &WorkflowDefinition) -> PathBuf {
    let path = dir.join(format!("{}.toml", def.id));
    let content = toml::to_string(def).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

/// Write a config file into a fresh temp dir. Keep the dir alive for the
/// duration of the test.
pub fn temp_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentflow.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}
