//! Workflow documents: nodes, ports, edges and the agent-role descriptor.
//!
//! A `WorkflowDefinition` is produced by the authoring side and is treated as
//! immutable once a run starts. Structural checks live in the engine's
//! validator; this module only defines the shapes and their serde layout.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A complete workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Nodes in declaration order. Declaration order is the dispatch tie-break.
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

fn default_version() -> u32 { 1 }

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            name: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connect `from.from_port` to `to.to_port`.
    pub fn connect(
        mut self,
        from: impl Into<String>,
        from_port: impl Into<String>,
        to: impl Into<String>,
        to_port: impl Into<String>,
    ) -> Self {
        self.edges.push(EdgeDefinition {
            from: from.into(),
            from_port: from_port.into(),
            to: to.into(),
            to_port: to_port.into(),
        });
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes with no incoming edge, i.e. independent branches.
    pub fn root_nodes(&self) -> Vec<&NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.to == n.id))
            .collect()
    }
}

/// A unit of work bound to one agent capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    pub role: AgentRole,
    #[serde(default)]
    pub inputs: Vec<InputPort>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Overrides the engine's default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides the engine's default attempt budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// A permanent failure of a critical node fails the whole run.
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool { true }

impl NodeDefinition {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            role,
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout_secs: None,
            max_attempts: None,
            critical: true,
        }
    }

    pub fn with_input(mut self, port: InputPort) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|p| p == name)
    }
}

/// A declared input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Name of a run-level input that feeds this port.
    #[serde(default)]
    pub run_input: Option<String>,
}

fn default_required() -> bool { true }

impl InputPort {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            run_input: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn from_run_input(mut self, key: impl Into<String>) -> Self {
        self.run_input = Some(key.into());
        self
    }
}

/// `from.from_port` feeds `to.to_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub from_port: String,
    pub to: String,
    pub to_port: String,
}

/// Capability tag plus static configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRole {
    /// LLM-backed persona working on a task.
    Agent(AgentPersona),
    /// Summarise a document.
    Summarize {
        file: String,
        #[serde(default)]
        pages: Option<u32>,
    },
    /// Collect upstream results into a final report.
    Output,
    /// Run an external program.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Anything else, addressed by its capability tag.
    Custom {
        capability: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl AgentRole {
    /// Capability tag used to look up a provider.
    pub fn capability(&self) -> &str {
        match self {
            AgentRole::Agent(_) => "agent",
            AgentRole::Summarize { .. } => "summarize",
            AgentRole::Output => "output",
            AgentRole::Command { .. } => "command",
            AgentRole::Custom { capability, .. } => capability,
        }
    }

    pub fn custom(capability: impl Into<String>, config: serde_json::Value) -> Self {
        AgentRole::Custom {
            capability: capability.into(),
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentPersona {
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    /// Preferred model; providers may fall back when it is unavailable.
    #[serde(default)]
    pub model: Option<String>,
    /// Reference document attached to the agent.
    #[serde(default)]
    pub file: Option<String>,
    /// How `file` is folded into the agent's context.
    #[serde(default)]
    pub summarize: SummarizeMode,
    /// Search `file` on demand instead of summarising it.
    #[serde(default)]
    pub rag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizeMode {
    #[default]
    No,
    /// Reuse an existing summary when one exists.
    Yes,
    /// Always produce a fresh summary.
    Force,
}

/// A single structural problem found in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("duplicate node id '{node}'")]
    DuplicateNode { node: String },

    #[error("node '{node}' declares port '{port}' more than once")]
    DuplicatePort { node: String, port: String },

    #[error("edge #{edge} references unknown node '{node}'")]
    UnknownNode { edge: usize, node: String },

    #[error("edge #{edge} references unknown output port '{node}.{port}'")]
    UnknownOutputPort {
        edge: usize,
        node: String,
        port: String,
    },

    #[error("edge #{edge} references unknown input port '{node}.{port}'")]
    UnknownInputPort {
        edge: usize,
        node: String,
        port: String,
    },

    #[error("input port '{node}.{port}' is targeted by edges {edges:?}")]
    MultipleIncomingEdges {
        node: String,
        port: String,
        edges: Vec<usize>,
    },

    #[error("required input '{node}.{port}' has no incoming edge, run input or default")]
    UnsatisfiedInput { node: String, port: String },

    #[error("cycle detected through nodes {nodes:?}")]
    CycleDetected { nodes: Vec<String> },
}

/// Outcome of validating a workflow. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn a failed validation into `FlowError::Validation`.
    pub fn into_result(self) -> crate::error::Result<()> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(crate::error::FlowError::Validation(self.violations))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrips_with_kind_tag() {
        let json = r#"{"kind": "command", "program": "echo", "args": ["hi"]}"#;
        let role: AgentRole = serde_json::from_str(json).unwrap();
        assert_eq!(role.capability(), "command");

        let json = r#"{"kind": "agent", "role": "Researcher", "goal": "find facts"}"#;
        let role: AgentRole = serde_json::from_str(json).unwrap();
        match role {
            AgentRole::Agent(p) => {
                assert_eq!(p.role, "Researcher");
                assert!(p.backstory.is_empty());
                assert!(!p.rag);
                assert_eq!(p.summarize, SummarizeMode::No);
            }
            other => panic!("unexpected role {:?}", other),
        }
    }

    #[test]
    fn test_custom_role_uses_its_own_capability() {
        let role = AgentRole::custom("translate", serde_json::json!({"lang": "fr"}));
        assert_eq!(role.capability(), "translate");
    }

    #[test]
    fn test_node_defaults_from_json() {
        let json = r#"{"id": "a", "role": {"kind": "output"}}"#;
        let node: NodeDefinition = serde_json::from_str(json).unwrap();
        assert!(node.critical);
        assert!(node.inputs.is_empty());
        assert!(node.timeout_secs.is_none());
    }

    #[test]
    fn test_workflow_from_toml() {
        let toml_str = r#"
id = "report"
version = 2

[[nodes]]
id = "fetch"
outputs = ["text"]
role = { kind = "command", program = "curl" }

[[nodes]]
id = "collect"
role = { kind = "output" }
inputs = [{ name = "text" }]

[[edges]]
from = "fetch"
from_port = "text"
to = "collect"
to_port = "text"
"#;
        let wf: WorkflowDefinition = toml::from_str(toml_str).unwrap();
        assert_eq!(wf.version, 2);
        assert_eq!(wf.nodes.len(), 2);
        assert!(wf.node("collect").unwrap().input("text").unwrap().required);
        assert_eq!(wf.root_nodes().len(), 1);
    }

    #[test]
    fn test_builder() {
        let wf = WorkflowDefinition::new("wf", 1)
            .with_node(NodeDefinition::new("a", AgentRole::Output).with_output("x"))
            .with_node(
                NodeDefinition::new("b", AgentRole::Output)
                    .with_input(InputPort::optional("x").with_default(serde_json::json!(0)))
                    .non_critical(),
            )
            .connect("a", "x", "b", "x");
        assert_eq!(wf.edges.len(), 1);
        assert!(!wf.node("b").unwrap().critical);
        assert!(wf.node("a").unwrap().has_output("x"));
    }
}
