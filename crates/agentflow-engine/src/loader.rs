//! Workflow documents from disk.
//!
//! Two formats are accepted: the native serialisation of
//! `WorkflowDefinition` (TOML or JSON), and the diagram format produced by the
//! visual designer (`nodes` keyed by `key`, plus `links`).

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::workflow::{
    AgentPersona, AgentRole, EdgeDefinition, InputPort, NodeDefinition, SummarizeMode,
    WorkflowDefinition,
};

/// Output port exposed by every diagram node.
pub const RESULT_PORT: &str = "result";

/// Key of the collector node appended to diagrams that lack one.
pub const OUTPUT_KEY: &str = "output";

#[derive(Debug, Clone, Deserialize)]
pub struct Diagram {
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<DiagramNode>,
    #[serde(default)]
    pub links: Vec<DiagramLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagramNode {
    pub key: String,
    #[serde(rename = "type", default = "default_node_type")]
    pub kind: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub summarize: Option<String>,
    #[serde(default)]
    pub rag: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_node_type() -> String { "agent".to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct DiagramLink {
    #[serde(default)]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
}

/// Load a workflow file. `.toml` is always native; JSON is treated as a
/// diagram when it has a `links` array.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| FlowError::WorkflowNotFound(path.display().to_string()))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow");

    let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
    if is_toml {
        return toml::from_str(&content).map_err(|e| FlowError::WorkflowParse(e.to_string()));
    }
    parse_json(&content, stem)
}

/// Parse a JSON document in either format. `fallback_id` names diagrams,
/// which carry no id of their own.
pub fn parse_json(content: &str, fallback_id: &str) -> Result<WorkflowDefinition> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| FlowError::WorkflowParse(e.to_string()))?;

    if value.get("links").is_some_and(|l| l.is_array()) {
        let diagram: Diagram =
            serde_json::from_value(value).map_err(|e| FlowError::WorkflowParse(e.to_string()))?;
        return from_diagram(diagram, fallback_id);
    }
    serde_json::from_value(value).map_err(|e| FlowError::WorkflowParse(e.to_string()))
}

/// Convert a designer diagram into a workflow.
///
/// Each node exposes a single `result` port. A link `from -> to` feeds
/// `from.result` into the input port of `to` named after `from`, so every
/// upstream result becomes part of the downstream node's context. A node's
/// task comes from its first outgoing link. A diagram without an `output`
/// node gets one, fed by every sink.
pub fn from_diagram(mut diagram: Diagram, id: &str) -> Result<WorkflowDefinition> {
    add_output_node(&mut diagram);

    let mut def = WorkflowDefinition::new(id, 1);
    def.name = diagram.name.clone();

    for node in &diagram.nodes {
        let first_link = diagram.links.iter().find(|l| l.from == node.key);
        let role = role_for(node, first_link)?;

        let mut definition = NodeDefinition::new(node.key.clone(), role);
        if matches!(definition.role, AgentRole::Output) {
            definition = definition.with_output("results").with_output("message");
        } else {
            definition = definition.with_output(RESULT_PORT);
        }

        for link in diagram.links.iter().filter(|l| l.to == node.key) {
            if definition.input(&link.from).is_none() {
                definition = definition.with_input(InputPort::required(link.from.clone()));
            }
        }
        def.nodes.push(definition);
    }

    for link in &diagram.links {
        def.edges.push(EdgeDefinition {
            from: link.from.clone(),
            from_port: output_port(&diagram, &link.from).to_string(),
            to: link.to.clone(),
            to_port: link.from.clone(),
        });
    }

    debug!(
        workflow_id = id,
        nodes = def.nodes.len(),
        edges = def.edges.len(),
        "Converted diagram"
    );
    Ok(def)
}

fn output_port<'a>(diagram: &'a Diagram, key: &str) -> &'a str {
    let is_output = diagram
        .nodes
        .iter()
        .any(|n| n.key == key && n.kind == OUTPUT_KEY);
    if is_output {
        "message"
    } else {
        RESULT_PORT
    }
}

fn add_output_node(diagram: &mut Diagram) {
    let has_output = diagram
        .nodes
        .iter()
        .any(|n| n.key == OUTPUT_KEY || n.kind == OUTPUT_KEY);
    if has_output {
        return;
    }

    let sinks: Vec<String> = diagram
        .nodes
        .iter()
        .filter(|n| !diagram.links.iter().any(|l| l.from == n.key))
        .map(|n| n.key.clone())
        .collect();

    diagram.nodes.push(DiagramNode {
        key: OUTPUT_KEY.to_string(),
        kind: OUTPUT_KEY.to_string(),
        role: "Output".to_string(),
        goal: "Collect and format the final output".to_string(),
        backstory: String::new(),
        file: None,
        summarize: None,
        rag: None,
        model: None,
    });
    for sink in sinks {
        diagram.links.push(DiagramLink {
            id: Some(format!("link_{}_output", sink)),
            from: sink,
            to: OUTPUT_KEY.to_string(),
            description: Some("Send results to the output".to_string()),
            expected_output: None,
        });
    }
}

fn role_for(node: &DiagramNode, first_link: Option<&DiagramLink>) -> Result<AgentRole> {
    match node.kind.as_str() {
        "output" => Ok(AgentRole::Output),
        "agent" => {
            let rag = node
                .rag
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case("yes"));
            // A searchable document is never summarised up front.
            let summarize = if rag {
                SummarizeMode::No
            } else {
                parse_summarize(node)?
            };
            Ok(AgentRole::Agent(AgentPersona {
                role: node.role.clone(),
                goal: node.goal.clone(),
                backstory: node.backstory.clone(),
                task: first_link.and_then(|l| l.description.clone()),
                expected_output: first_link.and_then(|l| l.expected_output.clone()),
                model: node.model.clone(),
                file: node.file.clone().filter(|f| !f.is_empty()),
                summarize,
                rag,
            }))
        }
        other => Ok(AgentRole::custom(
            other,
            serde_json::json!({
                "role": node.role,
                "goal": node.goal,
                "backstory": node.backstory,
            }),
        )),
    }
}

fn parse_summarize(node: &DiagramNode) -> Result<SummarizeMode> {
    let Some(value) = node.summarize.as_deref() else {
        return Ok(SummarizeMode::Yes);
    };
    match value.to_ascii_lowercase().as_str() {
        "yes" => Ok(SummarizeMode::Yes),
        "no" => Ok(SummarizeMode::No),
        "force" => Ok(SummarizeMode::Force),
        _ => Err(FlowError::WorkflowParse(format!(
            "node {}: invalid summarize value '{}'",
            node.key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WorkflowGraph;
    use std::sync::Arc;

    const DIAGRAM: &str = r#"{
        "name": "Market study",
        "nodes": [
            {"key": "analyst", "type": "agent", "role": "Analyst", "goal": "Study the market",
             "file": "report.pdf", "summarize": "Force"},
            {"key": "writer", "type": "agent", "role": "Writer", "goal": "Write it up", "rag": "Yes"},
            {"key": "critic", "type": "agent", "role": "Critic", "summarize": "No"}
        ],
        "links": [
            {"id": "l1", "from": "analyst", "to": "writer",
             "description": "Analyse the data", "expected_output": "A list of trends"},
            {"id": "l2", "from": "analyst", "to": "critic", "description": "Second task"}
        ]
    }"#;

    #[test]
    fn test_diagram_conversion() {
        let def = parse_json(DIAGRAM, "market").unwrap();
        assert_eq!(def.id, "market");
        assert_eq!(def.name.as_deref(), Some("Market study"));

        // writer and critic are sinks and feed the added output node.
        let ids: Vec<&str> = def.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["analyst", "writer", "critic", "output"]);
        assert_eq!(def.edges.len(), 4);

        match &def.node("analyst").unwrap().role {
            AgentRole::Agent(p) => {
                assert_eq!(p.task.as_deref(), Some("Analyse the data"));
                assert_eq!(p.expected_output.as_deref(), Some("A list of trends"));
                assert_eq!(p.summarize, SummarizeMode::Force);
                assert_eq!(p.file.as_deref(), Some("report.pdf"));
            }
            other => panic!("unexpected role {:?}", other),
        }
        match &def.node("writer").unwrap().role {
            AgentRole::Agent(p) => {
                assert!(p.rag);
                assert_eq!(p.summarize, SummarizeMode::No);
                assert!(p.task.is_some());
            }
            other => panic!("unexpected role {:?}", other),
        }

        match &def.node("critic").unwrap().role {
            AgentRole::Agent(p) => assert_eq!(p.summarize, SummarizeMode::No),
            other => panic!("unexpected role {:?}", other),
        }

        let output = def.node("output").unwrap();
        assert_eq!(output.role, AgentRole::Output);
        assert!(output.input("writer").is_some());
        assert!(output.input("critic").is_some());

        let graph = WorkflowGraph::build(Arc::new(def)).unwrap();
        assert_eq!(graph.roots().len(), 1);
    }

    #[test]
    fn test_existing_output_node_is_kept() {
        let json = r#"{
            "nodes": [
                {"key": "a", "type": "agent", "role": "A"},
                {"key": "output", "type": "output"}
            ],
            "links": [{"from": "a", "to": "output"}]
        }"#;
        let def = parse_json(json, "wf").unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.edges[0].from_port, RESULT_PORT);
        assert_eq!(def.edges[0].to_port, "a");
    }

    #[test]
    fn test_invalid_summarize_is_rejected() {
        let json = r#"{"nodes": [{"key": "a", "summarize": "Maybe"}], "links": []}"#;
        assert!(matches!(
            parse_json(json, "wf"),
            Err(FlowError::WorkflowParse(_))
        ));
    }

    #[test]
    fn test_native_json() {
        let json = r#"{"id": "native", "nodes": [{"id": "a", "role": {"kind": "output"}}]}"#;
        let def = parse_json(json, "ignored").unwrap();
        assert_eq!(def.id, "native");
        assert_eq!(def.version, 1);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.json");
        std::fs::write(&path, DIAGRAM).unwrap();
        assert_eq!(load_workflow(&path).unwrap().id, "study");

        let path = dir.path().join("native.toml");
        std::fs::write(
            &path,
            "id = \"t\"\n[[nodes]]\nid = \"a\"\nrole = { kind = \"output\" }\n",
        )
        .unwrap();
        assert_eq!(load_workflow(&path).unwrap().id, "t");

        assert!(matches!(
            load_workflow(&dir.path().join("missing.json")),
            Err(FlowError::WorkflowNotFound(_))
        ));
    }
}
