use std::collections::{HashMap, HashSet};

use agentflow_core::workflow::{ValidationResult, Violation, WorkflowDefinition};

/// Check a workflow for structural problems.
///
/// All checks run to completion so the caller gets the full violation list:
/// duplicate ids and ports, edges pointing at unknown nodes or ports, input
/// ports with more than one incoming edge, required inputs with no source,
/// and cycles.
pub fn validate(def: &WorkflowDefinition) -> ValidationResult {
    let mut violations = Vec::new();

    // First declaration wins for index lookups.
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in def.nodes.iter().enumerate() {
        if index.contains_key(node.id.as_str()) {
            violations.push(Violation::DuplicateNode {
                node: node.id.clone(),
            });
        } else {
            index.insert(node.id.as_str(), i);
        }

        let mut seen = HashSet::new();
        for port in &node.inputs {
            if !seen.insert(port.name.as_str()) {
                violations.push(Violation::DuplicatePort {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
        let mut seen = HashSet::new();
        for port in &node.outputs {
            if !seen.insert(port.as_str()) {
                violations.push(Violation::DuplicatePort {
                    node: node.id.clone(),
                    port: port.clone(),
                });
            }
        }
    }

    // Edge endpoints. Only fully resolvable edges take part in later checks.
    let mut valid_edges: Vec<(usize, usize, usize)> = Vec::new();
    for (e, edge) in def.edges.iter().enumerate() {
        let from = index.get(edge.from.as_str()).copied();
        let to = index.get(edge.to.as_str()).copied();
        let mut ok = true;

        match from {
            None => {
                violations.push(Violation::UnknownNode {
                    edge: e,
                    node: edge.from.clone(),
                });
                ok = false;
            }
            Some(f) if !def.nodes[f].has_output(&edge.from_port) => {
                violations.push(Violation::UnknownOutputPort {
                    edge: e,
                    node: edge.from.clone(),
                    port: edge.from_port.clone(),
                });
                ok = false;
            }
            Some(_) => {}
        }

        match to {
            None => {
                violations.push(Violation::UnknownNode {
                    edge: e,
                    node: edge.to.clone(),
                });
                ok = false;
            }
            Some(t) if def.nodes[t].input(&edge.to_port).is_none() => {
                violations.push(Violation::UnknownInputPort {
                    edge: e,
                    node: edge.to.clone(),
                    port: edge.to_port.clone(),
                });
                ok = false;
            }
            Some(_) => {}
        }

        if let (true, Some(f), Some(t)) = (ok, from, to) {
            valid_edges.push((e, f, t));
        }
    }

    // At most one incoming edge per input port.
    let mut targets: HashMap<(usize, &str), Vec<usize>> = HashMap::new();
    for &(e, _, t) in &valid_edges {
        targets
            .entry((t, def.edges[e].to_port.as_str()))
            .or_default()
            .push(e);
    }
    let mut fan_in: Vec<_> = targets.iter().filter(|(_, edges)| edges.len() > 1).collect();
    fan_in.sort_by_key(|((t, port), _)| (*t, *port));
    for ((t, port), edges) in fan_in {
        violations.push(Violation::MultipleIncomingEdges {
            node: def.nodes[*t].id.clone(),
            port: port.to_string(),
            edges: edges.clone(),
        });
    }

    // Required inputs need an edge, a run input binding or a default.
    for (i, node) in def.nodes.iter().enumerate() {
        for port in &node.inputs {
            let fed = targets.contains_key(&(i, port.name.as_str()));
            if port.required && !fed && port.default.is_none() && port.run_input.is_none() {
                violations.push(Violation::UnsatisfiedInput {
                    node: node.id.clone(),
                    port: port.name.clone(),
                });
            }
        }
    }

    let cyclic = cyclic_nodes(def.nodes.len(), &valid_edges);
    if !cyclic.is_empty() {
        violations.push(Violation::CycleDetected {
            nodes: cyclic.into_iter().map(|i| def.nodes[i].id.clone()).collect(),
        });
    }

    ValidationResult { violations }
}

/// Nodes that sit on or between cycles, in declaration order.
///
/// Kahn's algorithm peels nodes with no remaining incoming edges; a second
/// pass peels nodes with no remaining outgoing edges so that nodes merely
/// downstream or upstream of a cycle are not reported.
fn cyclic_nodes(n: usize, edges: &[(usize, usize, usize)]) -> Vec<usize> {
    let mut succ: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut pred: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for &(_, f, t) in edges {
        succ[f].insert(t);
        pred[t].insert(f);
    }

    let mut removed = vec![false; n];
    peel(&mut removed, &succ, &pred);
    peel(&mut removed, &pred, &succ);

    (0..n).filter(|&i| !removed[i]).collect()
}

/// Remove every node whose `inbound` neighbours have all been removed.
fn peel(removed: &mut [bool], outbound: &[HashSet<usize>], inbound: &[HashSet<usize>]) {
    let mut remaining: Vec<usize> = inbound
        .iter()
        .map(|preds| preds.iter().filter(|p| !removed[**p]).count())
        .collect();
    let mut queue: Vec<usize> = (0..removed.len())
        .filter(|&i| !removed[i] && remaining[i] == 0)
        .collect();

    while let Some(i) = queue.pop() {
        removed[i] = true;
        for &next in &outbound[i] {
            if removed[next] {
                continue;
            }
            remaining[next] -= 1;
            if remaining[next] == 0 {
                queue.push(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::workflow::{AgentRole, InputPort, NodeDefinition};
    use serde_json::json;

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, AgentRole::Output)
            .with_input(InputPort::optional("in"))
            .with_output("out")
    }

    #[test]
    fn test_valid_diamond() {
        let wf = WorkflowDefinition::new("diamond", 1)
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_node(
                NodeDefinition::new("d", AgentRole::Output)
                    .with_input(InputPort::required("left"))
                    .with_input(InputPort::required("right")),
            )
            .connect("a", "out", "b", "in")
            .connect("a", "out", "c", "in")
            .connect("b", "out", "d", "left")
            .connect("c", "out", "d", "right");
        let result = validate(&wf);
        assert!(result.is_valid(), "{:?}", result.violations);
    }

    #[test]
    fn test_cycle_reports_only_cycle_members() {
        let wf = WorkflowDefinition::new("loop", 1)
            .with_node(node("start"))
            .with_node(node("x"))
            .with_node(node("y"))
            .with_node(node("after"))
            .connect("start", "out", "x", "in")
            .connect("x", "out", "y", "in")
            .connect("y", "out", "x", "in")
            .connect("y", "out", "after", "in");
        let result = validate(&wf);
        assert!(result.violations.contains(&Violation::CycleDetected {
            nodes: vec!["x".into(), "y".into()],
        }));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let wf = WorkflowDefinition::new("self", 1)
            .with_node(node("a"))
            .connect("a", "out", "a", "in");
        let result = validate(&wf);
        assert_eq!(
            result.violations,
            vec![Violation::CycleDetected {
                nodes: vec!["a".into()]
            }]
        );
    }

    #[test]
    fn test_reports_all_violations_at_once() {
        let wf = WorkflowDefinition::new("broken", 1)
            .with_node(node("a"))
            .with_node(node("a"))
            .with_node(
                NodeDefinition::new("b", AgentRole::Output)
                    .with_input(InputPort::required("needed")),
            )
            .with_node(node("c"))
            .connect("a", "missing", "c", "in")
            .connect("ghost", "out", "c", "in")
            .connect("a", "out", "c", "nope");
        let result = validate(&wf);

        assert!(result.violations.contains(&Violation::DuplicateNode { node: "a".into() }));
        assert!(result.violations.contains(&Violation::UnknownOutputPort {
            edge: 0,
            node: "a".into(),
            port: "missing".into(),
        }));
        assert!(result.violations.contains(&Violation::UnknownNode {
            edge: 1,
            node: "ghost".into(),
        }));
        assert!(result.violations.contains(&Violation::UnknownInputPort {
            edge: 2,
            node: "c".into(),
            port: "nope".into(),
        }));
        assert!(result.violations.contains(&Violation::UnsatisfiedInput {
            node: "b".into(),
            port: "needed".into(),
        }));
        assert_eq!(result.violations.len(), 5);
    }

    #[test]
    fn test_multiple_edges_into_one_port() {
        let wf = WorkflowDefinition::new("fan-in", 1)
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .connect("a", "out", "c", "in")
            .connect("b", "out", "c", "in");
        let result = validate(&wf);
        assert_eq!(
            result.violations,
            vec![Violation::MultipleIncomingEdges {
                node: "c".into(),
                port: "in".into(),
                edges: vec![0, 1],
            }]
        );
    }

    #[test]
    fn test_required_input_satisfied_by_default_or_run_input() {
        let wf = WorkflowDefinition::new("inputs", 1)
            .with_node(
                NodeDefinition::new("a", AgentRole::Output)
                    .with_input(InputPort::required("topic").from_run_input("topic"))
                    .with_input(InputPort::required("tone").with_default(json!("neutral"))),
            );
        assert!(validate(&wf).is_valid());
    }

    #[test]
    fn test_duplicate_ports() {
        let wf = WorkflowDefinition::new("ports", 1).with_node(
            NodeDefinition::new("a", AgentRole::Output)
                .with_input(InputPort::optional("x"))
                .with_input(InputPort::optional("x"))
                .with_output("y")
                .with_output("y"),
        );
        let result = validate(&wf);
        assert_eq!(result.violations.len(), 2);
    }
}
