use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use agentflow_core::error::Result;
use agentflow_core::workflow::{EdgeDefinition, NodeDefinition, WorkflowDefinition};

use super::validator::validate;

/// Immutable, validated view of a workflow.
///
/// Nodes are addressed by their declaration index, which doubles as the
/// dispatch tie-break.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: Arc<WorkflowDefinition>,
    index: HashMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    /// Per node: input port name -> edge index feeding it.
    incoming: Vec<HashMap<String, usize>>,
}

impl WorkflowGraph {
    /// Validate and compile a workflow. Fails with `FlowError::Validation`
    /// carrying every violation found.
    pub fn build(definition: Arc<WorkflowDefinition>) -> Result<Self> {
        validate(&definition).into_result()?;

        let index: HashMap<String, usize> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let n = definition.nodes.len();
        let mut upstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut incoming: Vec<HashMap<String, usize>> = vec![HashMap::new(); n];

        for (e, edge) in definition.edges.iter().enumerate() {
            // Endpoints are guaranteed by validation.
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                continue;
            };
            upstream[to].insert(from);
            downstream[from].insert(to);
            incoming[to].insert(edge.to_port.clone(), e);
        }

        Ok(Self {
            definition,
            index,
            upstream: upstream.into_iter().map(|s| s.into_iter().collect()).collect(),
            downstream: downstream.into_iter().map(|s| s.into_iter().collect()).collect(),
            incoming,
        })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.definition.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &NodeDefinition {
        &self.definition.nodes[idx]
    }

    pub fn index_of(&self, node_id: &str) -> Option<usize> {
        self.index.get(node_id).copied()
    }

    /// Distinct predecessors, ascending by declaration index.
    pub fn upstream(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    /// Distinct successors, ascending by declaration index.
    pub fn downstream(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    /// The edge feeding `port` on node `idx`, if any.
    pub fn incoming_edge(&self, idx: usize, port: &str) -> Option<&EdgeDefinition> {
        self.incoming[idx]
            .get(port)
            .map(|&e| &self.definition.edges[e])
    }

    pub fn roots(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.upstream[i].is_empty()).collect()
    }

    /// Kahn order, breaking ties by declaration index.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(|u| u.len()).collect();
        let mut ready: BTreeSet<usize> = self.roots().into_iter().collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &next in &self.downstream[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::error::FlowError;
    use agentflow_core::workflow::{AgentRole, InputPort};

    fn diamond() -> WorkflowDefinition {
        let node = |id: &str| {
            NodeDefinition::new(id, AgentRole::Output)
                .with_input(InputPort::optional("in"))
                .with_input(InputPort::optional("in2"))
                .with_output("out")
        };
        WorkflowDefinition::new("diamond", 1)
            .with_node(node("a"))
            .with_node(node("b"))
            .with_node(node("c"))
            .with_node(node("d"))
            .connect("a", "out", "b", "in")
            .connect("a", "out", "c", "in")
            .connect("b", "out", "d", "in")
            .connect("c", "out", "d", "in2")
    }

    #[test]
    fn test_adjacency() {
        let graph = WorkflowGraph::build(Arc::new(diamond())).unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.downstream(0), &[1, 2]);
        assert_eq!(graph.upstream(3), &[1, 2]);
        assert_eq!(graph.incoming_edge(3, "in2").unwrap().from, "c");
        assert!(graph.incoming_edge(0, "in").is_none());
        assert_eq!(graph.index_of("d"), Some(3));
    }

    #[test]
    fn test_topological_order_uses_declaration_tie_break() {
        let graph = WorkflowGraph::build(Arc::new(diamond())).unwrap();
        assert_eq!(graph.topological_order(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parallel_edges_count_once() {
        let wf = diamond().connect("a", "out", "d", "in3");
        let mut wf = wf;
        wf.nodes[3].inputs.push(InputPort::optional("in3"));
        let graph = WorkflowGraph::build(Arc::new(wf)).unwrap();
        assert_eq!(graph.upstream(3), &[0, 1, 2]);
        assert_eq!(graph.downstream(0), &[1, 2, 3]);
    }

    #[test]
    fn test_build_rejects_invalid() {
        let wf = diamond().connect("d", "out", "a", "in2");
        match WorkflowGraph::build(Arc::new(wf)) {
            Err(FlowError::Validation(violations)) => assert!(!violations.is_empty()),
            other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
        }
    }
}
