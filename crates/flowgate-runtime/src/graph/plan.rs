use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::WorkflowGraph;
use flowgate_nodes::NodeRegistry;

/// Problems found before a run. Errors refuse the run; warnings do not.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check a graph's structure, and its node types against a registry.
pub fn validate(graph: &WorkflowGraph, registry: &NodeRegistry) -> ValidationReport {
    let mut report = ValidationReport {
        errors: structural_errors(graph),
        warnings: Vec::new(),
    };
    for node in &graph.nodes {
        if !node.node_type.is_empty() && !registry.contains(&node.node_type) {
            report.warnings.push(format!(
                "node '{}' has unregistered type '{}'",
                node.id, node.node_type
            ));
        }
    }
    report
}

fn structural_errors(graph: &WorkflowGraph) -> Vec<String> {
    let mut errors = Vec::new();
    if graph.nodes.is_empty() {
        errors.push("graph has no nodes".to_string());
        return errors;
    }

    let mut seen = HashSet::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        if node.id.is_empty() {
            errors.push(format!("node at position {} has an empty id", i));
        } else if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
        if node.node_type.is_empty() {
            errors.push(format!("node '{}' has no type", node.id));
        }
    }

    for (i, edge) in graph.edges.iter().enumerate() {
        for end in [&edge.source, &edge.target] {
            if !seen.contains(end.as_str()) {
                errors.push(format!("edge {} references unknown node '{}'", i, end));
            }
        }
    }

    // Only meaningful once ids resolve; a DAG always has an entry node
    if errors.is_empty() {
        let mut dag = DiGraph::<(), ()>::new();
        let index: HashMap<&str, NodeIndex> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), dag.add_node(())))
            .collect();
        for edge in &graph.edges {
            dag.add_edge(index[edge.source.as_str()], index[edge.target.as_str()], ());
        }
        if let Err(cycle) = toposort(&dag, None) {
            errors.push(format!(
                "graph contains a cycle through node '{}'",
                graph.nodes[cycle.node_id().index()].id
            ));
        }
    }
    errors
}

/// Validated, index-based view of a workflow graph.
///
/// Nodes and edges are addressed by their position in the source graph.
#[derive(Debug)]
pub struct GraphPlan {
    graph: Arc<WorkflowGraph>,
    dag: DiGraph<usize, usize>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    ends: Vec<(usize, usize)>,
}

impl GraphPlan {
    pub fn build(graph: Arc<WorkflowGraph>) -> Result<Self> {
        let errors = structural_errors(&graph);
        if !errors.is_empty() {
            return Err(FlowgateError::InvalidGraph(errors.join("; ")));
        }

        let mut dag = DiGraph::new();
        let mut index = HashMap::new();
        for (i, node) in graph.nodes.iter().enumerate() {
            index.insert(node.id.as_str(), dag.add_node(i));
        }

        let mut incoming = vec![Vec::new(); graph.nodes.len()];
        let mut outgoing = vec![Vec::new(); graph.nodes.len()];
        let mut ends = Vec::with_capacity(graph.edges.len());
        for (e, edge) in graph.edges.iter().enumerate() {
            let (s, t) = (index[edge.source.as_str()], index[edge.target.as_str()]);
            dag.add_edge(s, t, e);
            outgoing[s.index()].push(e);
            incoming[t.index()].push(e);
            ends.push((s.index(), t.index()));
        }

        Ok(Self {
            graph,
            dag,
            incoming,
            outgoing,
            ends,
        })
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn source_of(&self, edge: usize) -> usize {
        self.ends[edge].0
    }

    pub fn target_of(&self, edge: usize) -> usize {
        self.ends[edge].1
    }

    pub fn is_sink(&self, node: usize) -> bool {
        self.outgoing[node].is_empty()
    }

    /// Nodes a fan-out at `start` runs once per item.
    ///
    /// Walks downstream until the joiner that closes this loop. Every opener
    /// met on the way nests one level deeper, so the next joiner on that path
    /// closes the inner loop and stays inside this body.
    pub fn loop_body(
        &self,
        start: usize,
        joins: impl Fn(usize) -> bool,
        opens: impl Fn(usize) -> bool,
    ) -> BTreeSet<usize> {
        let mut body = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(NodeIndex::new(start), 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            for next in self.dag.neighbors(current) {
                let n = self.dag[next];
                if n == start {
                    continue;
                }
                let below = if joins(n) {
                    match depth.checked_sub(1) {
                        Some(d) => d,
                        None => continue,
                    }
                } else {
                    depth
                };
                let below = below + usize::from(opens(n));
                body.insert(n);
                if visited.insert((n, below)) {
                    queue.push_back((next, below));
                }
            }
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_test_utils::{edge, graph, node};

    #[test]
    fn test_structural_errors() {
        let g = graph(vec![], vec![]);
        assert_eq!(structural_errors(&g), vec!["graph has no nodes"]);

        let g = graph(
            vec![node("a", "noop"), node("a", "noop"), node("b", "")],
            vec![edge("a", "zzz")],
        );
        let errors = structural_errors(&g);
        assert!(errors.contains(&"duplicate node id 'a'".to_string()));
        assert!(errors.contains(&"node 'b' has no type".to_string()));
        assert!(errors.contains(&"edge 0 references unknown node 'zzz'".to_string()));
    }

    #[test]
    fn test_cycle_rejected() {
        let g = graph(
            vec![node("a", "noop"), node("b", "noop"), node("c", "noop")],
            vec![edge("a", "b"), edge("b", "c"), edge("c", "b")],
        );
        let err = GraphPlan::build(g).unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let self_loop = graph(vec![node("a", "noop")], vec![edge("a", "a")]);
        assert!(GraphPlan::build(self_loop).is_err());
    }

    #[test]
    fn test_validate_warns_on_unregistered_types() {
        let g = graph(
            vec![node("a", "passthrough"), node("b", "salesforce_upsert")],
            vec![edge("a", "b")],
        );
        let report = validate(&g, &NodeRegistry::with_builtins());
        assert!(report.is_valid());
        assert_eq!(
            report.warnings,
            vec!["node 'b' has unregistered type 'salesforce_upsert'"]
        );
    }

    #[test]
    fn test_adjacency() {
        let g = graph(
            vec![node("a", "noop"), node("b", "noop"), node("c", "noop")],
            vec![edge("a", "b"), edge("a", "c"), edge("b", "c")],
        );
        let plan = GraphPlan::build(g).unwrap();
        assert_eq!(plan.outgoing(0), &[0, 1]);
        assert_eq!(plan.incoming(2), &[1, 2]);
        assert_eq!((plan.source_of(2), plan.target_of(2)), (1, 2));
        assert!(plan.is_sink(2));
        assert!(!plan.is_sink(0));
    }

    #[test]
    fn test_loop_body_stops_at_joiner() {
        // loop -> a -> b -> collect -> after, loop -> collect
        let g = graph(
            vec![
                node("loop", "loop_items"),
                node("a", "noop"),
                node("b", "noop"),
                node("collect", "collect_items"),
                node("after", "noop"),
            ],
            vec![
                edge("loop", "a"),
                edge("a", "b"),
                edge("b", "collect"),
                edge("collect", "after"),
                edge("loop", "collect"),
            ],
        );
        let plan = GraphPlan::build(g).unwrap();
        let body = plan.loop_body(0, |n| n == 3, |_| false);
        assert_eq!(body, BTreeSet::from([1, 2]));

        // Without a joiner the body runs to the end of the graph
        let open = plan.loop_body(0, |_| false, |_| false);
        assert_eq!(open, BTreeSet::from([1, 2, 3, 4]));
    }

    #[test]
    fn test_nested_loop_closes_at_its_own_joiner() {
        // outer -> inner -> work -> inner_end -> per_outer -> outer_end -> after
        let g = graph(
            vec![
                node("outer", "loop_items"),
                node("inner", "loop_items"),
                node("work", "noop"),
                node("inner_end", "loop_end"),
                node("per_outer", "noop"),
                node("outer_end", "loop_end"),
                node("after", "noop"),
            ],
            vec![
                edge("outer", "inner"),
                edge("inner", "work"),
                edge("work", "inner_end"),
                edge("inner_end", "per_outer"),
                edge("per_outer", "outer_end"),
                edge("outer_end", "after"),
            ],
        );
        let plan = GraphPlan::build(g).unwrap();
        let joins = |n: usize| n == 3 || n == 5;
        let opens = |n: usize| n == 0 || n == 1;

        assert_eq!(plan.loop_body(0, joins, opens), BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(plan.loop_body(1, joins, opens), BTreeSet::from([2]));
    }
}
