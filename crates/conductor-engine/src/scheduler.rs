//! Topological leveling: groups nodes into batches such that every dependency
//! of a batch lives in an earlier batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use conductor_types::{ConductorError, GraphState, Result};

use crate::node::Node;

/// One topological level of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    /// Node ids in registration order.
    pub nodes: Vec<String>,
    /// True when the batch has more than one node and every node is
    /// parallel-safe.
    pub parallel: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Kahn leveling over the dependency relation.
///
/// Within a batch nodes keep registration order, so the same graph always
/// yields the same schedule. Nodes left unvisited mean a cycle slipped past
/// validation; that is reported as an internal error.
pub fn schedule<S: GraphState>(nodes: &[Node<S>]) -> Result<Vec<Batch>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in node.dependencies() {
            let &d = index.get(dep.as_str()).ok_or_else(|| {
                ConductorError::Internal(format!(
                    "scheduler saw unregistered dependency '{}' of node '{}'",
                    dep,
                    node.id()
                ))
            })?;
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut frontier: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut batches = Vec::new();
    let mut visited = 0;

    while !frontier.is_empty() {
        visited += frontier.len();
        let mut next = Vec::new();
        for &i in &frontier {
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        next.sort_unstable();

        let parallel = frontier.len() > 1 && frontier.iter().all(|&i| nodes[i].is_parallel_safe());
        batches.push(Batch {
            index: batches.len(),
            nodes: frontier.iter().map(|&i| nodes[i].id().to_string()).collect(),
            parallel,
        });
        frontier = next;
    }

    if visited != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].id())
            .collect();
        return Err(ConductorError::Internal(format!(
            "scheduler could not order nodes [{}]; the graph contains a cycle",
            stuck.join(", ")
        )));
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::StateMap;
    use std::collections::HashSet;

    fn node(id: &str, deps: &[&str]) -> Node<StateMap> {
        Node::pass_through(id).depends_on(deps.iter().copied())
    }

    fn ids(batches: &[Batch]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|b| b.nodes.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn diamond_graph_levels() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ];
        let batches = schedule(&nodes).unwrap();
        assert_eq!(ids(&batches), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(batches[1].index, 1);
    }

    #[test]
    fn ties_follow_registration_order() {
        let nodes = vec![
            node("root", &[]),
            node("zeta", &["root"]),
            node("alpha", &["root"]),
            node("mid", &["root"]),
        ];
        let batches = schedule(&nodes).unwrap();
        assert_eq!(batches[1].nodes, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn independent_roots_share_first_batch() {
        let nodes = vec![node("x", &[]), node("y", &[]), node("z", &["x", "y"])];
        let batches = schedule(&nodes).unwrap();
        assert_eq!(ids(&batches), vec![vec!["x", "y"], vec!["z"]]);
    }

    #[test]
    fn parallel_flag_requires_every_node_opted_in() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]).parallel(),
            node("c", &["a"]).parallel(),
            node("d", &["b", "c"]).parallel(),
            node("e", &["b", "c"]),
        ];
        let batches = schedule(&nodes).unwrap();
        assert!(!batches[0].parallel, "single-node batch is never parallel");
        assert!(batches[1].parallel);
        assert!(!batches[2].parallel, "mixed batch runs serially");
    }

    #[test]
    fn every_node_appears_once_after_its_dependencies() {
        let nodes = vec![
            node("load", &[]),
            node("analyze", &["load"]),
            node("plan", &["analyze"]),
            node("generate", &["plan", "analyze"]),
            node("lint", &["generate"]),
            node("test", &["generate"]),
            node("build", &["generate"]),
            node("report", &["lint", "test", "build", "load"]),
        ];
        let batches = schedule(&nodes).unwrap();

        let mut level: HashMap<&str, usize> = HashMap::new();
        for batch in &batches {
            for id in &batch.nodes {
                assert!(level.insert(id.as_str(), batch.index).is_none(), "{id} scheduled twice");
            }
        }
        assert_eq!(level.len(), nodes.len());
        for n in &nodes {
            for dep in n.dependencies() {
                assert!(level[dep.as_str()] < level[n.id()], "{} before {}", dep, n.id());
            }
        }
        let seen: HashSet<_> = level.keys().copied().collect();
        assert!(seen.contains("report"));
    }

    #[test]
    fn cycle_is_an_internal_error() {
        let nodes = vec![node("a", &[]), node("b", &["a", "c"]), node("c", &["b"])];
        let err = schedule(&nodes).unwrap_err();
        match err {
            ConductorError::Internal(msg) => {
                assert!(msg.contains("b") && msg.contains("c"), "{msg}");
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_an_internal_error() {
        let nodes = vec![node("a", &["a"])];
        assert!(matches!(schedule(&nodes), Err(ConductorError::Internal(_))));
    }

    #[test]
    fn empty_graph_has_no_batches() {
        let nodes: Vec<Node<StateMap>> = Vec::new();
        assert!(schedule(&nodes).unwrap().is_empty());
    }
}
