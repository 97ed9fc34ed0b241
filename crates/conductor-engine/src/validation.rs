//! Graph validation: hard structural checks and advisory lint diagnostics.
//!
//! [`check_structure`] enforces the invariants the executor relies on (start
//! and end present, every dependency registered, no cycle). [`lint`] runs the
//! same checks as `Error` diagnostics plus advisory rules, and
//! [`validate_or_raise`] fails on the first structural problem.

use std::collections::{HashMap, HashSet, VecDeque};

use conductor_types::{GraphState, StructuralError};

use crate::graph::GraphBuilder;
use crate::node::Node;
use crate::scheduler::schedule;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// Structural checks
// ---------------------------------------------------------------------------

/// Run the hard checks in order and return the first failure.
pub fn check_structure<S: GraphState>(graph: &GraphBuilder<S>) -> Result<(), StructuralError> {
    if !graph.contains(graph.start_id()) {
        return Err(StructuralError::MissingStart(graph.start_id().to_string()));
    }
    if !graph.contains(graph.end_id()) {
        return Err(StructuralError::MissingEnd(graph.end_id().to_string()));
    }
    if let Some((node, dependency)) = dangling_dependencies(graph.nodes()).into_iter().next() {
        return Err(StructuralError::DanglingDependency { node, dependency });
    }
    if let Some(path) = find_cycle(graph.nodes()) {
        return Err(StructuralError::Cycle { path });
    }
    Ok(())
}

fn dangling_dependencies<S>(nodes: &[Node<S>]) -> Vec<(String, String)> {
    let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    nodes
        .iter()
        .flat_map(|n| {
            n.dependencies
                .iter()
                .filter(|dep| !ids.contains(dep.as_str()))
                .map(move |dep| (n.id.clone(), dep.clone()))
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over dependency edges. A dependency that is still on
/// the stack closes a cycle; the returned path starts and ends at the node
/// where it closes. Unregistered dependencies are ignored here.
pub(crate) fn find_cycle<S>(nodes: &[Node<S>]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut stack = Vec::new();

    for i in 0..nodes.len() {
        if marks[i] == Mark::Unvisited {
            if let Some(cycle) = visit(i, nodes, &index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<S>(
    i: usize,
    nodes: &[Node<S>],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<String>> {
    marks[i] = Mark::OnStack;
    stack.push(i);

    for dep in &nodes[i].dependencies {
        let Some(&j) = index.get(dep.as_str()) else {
            continue;
        };
        match marks[j] {
            Mark::OnStack => {
                let from = stack.iter().position(|&k| k == j).unwrap_or(0);
                let mut path: Vec<String> = stack[from..]
                    .iter()
                    .map(|&k| nodes[k].id.clone())
                    .collect();
                path.push(nodes[j].id.clone());
                return Some(path);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(j, nodes, index, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    stack.pop();
    marks[i] = Mark::Done;
    None
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule<S>: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic>;
}

fn error(rule: &str, message: String, node_id: Option<String>, fix: &str) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        node_id,
        fix: Some(fix.into()),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl<S: GraphState> LintRule<S> for StartNodeRule {
    fn name(&self) -> &str { "start_node" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        if graph.contains(graph.start_id()) {
            return vec![];
        }
        vec![error(
            LintRule::<S>::name(self),
            format!("Start node '{}' is not registered", graph.start_id()),
            None,
            "Register the start node or point the graph at an existing one",
        )]
    }
}

struct EndNodeRule;
impl<S: GraphState> LintRule<S> for EndNodeRule {
    fn name(&self) -> &str { "end_node" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        if graph.contains(graph.end_id()) {
            return vec![];
        }
        vec![error(
            LintRule::<S>::name(self),
            format!("End node '{}' is not registered", graph.end_id()),
            None,
            "Register the end node or point the graph at an existing one",
        )]
    }
}

struct DependencyExistsRule;
impl<S: GraphState> LintRule<S> for DependencyExistsRule {
    fn name(&self) -> &str { "dependency_exists" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        dangling_dependencies(graph.nodes())
            .into_iter()
            .map(|(node, dep)| Diagnostic {
                rule: LintRule::<S>::name(self).into(),
                severity: Severity::Error,
                message: format!("Node '{node}' depends on unregistered node '{dep}'"),
                node_id: Some(node),
                fix: Some(format!("Register '{dep}' or drop the dependency")),
            })
            .collect()
    }
}

struct AcyclicRule;
impl<S: GraphState> LintRule<S> for AcyclicRule {
    fn name(&self) -> &str { "acyclic" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        match find_cycle(graph.nodes()) {
            Some(path) => vec![error(
                LintRule::<S>::name(self),
                format!("Dependency cycle: {}", path.join(" -> ")),
                path.first().cloned(),
                "Remove one dependency on the cycle",
            )],
            None => vec![],
        }
    }
}

struct StartHasNoDependenciesRule;
impl<S: GraphState> LintRule<S> for StartHasNoDependenciesRule {
    fn name(&self) -> &str { "start_has_no_dependencies" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        match graph.node(graph.start_id()) {
            Some(start) if !start.dependencies().is_empty() => vec![Diagnostic {
                rule: LintRule::<S>::name(self).into(),
                severity: Severity::Warning,
                message: format!(
                    "Start node '{}' depends on [{}]",
                    start.id(),
                    start.dependencies().join(", ")
                ),
                node_id: Some(start.id().to_string()),
                fix: Some("The start node should not wait on other nodes".into()),
            }],
            _ => vec![],
        }
    }
}

struct EndIsTerminalRule;
impl<S: GraphState> LintRule<S> for EndIsTerminalRule {
    fn name(&self) -> &str { "end_is_terminal" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        let end = graph.end_id();
        graph
            .nodes()
            .iter()
            .filter(|n| n.dependencies().iter().any(|d| d == end))
            .map(|n| Diagnostic {
                rule: LintRule::<S>::name(self).into(),
                severity: Severity::Warning,
                message: format!("Node '{}' depends on the end node '{end}'", n.id()),
                node_id: Some(n.id().to_string()),
                fix: Some("Nothing should run after the end node".into()),
            })
            .collect()
    }
}

struct FeedsEndRule;
impl<S: GraphState> LintRule<S> for FeedsEndRule {
    fn name(&self) -> &str { "feeds_end" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        let Some(end) = graph.node(graph.end_id()) else {
            return vec![]; // EndNodeRule will catch this
        };

        let mut ancestors = HashSet::new();
        let mut queue = VecDeque::new();
        ancestors.insert(end.id().to_string());
        queue.push_back(end);
        while let Some(current) = queue.pop_front() {
            for dep in current.dependencies() {
                if let Some(node) = graph.node(dep) {
                    if ancestors.insert(dep.clone()) {
                        queue.push_back(node);
                    }
                }
            }
        }

        graph
            .nodes()
            .iter()
            .filter(|n| !ancestors.contains(n.id()))
            .filter(|n| n.id() != graph.end_id())
            .map(|n| Diagnostic {
                rule: LintRule::<S>::name(self).into(),
                severity: Severity::Warning,
                message: format!("Node '{}' does not feed into the end node", n.id()),
                node_id: Some(n.id().to_string()),
                fix: Some(format!(
                    "Make '{}' (or something downstream of it) a dependency of '{}'",
                    n.id(),
                    graph.end_id()
                )),
            })
            .collect()
    }
}

struct MixedParallelBatchRule;
impl<S: GraphState> LintRule<S> for MixedParallelBatchRule {
    fn name(&self) -> &str { "parallel_batch_mixed" }
    fn apply(&self, graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
        let Ok(batches) = schedule(graph.nodes()) else {
            return vec![];
        };
        batches
            .iter()
            .filter(|b| b.len() > 1 && !b.parallel)
            .filter(|b| {
                b.nodes
                    .iter()
                    .any(|id| graph.node(id).is_some_and(|n| n.is_parallel_safe()))
            })
            .map(|b| Diagnostic {
                rule: LintRule::<S>::name(self).into(),
                severity: Severity::Info,
                message: format!(
                    "Batch {} [{}] mixes parallel-safe and serial nodes and will run serially",
                    b.index,
                    b.nodes.join(", ")
                ),
                node_id: None,
                fix: Some("Mark every node in the batch parallel-safe to run it concurrently".into()),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn lint<S: GraphState>(graph: &GraphBuilder<S>) -> Vec<Diagnostic> {
    let structurally_sound = check_structure(graph).is_ok();

    let mut rules: Vec<Box<dyn LintRule<S>>> = vec![
        Box::new(StartNodeRule),
        Box::new(EndNodeRule),
        Box::new(DependencyExistsRule),
        Box::new(AcyclicRule),
        Box::new(StartHasNoDependenciesRule),
        Box::new(EndIsTerminalRule),
        Box::new(FeedsEndRule),
    ];
    if structurally_sound {
        rules.push(Box::new(MixedParallelBatchRule));
    }

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Fail with the first structural error; otherwise return the advisory
/// diagnostics.
pub fn validate_or_raise<S: GraphState>(
    graph: &GraphBuilder<S>,
) -> Result<Vec<Diagnostic>, StructuralError> {
    check_structure(graph)?;
    Ok(lint(graph))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::StateMap;

    fn builder(nodes: &[(&str, &[&str])]) -> GraphBuilder<StateMap> {
        let mut g = GraphBuilder::new("g");
        for (id, deps) in nodes {
            g.add_node(Node::pass_through(*id).depends_on(deps.iter().copied()))
                .unwrap();
        }
        g
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_graph_passes() {
        let g = builder(&[("start", &[]), ("work", &["start"]), ("end", &["work"])]);
        assert!(check_structure(&g).is_ok());
        let diags = lint(&g);
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
    }

    #[test]
    fn missing_start_node_error() {
        let g = builder(&[("work", &[]), ("end", &["work"])]);
        assert_eq!(
            check_structure(&g),
            Err(StructuralError::MissingStart("start".into()))
        );
        assert!(rules_hit(&lint(&g)).contains(&"start_node"));
    }

    #[test]
    fn missing_end_node_error() {
        let g = builder(&[("start", &[]), ("work", &["start"])]);
        assert_eq!(check_structure(&g), Err(StructuralError::MissingEnd("end".into())));
    }

    #[test]
    fn dangling_dependency_error() {
        let g = builder(&[("start", &[]), ("end", &["start", "ghost"])]);
        assert_eq!(
            check_structure(&g),
            Err(StructuralError::DanglingDependency {
                node: "end".into(),
                dependency: "ghost".into(),
            })
        );
        let diags = lint(&g);
        let dangling: Vec<_> = diags.iter().filter(|d| d.rule == "dependency_exists").collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].severity, Severity::Error);
    }

    #[test]
    fn two_node_cycle_detected() {
        let g = builder(&[
            ("start", &[]),
            ("a", &["start", "b"]),
            ("b", &["a"]),
            ("end", &["b"]),
        ]);
        match check_structure(&g) {
            Err(StructuralError::Cycle { path }) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_detected() {
        let g = builder(&[("start", &[]), ("loop", &["loop"]), ("end", &["start"])]);
        assert_eq!(
            check_structure(&g),
            Err(StructuralError::Cycle {
                path: vec!["loop".into(), "loop".into()]
            })
        );
    }

    #[test]
    fn long_cycle_detected() {
        let g = builder(&[
            ("start", &["e"]),
            ("b", &["start"]),
            ("c", &["b"]),
            ("d", &["c"]),
            ("e", &["d"]),
            ("end", &["e"]),
        ]);
        match check_structure(&g) {
            Err(StructuralError::Cycle { path }) => assert_eq!(path.len(), 6),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn validate_is_repeatable() {
        let g = builder(&[("start", &[]), ("a", &["a"]), ("end", &["start"])]);
        let first = check_structure(&g);
        let second = check_structure(&g);
        assert_eq!(first, second);
        assert!(first.is_err());
    }

    #[test]
    fn start_with_dependencies_warns() {
        let g = builder(&[("pre", &[]), ("start", &["pre"]), ("end", &["start"])]);
        let diags = lint(&g);
        let warn = diags
            .iter()
            .find(|d| d.rule == "start_has_no_dependencies")
            .expect("warning expected");
        assert_eq!(warn.severity, Severity::Warning);
    }

    #[test]
    fn node_after_end_warns() {
        let g = builder(&[("start", &[]), ("end", &["start"]), ("after", &["end"])]);
        let diags = lint(&g);
        let hits = rules_hit(&diags);
        assert!(hits.contains(&"end_is_terminal"));
        assert!(hits.contains(&"feeds_end"));
    }

    #[test]
    fn diagnostics_are_tagged_with_their_rule_name() {
        let g = builder(&[("start", &[]), ("a", &["ghost"]), ("end", &["start", "a"])]);
        let diags = lint(&g);
        let rule = LintRule::<StateMap>::name(&DependencyExistsRule);
        let dangling = diags
            .iter()
            .find(|d| d.rule == rule)
            .expect("dangling dependency reported");
        assert_eq!(dangling.node_id.as_deref(), Some("a"));
        assert_eq!(dangling.severity, Severity::Error);
    }

    #[test]
    fn orphan_node_warns() {
        let g = builder(&[("start", &[]), ("orphan", &["start"]), ("end", &["start"])]);
        let diags = lint(&g);
        let orphan: Vec<_> = diags.iter().filter(|d| d.rule == "feeds_end").collect();
        assert_eq!(orphan.len(), 1);
        assert_eq!(orphan[0].node_id.as_deref(), Some("orphan"));
    }

    #[test]
    fn mixed_parallel_batch_is_info() {
        let mut g = GraphBuilder::<StateMap>::new("g");
        g.add_node(Node::pass_through("start")).unwrap();
        g.add_node(Node::pass_through("b").depends_on(["start"]).parallel()).unwrap();
        g.add_node(Node::pass_through("c").depends_on(["start"])).unwrap();
        g.add_node(Node::pass_through("end").depends_on(["b", "c"])).unwrap();

        let diags = lint(&g);
        let info = diags
            .iter()
            .find(|d| d.rule == "parallel_batch_mixed")
            .expect("info expected");
        assert_eq!(info.severity, Severity::Info);
    }

    #[test]
    fn validate_or_raise_returns_first_structural_error() {
        let g = builder(&[("work", &["ghost"])]);
        assert_eq!(
            validate_or_raise(&g).unwrap_err(),
            StructuralError::MissingStart("start".into())
        );

        let ok = builder(&[("start", &[]), ("end", &["start"])]);
        assert!(validate_or_raise(&ok).unwrap().is_empty());
    }
}
