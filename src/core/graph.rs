use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::engine;
use super::error::GraphError;
use super::formulas::{self, Dep, Quantity, Scope};
use super::kpi;
use super::rules::{BusinessRules, RuleField};
use super::types::{InputField, Inputs};

pub const BUSINESS_RULES_CATEGORY: &str = "business_rules";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Input,
    Derived,
    Calculation,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub category: String,
    pub formula: Option<String>,
    pub current_value: Option<f64>,
    /// Ids whose previous-month value this node reads. Not edges.
    pub carried: Vec<String>,
}

impl GraphNode {
    pub fn carries_state(&self) -> bool {
        !self.carried.is_empty()
    }
}

/// `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Toward dependencies.
    Upstream,
    /// Toward dependents.
    Downstream,
}

impl FromStr for Direction {
    type Err = GraphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            other => Err(GraphError::UnknownDirection(other.to_string())),
        }
    }
}

impl DependencyGraph {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// First occurrence wins when ids are duplicated.
    fn index(&self) -> HashMap<&str, usize> {
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            index.entry(node.id.as_str()).or_insert(i);
        }
        index
    }

    /// Dangling edges are skipped.
    fn adjacency(&self, index: &HashMap<&str, usize>, direction: Direction) -> Vec<Vec<usize>> {
        let mut adjacency = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            let (Some(&source), Some(&target)) =
                (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
            else {
                continue;
            };
            match direction {
                Direction::Downstream => adjacency[source].push(target),
                Direction::Upstream => adjacency[target].push(source),
            }
        }
        adjacency
    }
}

/// Builds the graph of every input, business rule and formula quantity.
/// Edges come from tracing each formula's reads; node values come from a
/// projection run over `inputs`.
pub fn build_graph(inputs: &Inputs, rules: &BusinessRules) -> DependencyGraph {
    let run = engine::run_months(inputs, rules);
    let summary = kpi::evaluate_summary(&run, inputs, rules);

    let mut nodes = Vec::with_capacity(InputField::ALL.len() + RuleField::ALL.len() + Quantity::COUNT);
    let mut edges = Vec::new();

    for &field in InputField::ALL {
        nodes.push(GraphNode {
            id: field.key().to_string(),
            label: field.label().to_string(),
            kind: NodeKind::Input,
            category: field.group().key().to_string(),
            formula: None,
            current_value: Some(inputs.value(field)),
            carried: Vec::new(),
        });
    }

    for rule in RuleField::ALL {
        nodes.push(GraphNode {
            id: rule.key().to_string(),
            label: rule.label().to_string(),
            kind: NodeKind::Input,
            category: BUSINESS_RULES_CATEGORY.to_string(),
            formula: None,
            current_value: Some(rules.value(rule)),
            carried: Vec::new(),
        });
    }

    for &q in Quantity::ALL {
        let definition = q.definition();
        let mut carried = Vec::new();
        for dep in formulas::trace_dependencies(q) {
            let label = match dep {
                Dep::Carry(source) => {
                    carried.push(source.id().to_string());
                    continue;
                }
                Dep::Input(_) => "input",
                Dep::Rule(_) => "business rule",
                Dep::Node(_) => "formula",
            };
            edges.push(GraphEdge {
                source: dep.id().to_string(),
                target: definition.id.to_string(),
                label: label.to_string(),
            });
        }

        let current_value = match definition.scope {
            Scope::Static => run.statics.get_opt(q),
            Scope::Monthly => run.final_month.get_opt(q),
            Scope::Summary => summary.get_opt(q),
        };

        nodes.push(GraphNode {
            id: definition.id.to_string(),
            label: definition.label.to_string(),
            kind: definition.kind,
            category: definition.category.to_string(),
            formula: Some(definition.text.to_string()),
            current_value,
            carried,
        });
    }

    DependencyGraph::new(nodes, edges)
}

/// Everything `id` depends on, transitively.
pub fn upstream(graph: &DependencyGraph, id: &str) -> Result<BTreeSet<String>, GraphError> {
    traverse(graph, id, Direction::Upstream)
}

/// Everything affected by `id`, transitively.
pub fn downstream(graph: &DependencyGraph, id: &str) -> Result<BTreeSet<String>, GraphError> {
    traverse(graph, id, Direction::Downstream)
}

pub fn traverse(
    graph: &DependencyGraph,
    id: &str,
    direction: Direction,
) -> Result<BTreeSet<String>, GraphError> {
    let index = graph.index();
    let start = *index
        .get(id)
        .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
    let adjacency = graph.adjacency(&index, direction);

    let mut visited = vec![false; graph.nodes.len()];
    let mut on_path = vec![false; graph.nodes.len()];
    walk(graph, &adjacency, start, &mut visited, &mut on_path);

    Ok(visited
        .iter()
        .enumerate()
        .filter(|&(i, &seen)| seen && i != start)
        .map(|(i, _)| graph.nodes[i].id.clone())
        .collect())
}

fn walk(
    graph: &DependencyGraph,
    adjacency: &[Vec<usize>],
    node: usize,
    visited: &mut [bool],
    on_path: &mut [bool],
) {
    visited[node] = true;
    on_path[node] = true;
    for &next in &adjacency[node] {
        if on_path[next] {
            log::warn!(
                "dependency cycle: '{}' leads back to '{}'",
                graph.nodes[node].id,
                graph.nodes[next].id
            );
            continue;
        }
        if !visited[next] {
            walk(graph, adjacency, next, visited, on_path);
        }
    }
    on_path[node] = false;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GraphIssue {
    DuplicateId {
        id: String,
    },
    DanglingEdge {
        source: String,
        target: String,
    },
    Cycle {
        path: Vec<String>,
    },
    UnknownIdentifier {
        node: String,
        identifier: String,
    },
    /// Formula text and the edges computed for the node disagree.
    FormulaDrift {
        node: String,
        documented_only: Vec<String>,
        computed_only: Vec<String>,
    },
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::DuplicateId { id } => write!(f, "duplicate node id '{id}'"),
            GraphIssue::DanglingEdge { source, target } => {
                write!(f, "edge '{source}' -> '{target}' references a missing node")
            }
            GraphIssue::Cycle { path } => write!(f, "cycle: {}", path.join(" -> ")),
            GraphIssue::UnknownIdentifier { node, identifier } => {
                write!(f, "formula of '{node}' names unknown node '{identifier}'")
            }
            GraphIssue::FormulaDrift {
                node,
                documented_only,
                computed_only,
            } => write!(
                f,
                "formula of '{node}' drifts from its computation (documented only: [{}], computed only: [{}])",
                documented_only.join(", "),
                computed_only.join(", ")
            ),
        }
    }
}

/// Integrity pass over a built graph. Issues are returned and logged, never raised.
pub fn validate_graph(graph: &DependencyGraph) -> Vec<GraphIssue> {
    let mut issues = Vec::new();
    let index = graph.index();

    let mut seen = BTreeSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(GraphIssue::DuplicateId {
                id: node.id.clone(),
            });
        }
    }

    for edge in &graph.edges {
        if !index.contains_key(edge.source.as_str()) || !index.contains_key(edge.target.as_str()) {
            issues.push(GraphIssue::DanglingEdge {
                source: edge.source.clone(),
                target: edge.target.clone(),
            });
        }
    }

    for path in find_cycles(graph, &index) {
        issues.push(GraphIssue::Cycle { path });
    }

    let mut computed: HashMap<&str, BTreeSet<String>> = HashMap::new();
    for edge in &graph.edges {
        computed
            .entry(edge.target.as_str())
            .or_default()
            .insert(edge.source.clone());
    }

    for node in &graph.nodes {
        let Some(text) = &node.formula else {
            continue;
        };
        let documented = formulas::formula_identifiers(text);
        for identifier in &documented {
            if !index.contains_key(identifier.as_str()) {
                issues.push(GraphIssue::UnknownIdentifier {
                    node: node.id.clone(),
                    identifier: identifier.clone(),
                });
            }
        }

        let mut reads = computed.get(node.id.as_str()).cloned().unwrap_or_default();
        reads.extend(node.carried.iter().cloned());
        let documented_only: Vec<String> = documented.difference(&reads).cloned().collect();
        let computed_only: Vec<String> = reads.difference(&documented).cloned().collect();
        if !documented_only.is_empty() || !computed_only.is_empty() {
            issues.push(GraphIssue::FormulaDrift {
                node: node.id.clone(),
                documented_only,
                computed_only,
            });
        }
    }

    for issue in &issues {
        log::warn!("graph integrity: {issue}");
    }
    issues
}

#[derive(Copy, Clone, PartialEq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// Each back edge found by a DFS in node order yields one cycle path,
/// starting and ending at the same node.
fn find_cycles(graph: &DependencyGraph, index: &HashMap<&str, usize>) -> Vec<Vec<String>> {
    fn visit(
        node: usize,
        adjacency: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<usize>>,
    ) {
        marks[node] = Mark::Active;
        stack.push(node);
        for &next in &adjacency[node] {
            match marks[next] {
                Mark::Unvisited => visit(next, adjacency, marks, stack, cycles),
                Mark::Active => {
                    if let Some(from) = stack.iter().position(|&n| n == next) {
                        let mut cycle = stack[from..].to_vec();
                        cycle.push(next);
                        cycles.push(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
    }

    let adjacency = graph.adjacency(index, Direction::Downstream);
    let mut marks = vec![Mark::Unvisited; graph.nodes.len()];
    let mut stack = Vec::new();
    let mut cycles = Vec::new();
    for start in 0..graph.nodes.len() {
        if marks[start] == Mark::Unvisited {
            visit(start, &adjacency, &mut marks, &mut stack, &mut cycles);
        }
    }

    cycles
        .into_iter()
        .map(|cycle| cycle.into_iter().map(|i| graph.nodes[i].id.clone()).collect())
        .collect()
}
