//! Step dependency graph builder and cycle detection.
//!
//! Uses `petgraph` to model `dependsOn` relations between sibling steps. An
//! edge `A -> B` means B lists A as a dependency. Node indices follow
//! definition order, so index `i` in the graph is step `i` of the input slice.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use wfrun_types::workflow::{WorkflowStep, WorkflowStepBase};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems in a sibling step list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
}

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// Anything with a name and a dependency list can be placed in a graph.
pub trait StepNode {
    fn node_name(&self) -> &str;
    fn node_depends_on(&self) -> &[String];
}

impl StepNode for WorkflowStepBase {
    fn node_name(&self) -> &str {
        &self.name
    }

    fn node_depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl StepNode for WorkflowStep {
    fn node_name(&self) -> &str {
        &self.base.name
    }

    fn node_depends_on(&self) -> &[String] {
        &self.base.depends_on
    }
}

// ---------------------------------------------------------------------------
// StepGraph
// ---------------------------------------------------------------------------

/// Validated, acyclic dependency graph over one level of sibling steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Definition index of the named step.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|idx| idx.index())
    }

    pub fn name(&self, i: usize) -> &str {
        &self.graph[NodeIndex::new(i)]
    }

    /// Direct dependencies of step `i`, ascending.
    pub fn dependencies(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Incoming)
    }

    /// Steps that list step `i` as a dependency, ascending.
    pub fn dependents(&self, i: usize) -> Vec<usize> {
        self.neighbors(i, Direction::Outgoing)
    }

    /// Steps with no dependencies, eligible immediately in DAG mode.
    pub fn roots(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.dependencies(i).is_empty())
            .collect()
    }

    /// A dependency-respecting order of all steps.
    pub fn topological_order(&self) -> Vec<usize> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| n.index()).collect())
            .unwrap_or_default()
    }

    fn neighbors(&self, i: usize, direction: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(i), direction)
            .map(|n| n.index())
            .collect();
        out.sort_unstable();
        out
    }
}

/// Build the dependency graph of a sibling list.
///
/// Rejects duplicate names, dependencies on steps outside the list, and
/// cycles (reported with the full cycle path).
pub fn build_step_graph<S: StepNode>(steps: &[S]) -> Result<StepGraph, GraphError> {
    let mut graph = DiGraph::<String, ()>::new();
    let mut index = HashMap::with_capacity(steps.len());

    for step in steps {
        let name = step.node_name();
        if index.contains_key(name) {
            return Err(GraphError::DuplicateStep(name.to_string()));
        }
        let node = graph.add_node(name.to_string());
        index.insert(name.to_string(), node);
    }

    for step in steps {
        let to = index[step.node_name()];
        for dep in step.node_depends_on() {
            let from = index
                .get(dep.as_str())
                .ok_or_else(|| GraphError::UnknownDependency {
                    step: step.node_name().to_string(),
                    dependency: dep.clone(),
                })?;
            graph.update_edge(*from, to, ());
        }
    }

    if let Some(path) = find_cycle(&graph) {
        return Err(GraphError::CyclicDependency { path });
    }

    Ok(StepGraph { graph, index })
}

/// Validate the top-level list and every group's sub-step list.
pub fn validate_workflow(steps: &[WorkflowStep]) -> Result<(), GraphError> {
    build_step_graph(steps)?;
    for step in steps {
        build_step_graph(&step.sub_steps)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search with three-colour marking. Returns the first cycle
/// found as a path that starts and ends on the same step.
fn find_cycle(graph: &DiGraph<String, ()>) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut path = Vec::new();

    for start in graph.node_indices() {
        if marks[start.index()] == Mark::Unvisited {
            if let Some(cycle) = visit(graph, start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    graph: &DiGraph<String, ()>,
    node: NodeIndex,
    marks: &mut [Mark],
    path: &mut Vec<NodeIndex>,
) -> Option<Vec<String>> {
    marks[node.index()] = Mark::InProgress;
    path.push(node);

    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort_unstable();

    for succ in next {
        match marks[succ.index()] {
            Mark::InProgress => {
                let start = path.iter().position(|n| *n == succ).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|n| graph[*n].clone()).collect();
                cycle.push(graph[succ].clone());
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(graph, succ, marks, path) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }

    path.pop();
    marks[node.index()] = Mark::Done;
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
