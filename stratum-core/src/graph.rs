//! Dependency graph over a loaded migration set.
//!
//! Nodes are migration ids; an edge X → Y means X depends on Y. The graph
//! is validated once at construction (no dangling edges, no cycles) and
//! immutable afterwards. Every ordering query is deterministic: adjacency
//! lives in B-tree maps and ties are broken by lexicographic id, so a given
//! store produces the same plan on every invocation.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use log::debug;

use crate::migration::MigrationSet;

type Adjacency = BTreeMap<String, BTreeSet<String>>;

/// Errors from graph construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A dependency cycle, listed in edge order; the first id is repeated
    /// at the end. A self-dependency reports as `[a, a]`.
    Cycle(Vec<String>),
    /// An edge points at an id that is not in the set.
    MissingDependency { id: String, dep: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Cycle(path) => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            GraphError::MissingDependency { id, dep } => {
                write!(f, "migration '{}' depends on unknown migration '{}'", id, dep)
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Validated dependency graph with forward and reverse adjacency.
#[derive(Debug)]
pub struct DependencyGraph {
    deps: Adjacency,
    rdeps: Adjacency,
}

impl DependencyGraph {
    /// Build and validate the graph for a migration set.
    pub fn build(migrations: &MigrationSet) -> Result<Self, GraphError> {
        let mut deps: Adjacency = BTreeMap::new();
        let mut rdeps: Adjacency = BTreeMap::new();
        for id in migrations.keys() {
            deps.insert(id.clone(), BTreeSet::new());
            rdeps.insert(id.clone(), BTreeSet::new());
        }
        for (id, migration) in migrations {
            for dep in &migration.depends {
                if !migrations.contains_key(dep) {
                    return Err(GraphError::MissingDependency {
                        id: id.clone(),
                        dep: dep.clone(),
                    });
                }
                deps.entry(id.clone()).or_default().insert(dep.clone());
                rdeps.entry(dep.clone()).or_default().insert(id.clone());
            }
        }

        let graph = Self { deps, rdeps };
        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::Cycle(cycle));
        }
        debug!("dependency graph validated: {} nodes", graph.deps.len());
        Ok(graph)
    }

    /// Whether the named migration is a node of the graph.
    pub fn contains(&self, id: &str) -> bool {
        self.deps.contains_key(id)
    }

    /// Everything the named migration transitively depends on, dependencies
    /// first. Excludes the migration itself.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        self.ordered_subset(self.closure(id, &self.deps))
    }

    /// Everything that transitively depends on the named migration,
    /// most-dependent first: the order a revert must run in. Excludes the
    /// migration itself.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut order = self.ordered_subset(self.closure(id, &self.rdeps));
        order.reverse();
        order
    }

    /// The whole graph, dependencies first.
    pub fn topological_order(&self) -> Vec<String> {
        self.ordered_subset(self.deps.keys().map(String::as_str).collect())
    }

    /// Transitive closure of `id` along `edges`, excluding `id` itself.
    fn closure<'a>(&'a self, id: &str, edges: &'a Adjacency) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut work: Vec<&str> = match edges.get(id) {
            Some(direct) => direct.iter().map(String::as_str).collect(),
            None => Vec::new(),
        };
        while let Some(node) = work.pop() {
            if seen.insert(node) {
                if let Some(next) = edges.get(node) {
                    work.extend(next.iter().map(String::as_str));
                }
            }
        }
        seen
    }

    /// Topologically order a subset of the graph: dependencies first, ties
    /// broken by lexicographic id. Kahn's algorithm with a min-heap yields
    /// the unique smallest such order, which is what makes plans
    /// reproducible across invocations.
    fn ordered_subset(&self, subset: BTreeSet<&str>) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for node in &subset {
            let within = self.deps[*node]
                .iter()
                .filter(|dep| subset.contains(dep.as_str()))
                .count();
            indegree.insert(*node, within);
        }

        let mut ready: BinaryHeap<Reverse<&str>> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| Reverse(*node))
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node.to_string());
            for dependent in &self.rdeps[node] {
                if let Some(degree) = indegree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(dependent.as_str()));
                    }
                }
            }
        }
        order
    }

    /// Iterative three-color DFS. Returns the first cycle found, as a path
    /// beginning and ending at the same node. An explicit stack keeps deep
    /// stores from overflowing the call stack.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Open,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = self
            .deps
            .keys()
            .map(|id| (id.as_str(), Mark::New))
            .collect();

        for start in self.deps.keys() {
            if marks[start.as_str()] != Mark::New {
                continue;
            }
            let mut stack = vec![(start.as_str(), self.deps[start.as_str()].iter())];
            let mut path = vec![start.as_str()];
            marks.insert(start.as_str(), Mark::Open);

            loop {
                let next = match stack.last_mut() {
                    Some((_, neighbors)) => neighbors.next(),
                    None => break,
                };
                match next {
                    Some(next) => {
                        let next = next.as_str();
                        match marks[next] {
                            Mark::Open => {
                                let from = path.iter().position(|n| *n == next).unwrap_or(0);
                                let mut cycle: Vec<String> =
                                    path[from..].iter().map(|n| n.to_string()).collect();
                                cycle.push(next.to_string());
                                return Some(cycle);
                            }
                            Mark::New => {
                                marks.insert(next, Mark::Open);
                                stack.push((next, self.deps[next].iter()));
                                path.push(next);
                            }
                            Mark::Done => {}
                        }
                    }
                    None => {
                        if let Some((node, _)) = stack.pop() {
                            marks.insert(node, Mark::Done);
                            path.pop();
                        }
                    }
                }
            }
        }
        None
    }
}
