// Execution Plan (DAG) Builder
// Expands a worker selection to its dependency closure and layers it for execution

use crate::registry::{WorkerRegistry, WorkerSpec};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

/// Error type for registration and planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Workers the error is about (cycle members, the unknown name, ...)
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CycleDetected,
    /// A spec references a worker that is not registered
    UnknownDependency,
    /// A run requested a worker that is not registered
    UnknownWorker,
    /// Two specs share a name
    DuplicateWorker,
    /// Malformed spec (empty name, output key clash, ...)
    InvalidSpec,
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GraphErrorKind::CycleDetected => "CycleDetectedError",
            GraphErrorKind::UnknownDependency => "UnknownDependencyError",
            GraphErrorKind::UnknownWorker => "UnknownWorkerError",
            GraphErrorKind::DuplicateWorker => "DuplicateWorkerError",
            GraphErrorKind::InvalidSpec => "InvalidSpecError",
        };
        f.write_str(label)
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(workers: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", workers.join(" -> ")),
            kind: GraphErrorKind::CycleDetected,
            workers,
        }
    }

    pub fn unknown_dependency(worker: &str, dependency: &str) -> Self {
        Self {
            message: format!(
                "worker '{}' depends on unknown worker '{}'",
                worker, dependency
            ),
            kind: GraphErrorKind::UnknownDependency,
            workers: vec![worker.to_string(), dependency.to_string()],
        }
    }

    pub fn unknown_worker(name: &str) -> Self {
        Self {
            message: format!("worker '{}' is not registered", name),
            kind: GraphErrorKind::UnknownWorker,
            workers: vec![name.to_string()],
        }
    }

    pub fn duplicate_worker(name: &str) -> Self {
        Self {
            message: format!("worker '{}' is already registered", name),
            kind: GraphErrorKind::DuplicateWorker,
            workers: vec![name.to_string()],
        }
    }

    pub fn invalid_spec(name: &str, reason: impl Into<String>) -> Self {
        Self {
            message: format!("worker '{}': {}", name, reason.into()),
            kind: GraphErrorKind::InvalidSpec,
            workers: vec![name.to_string()],
        }
    }
}

/// Layered execution order for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Workers grouped so each layer depends only on earlier layers; names sorted within a layer
    layers: Vec<Vec<String>>,
    /// Names the caller asked for (every planned worker when the selection was empty)
    requested: BTreeSet<String>,
}

impl ExecutionPlan {
    /// Resolve `requested` against the registry and layer the result.
    /// An empty selection means every registered worker.
    pub fn build(registry: &WorkerRegistry, requested: &[String]) -> Result<Self, GraphError> {
        let workers = registry.resolve(requested)?;
        let specs = workers.iter().filter_map(|name| registry.spec(name));
        let layers = build_layers(specs)?;

        let requested = if requested.is_empty() {
            workers
        } else {
            requested.iter().cloned().collect()
        };

        Ok(Self { layers, requested })
    }

    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    pub fn requested(&self) -> &BTreeSet<String> {
        &self.requested
    }

    /// Every planned worker in execution order
    pub fn workers(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().flatten().map(String::as_str)
    }

    pub fn worker_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }
}

/// Partition a closed set of specs into layers (Kahn's algorithm applied level by level).
///
/// Fails before anything runs if a dependency lies outside the set or a cycle exists.
pub fn build_layers<'a, I>(specs: I) -> Result<Vec<Vec<String>>, GraphError>
where
    I: IntoIterator<Item = &'a WorkerSpec>,
{
    let mut remaining: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for spec in specs {
        remaining.insert(spec.name.clone(), spec.dependencies.clone());
    }

    for (name, deps) in &remaining {
        for dep in deps {
            if !remaining.contains_key(dep) {
                return Err(GraphError::unknown_dependency(name, dep));
            }
        }
    }

    let mut placed: HashSet<String> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let layer: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| placed.contains(dep)))
            .map(|(name, _)| name.clone())
            .collect();

        if layer.is_empty() {
            let cycle = find_cycle(&remaining)
                .unwrap_or_else(|| remaining.keys().cloned().collect());
            return Err(GraphError::cyclic(cycle));
        }

        for name in &layer {
            remaining.remove(name);
            placed.insert(name.clone());
        }
        layers.push(layer);
    }

    Ok(layers)
}

/// Find one dependency cycle using DFS; returns it closed (first name repeated last)
pub(crate) fn find_cycle(graph: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut stack = Vec::new();

    for name in graph.keys() {
        if !visited.contains(name.as_str()) {
            if let Some(cycle) = dfs_cycle(graph, name, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle(
    graph: &BTreeMap<String, Vec<String>>,
    name: &str,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(name.to_string());
    stack.push(name.to_string());

    if let Some(deps) = graph.get(name) {
        for dep in deps {
            if let Some(pos) = stack.iter().position(|n| n == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) && graph.contains_key(dep) {
                if let Some(cycle) = dfs_cycle(graph, dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    None
}
