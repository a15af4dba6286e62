// Worker Registry
// Static catalog of work units, validated once at startup and read-only afterwards

use crate::execution::context::SEED_PRODUCER;
use crate::execution::graph::{find_cycle, GraphError};
use crate::retry::RetryPolicy;
use crate::workers::Worker;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default per-attempt timeout for a worker
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable declaration of a worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSpec {
    /// Unique worker name
    pub name: String,
    /// Human readable purpose
    pub description: String,
    /// Workers whose output this one reads (ordered, no duplicates)
    pub dependencies: Vec<String>,
    /// Context keys this worker may write
    pub outputs: Vec<String>,
    /// Limit for a single attempt
    pub timeout: Duration,
    /// Engine-level retry policy for whole invocations
    pub retry: RetryPolicy,
    /// If true, failure does not force dependents to be skipped
    pub optional: bool,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            dependencies: Vec::new(),
            outputs: Vec::new(),
            timeout: DEFAULT_WORKER_TIMEOUT,
            retry: RetryPolicy::none(),
            optional: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in dependencies {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            let key = key.into();
            if !self.outputs.contains(&key) {
                self.outputs.push(key);
            }
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn declares_output(&self, key: &str) -> bool {
        self.outputs.iter().any(|k| k == key)
    }
}

/// A spec together with its implementation
#[derive(Clone)]
pub struct RegisteredWorker {
    pub spec: WorkerSpec,
    pub worker: Arc<dyn Worker>,
}

impl fmt::Debug for RegisteredWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredWorker")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Catalog of available workers
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one worker. Its dependencies must already be registered.
    pub fn register(&mut self, spec: WorkerSpec, worker: Arc<dyn Worker>) -> Result<(), GraphError> {
        if spec.name.trim().is_empty() {
            return Err(GraphError::invalid_spec(&spec.name, "name must not be empty"));
        }
        if spec.name == SEED_PRODUCER {
            return Err(GraphError::invalid_spec(
                &spec.name,
                format!("'{}' is reserved for seed data", SEED_PRODUCER),
            ));
        }
        if self.workers.contains_key(&spec.name) {
            return Err(GraphError::duplicate_worker(&spec.name));
        }
        if spec.dependencies.iter().any(|dep| *dep == spec.name) {
            return Err(GraphError::cyclic(vec![spec.name.clone(), spec.name.clone()]));
        }
        if let Some(dep) = spec
            .dependencies
            .iter()
            .find(|dep| !self.workers.contains_key(dep.as_str()))
        {
            return Err(GraphError::unknown_dependency(&spec.name, dep));
        }
        for key in &spec.outputs {
            if let Some(owner) = self.workers.values().find(|w| w.spec.declares_output(key)) {
                return Err(GraphError::invalid_spec(
                    &spec.name,
                    format!("output '{}' is already declared by '{}'", key, owner.spec.name),
                ));
            }
        }

        debug!(
            worker = %spec.name,
            dependencies = ?spec.dependencies,
            optional = spec.optional,
            "registered worker"
        );
        self.workers
            .insert(spec.name.clone(), RegisteredWorker { spec, worker });
        Ok(())
    }

    /// Register a batch in any order; entries are deferred until their dependencies exist
    pub fn register_all(
        &mut self,
        entries: Vec<(WorkerSpec, Arc<dyn Worker>)>,
    ) -> Result<(), GraphError> {
        let mut pending: VecDeque<(WorkerSpec, Arc<dyn Worker>)> = VecDeque::new();
        let mut batch_names = BTreeSet::new();
        for (spec, worker) in entries {
            if self.workers.contains_key(&spec.name) || !batch_names.insert(spec.name.clone()) {
                return Err(GraphError::duplicate_worker(&spec.name));
            }
            pending.push_back((spec, worker));
        }

        while !pending.is_empty() {
            let mut progressed = false;
            for _ in 0..pending.len() {
                let Some((spec, worker)) = pending.pop_front() else {
                    break;
                };
                let ready = spec
                    .dependencies
                    .iter()
                    .all(|dep| self.workers.contains_key(dep.as_str()));
                if ready || spec.dependencies.contains(&spec.name) {
                    self.register(spec, worker)?;
                    progressed = true;
                } else {
                    pending.push_back((spec, worker));
                }
            }

            if !progressed {
                return Err(self.explain_unplaceable(&pending));
            }
        }

        Ok(())
    }

    /// Why the deferred entries could never be registered
    fn explain_unplaceable(&self, pending: &VecDeque<(WorkerSpec, Arc<dyn Worker>)>) -> GraphError {
        let pending_names: BTreeSet<&str> = pending.iter().map(|(s, _)| s.name.as_str()).collect();

        for (spec, _) in pending {
            if let Some(dep) = spec.dependencies.iter().find(|dep| {
                !self.workers.contains_key(dep.as_str()) && !pending_names.contains(dep.as_str())
            }) {
                return GraphError::unknown_dependency(&spec.name, dep);
            }
        }

        let graph: BTreeMap<String, Vec<String>> = pending
            .iter()
            .map(|(spec, _)| (spec.name.clone(), spec.dependencies.clone()))
            .collect();
        let cycle = find_cycle(&graph)
            .unwrap_or_else(|| pending_names.iter().map(|s| s.to_string()).collect());
        GraphError::cyclic(cycle)
    }

    /// Transitive closure of `names` over dependencies. Empty selection means every worker.
    pub fn resolve(&self, names: &[String]) -> Result<BTreeSet<String>, GraphError> {
        if names.is_empty() {
            return Ok(self.workers.keys().cloned().collect());
        }

        let mut resolved = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for name in names {
            if !self.workers.contains_key(name.as_str()) {
                return Err(GraphError::unknown_worker(name));
            }
            queue.push_back(name);
        }

        while let Some(name) = queue.pop_front() {
            if !resolved.insert(name.to_string()) {
                continue;
            }
            let entry = self
                .workers
                .get(name)
                .ok_or_else(|| GraphError::unknown_worker(name))?;
            for dep in &entry.spec.dependencies {
                if !resolved.contains(dep) {
                    queue.push_back(dep);
                }
            }
        }

        Ok(resolved)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredWorker> {
        self.workers.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.get(name).map(|w| &w.spec)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers.values().map(|w| &w.spec)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::graph::GraphErrorKind;
    use crate::testing::{CountingWorker, NoopWorker};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo() -> Arc<dyn Worker> {
        Arc::new(NoopWorker)
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerSpec::new("A"), echo()).unwrap();

        let err = registry.register(WorkerSpec::new("A"), echo()).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateWorker);
    }

    #[test]
    fn test_register_requires_known_dependencies() {
        let mut registry = WorkerRegistry::new();
        let err = registry
            .register(WorkerSpec::new("C").depends_on(["A"]), echo())
            .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut registry = WorkerRegistry::new();
        let err = registry
            .register(WorkerSpec::new("E").depends_on(["E"]), echo())
            .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CycleDetected);
        assert_eq!(err.workers[0], "E");
    }

    #[test]
    fn test_output_keys_must_be_unique() {
        let mut registry = WorkerRegistry::new();
        registry
            .register(WorkerSpec::new("A").outputs(["shared"]), echo())
            .unwrap();
        let err = registry
            .register(WorkerSpec::new("B").outputs(["shared"]), echo())
            .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::InvalidSpec);
    }

    #[test]
    fn test_seed_producer_name_is_reserved() {
        let mut registry = WorkerRegistry::new();
        registry.register(WorkerSpec::new("gate"), echo()).unwrap();

        let err = registry
            .register(WorkerSpec::new("input").outputs(["secret"]), echo())
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::InvalidSpec);
        assert!(!registry.contains("input"));

        let err = WorkerRegistry::new()
            .register_all(vec![
                (WorkerSpec::new("input").outputs(["secret"]), echo()),
                (WorkerSpec::new("reader").depends_on(["gate"]), echo()),
            ])
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::InvalidSpec);
    }

    #[test]
    fn test_register_all_defers_until_dependencies_exist() {
        let mut registry = WorkerRegistry::new();
        registry
            .register_all(vec![
                (WorkerSpec::new("C").depends_on(["A", "B"]), echo()),
                (WorkerSpec::new("B").depends_on(["A"]), echo()),
                (WorkerSpec::new("A"), echo()),
            ])
            .unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_register_all_reports_cycle_without_running_anything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = || -> Arc<dyn Worker> { Arc::new(CountingWorker::new(calls.clone())) };

        let mut registry = WorkerRegistry::new();
        let err = registry
            .register_all(vec![
                (WorkerSpec::new("root"), worker()),
                (WorkerSpec::new("X").depends_on(["root", "Z"]), worker()),
                (WorkerSpec::new("Y").depends_on(["X"]), worker()),
                (WorkerSpec::new("Z").depends_on(["Y"]), worker()),
            ])
            .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CycleDetected);
        let members: BTreeSet<_> = err.workers.into_iter().collect();
        assert_eq!(members, set(&["X", "Y", "Z"]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_register_all_reports_missing_dependency() {
        let mut registry = WorkerRegistry::new();
        let err = registry
            .register_all(vec![
                (WorkerSpec::new("B").depends_on(["ghost"]), echo()),
                (WorkerSpec::new("A"), echo()),
            ])
            .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert_eq!(err.workers, vec!["B".to_string(), "ghost".to_string()]);
    }

    #[test]
    fn test_resolve_includes_transitive_dependencies() {
        let mut registry = WorkerRegistry::new();
        registry
            .register_all(vec![
                (WorkerSpec::new("A"), echo()),
                (WorkerSpec::new("B"), echo()),
                (WorkerSpec::new("C").depends_on(["A", "B"]), echo()),
                (WorkerSpec::new("D").depends_on(["C"]), echo()),
                (WorkerSpec::new("unrelated"), echo()),
            ])
            .unwrap();

        assert_eq!(
            registry.resolve(&["C".to_string()]).unwrap(),
            set(&["A", "B", "C"])
        );
        assert_eq!(
            registry.resolve(&["D".to_string()]).unwrap(),
            set(&["A", "B", "C", "D"])
        );
        assert_eq!(registry.resolve(&[]).unwrap().len(), 5);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let registry = WorkerRegistry::new();
        let err = registry.resolve(&["nope".to_string()]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownWorker);
    }

    #[test]
    fn test_spec_builder_dedupes() {
        let spec = WorkerSpec::new("w")
            .depends_on(["a", "b", "a"])
            .outputs(["k", "k"])
            .optional();

        assert_eq!(spec.dependencies, vec!["a", "b"]);
        assert_eq!(spec.outputs, vec!["k"]);
        assert!(spec.optional);
        assert_eq!(spec.timeout, DEFAULT_WORKER_TIMEOUT);
    }
}
