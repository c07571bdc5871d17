//! Task graph construction
//!
//! The task graph crosses the package dependency graph with the
//! pipeline: vertices are `package#task` ids, edges mean "must
//! complete before". Pipeline resolution prefers a package-scoped
//! override (`web#build`) over the bare entry (`build`).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;

use thiserror::Error;
use tracing::{debug, instrument};

use relay_core::config::{TaskConfig, TASK_DELIMITER};
use relay_core::workspace::PackageGraph;

use crate::task::{TaskDefinition, TaskId};

/// Name of the synthetic root vertex in rendered output.
pub const ROOT_TASK_NAME: &str = "___ROOT___";

/// Errors during task graph construction.
#[derive(Debug, Error)]
pub enum TaskGraphError {
    /// A dependency names a task with no pipeline entry
    #[error("task `{0}` has no entry in the relay.json pipeline")]
    MissingTask(String),

    /// The constructed graph contains a cycle
    #[error("invalid task dependency graph: cycle detected: {0}")]
    CyclicDependency(String),
}

/// A vertex in the task graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub definition: TaskDefinition,
    /// Tasks that must complete before this one
    pub dependencies: BTreeSet<TaskId>,
    /// Tasks waiting on this one
    pub dependents: BTreeSet<TaskId>,
}

/// Acyclic directed graph of tasks to execute. The synthetic root is
/// implicit: every vertex without dependencies is a traversal source.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: BTreeMap<TaskId, TaskNode>,
}

impl TaskGraph {
    /// Build the task graph for the requested targets across the
    /// packages in scope.
    ///
    /// With `only_mode`, dependency expansion is suppressed: edges are
    /// kept only between tasks that are themselves scheduled targets,
    /// and nothing new is scheduled on behalf of a dependency — those
    /// are expected to have been built already.
    #[instrument(skip_all, fields(packages = packages.len(), targets = targets.len(), only_mode))]
    pub fn build(
        package_graph: &PackageGraph,
        pipeline: &BTreeMap<String, TaskConfig>,
        packages: &[String],
        targets: &[String],
        only_mode: bool,
    ) -> Result<Self, TaskGraphError> {
        let resolve = |package: &str, task: &str| -> Option<&TaskConfig> {
            pipeline
                .get(&format!("{package}{TASK_DELIMITER}{task}"))
                .or_else(|| pipeline.get(task))
        };

        let mut nodes: BTreeMap<TaskId, TaskNode> = BTreeMap::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        let mut target_ids: BTreeSet<TaskId> = BTreeSet::new();

        for package in packages {
            for task in targets {
                if resolve(package, task).is_some() {
                    let id = TaskId::new(package, task);
                    target_ids.insert(id.clone());
                    queue.push_back(id);
                }
            }
        }

        while let Some(id) = queue.pop_front() {
            if nodes.contains_key(&id) {
                continue;
            }
            let config = resolve(&id.package, &id.task)
                .ok_or_else(|| TaskGraphError::MissingTask(id.to_string()))?;
            let definition = TaskDefinition::from_config(config);

            let mut dependencies = BTreeSet::new();
            for dep in &definition.task_dependencies {
                let dep_id = match TaskId::parse(dep) {
                    Some(scoped) => scoped,
                    None => TaskId::new(&id.package, dep),
                };
                if only_mode {
                    if target_ids.contains(&dep_id) {
                        dependencies.insert(dep_id);
                    }
                    continue;
                }
                dependencies.insert(dep_id.clone());
                queue.push_back(dep_id);
            }
            for dep_task in &definition.topological_dependencies {
                for dep_package in package_graph.dependencies(&id.package) {
                    if resolve(&dep_package, dep_task).is_none() {
                        continue;
                    }
                    let dep_id = TaskId::new(&dep_package, dep_task);
                    if only_mode {
                        if target_ids.contains(&dep_id) {
                            dependencies.insert(dep_id);
                        }
                        continue;
                    }
                    dependencies.insert(dep_id.clone());
                    queue.push_back(dep_id);
                }
            }

            nodes.insert(
                id.clone(),
                TaskNode {
                    id,
                    definition,
                    dependencies,
                    dependents: BTreeSet::new(),
                },
            );
        }

        // Reverse edges
        let edges: Vec<(TaskId, TaskId)> = nodes
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(|dep| (dep.clone(), node.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(dep_node) = nodes.get_mut(&dep) {
                dep_node.dependents.insert(dependent);
            }
        }

        let graph = Self { nodes };
        graph.check_acyclic()?;
        debug!(tasks = graph.len(), "task graph built");
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// All task ids in sorted order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.nodes.keys().cloned().collect()
    }

    /// Direct predecessors of a task.
    pub fn dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.nodes
            .get(id)
            .map(|node| node.dependencies.clone())
            .unwrap_or_default()
    }

    /// Direct successors of a task.
    pub fn dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.nodes
            .get(id)
            .map(|node| node.dependents.clone())
            .unwrap_or_default()
    }

    /// Every task reachable through dependency edges.
    pub fn transitive_dependencies(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reach(id, |node| &node.dependencies)
    }

    /// Every task reachable through dependent edges.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        self.reach(id, |node| &node.dependents)
    }

    fn reach(
        &self,
        id: &TaskId,
        edges: impl Fn(&TaskNode) -> &BTreeSet<TaskId>,
    ) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        queue.push_back(id.clone());
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                for next in edges(node) {
                    if seen.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// A copy of this graph with every edge removed, used by parallel
    /// mode where package ordering is intentionally ignored.
    pub fn without_edges(&self) -> Self {
        let nodes = self
            .nodes
            .iter()
            .map(|(id, node)| {
                (
                    id.clone(),
                    TaskNode {
                        id: node.id.clone(),
                        definition: node.definition.clone(),
                        dependencies: BTreeSet::new(),
                        dependents: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    /// Render the graph in DOT form, with the synthetic root vertex
    /// connected to every source so the drawing has a single entry.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph tasks {\n");
        for node in self.nodes.values() {
            if node.dependencies.is_empty() {
                let _ = writeln!(out, "  \"{}\" -> \"{}\"", ROOT_TASK_NAME, node.id);
            }
            for dep in &node.dependencies {
                let _ = writeln!(out, "  \"{}\" -> \"{}\"", dep, node.id);
            }
        }
        out.push_str("}\n");
        out
    }

    /// Depth-first cycle check with color marks, reporting one cycle
    /// in dependency order.
    fn check_acyclic(&self) -> Result<(), TaskGraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &TaskGraph,
            id: &TaskId,
            colors: &mut HashMap<TaskId, Color>,
            stack: &mut Vec<TaskId>,
        ) -> Option<Vec<TaskId>> {
            colors.insert(id.clone(), Color::Gray);
            stack.push(id.clone());
            if let Some(node) = graph.nodes.get(id) {
                for dep in &node.dependencies {
                    if !graph.nodes.contains_key(dep) {
                        continue;
                    }
                    match colors.get(dep).copied().unwrap_or(Color::White) {
                        Color::White => {
                            if let Some(cycle) = visit(graph, dep, colors, stack) {
                                return Some(cycle);
                            }
                        }
                        Color::Gray => {
                            let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                            let mut cycle: Vec<TaskId> = stack[start..].to_vec();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }
            stack.pop();
            colors.insert(id.clone(), Color::Black);
            None
        }

        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        for id in self.nodes.keys() {
            if colors.get(id).copied().unwrap_or(Color::White) == Color::White {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, id, &mut colors, &mut stack) {
                    let rendered: Vec<String> =
                        cycle.iter().map(|id| id.to_string()).collect();
                    return Err(TaskGraphError::CyclicDependency(rendered.join(" -> ")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::paths::AbsolutePath;
    use relay_core::workspace::{PackageGraph, PackageInfo};

    fn package(name: &str, deps: &[&str]) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            dir: AbsolutePath::new_unchecked(format!("/ws/packages/{name}")),
            scripts: std::collections::BTreeMap::new(),
            workspace_dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn package_graph() -> PackageGraph {
        PackageGraph::build(
            AbsolutePath::new_unchecked("/ws"),
            vec![
                package("app", &["ui", "core"]),
                package("ui", &["core"]),
                package("core", &[]),
            ],
        )
        .unwrap()
    }

    fn pipeline(entries: &[(&str, &[&str])]) -> BTreeMap<String, TaskConfig> {
        entries
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    TaskConfig {
                        depends_on: deps.iter().map(|d| d.to_string()).collect(),
                        ..TaskConfig::default()
                    },
                )
            })
            .collect()
    }

    fn all_packages() -> Vec<String> {
        vec!["app".to_string(), "core".to_string(), "ui".to_string()]
    }

    #[test]
    fn test_topological_dependencies_follow_package_edges() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("build", &["^build"])]),
            &all_packages(),
            &["build".to_string()],
            false,
        )
        .unwrap();

        assert_eq!(graph.len(), 3);
        let app_deps = graph.dependencies(&TaskId::new("app", "build"));
        assert!(app_deps.contains(&TaskId::new("ui", "build")));
        assert!(app_deps.contains(&TaskId::new("core", "build")));
        assert!(graph
            .dependencies(&TaskId::new("core", "build"))
            .is_empty());
    }

    #[test]
    fn test_same_package_dependency() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("test", &["build"]), ("build", &[])]),
            &all_packages(),
            &["test".to_string()],
            false,
        )
        .unwrap();

        // Each package's test depends on its own build, which was
        // scheduled even though only `test` was requested.
        assert_eq!(graph.len(), 6);
        assert!(graph
            .dependencies(&TaskId::new("ui", "test"))
            .contains(&TaskId::new("ui", "build")));
    }

    #[test]
    fn test_package_scoped_dependency() {
        let mut entries = pipeline(&[("deploy", &[]), ("build", &[])]);
        entries.get_mut("deploy").unwrap().depends_on = vec!["app#build".to_string()];

        let graph = TaskGraph::build(
            &package_graph(),
            &entries,
            &["core".to_string()],
            &["deploy".to_string()],
            false,
        )
        .unwrap();

        assert!(graph
            .dependencies(&TaskId::new("core", "deploy"))
            .contains(&TaskId::new("app", "build")));
        assert!(graph.node(&TaskId::new("app", "build")).is_some());
    }

    #[test]
    fn test_package_scoped_override_wins() {
        let mut entries = pipeline(&[("build", &["^build"])]);
        entries.insert(
            "app#build".to_string(),
            TaskConfig {
                depends_on: vec![],
                outputs: vec![".next/**".to_string()],
                ..TaskConfig::default()
            },
        );

        let graph = TaskGraph::build(
            &package_graph(),
            &entries,
            &all_packages(),
            &["build".to_string()],
            false,
        )
        .unwrap();

        // The override has no dependencies, so app#build is a source.
        assert!(graph.dependencies(&TaskId::new("app", "build")).is_empty());
        assert_eq!(
            graph
                .node(&TaskId::new("app", "build"))
                .unwrap()
                .definition
                .outputs,
            vec![".next/**"]
        );
        // Non-overridden packages keep the bare entry's behavior.
        assert!(!graph.dependencies(&TaskId::new("ui", "build")).is_empty());
    }

    #[test]
    fn test_missing_dependency_task_is_an_error() {
        let result = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("test", &["compile"])]),
            &all_packages(),
            &["test".to_string()],
            false,
        );
        match result {
            Err(TaskGraphError::MissingTask(name)) => assert!(name.contains("compile")),
            other => panic!("expected MissingTask, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_is_rejected_with_diagnostic() {
        let result = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("a", &["b"]), ("b", &["a"])]),
            &["core".to_string()],
            &["a".to_string()],
            false,
        );
        match result {
            Err(TaskGraphError::CyclicDependency(cycle)) => {
                assert!(cycle.contains("core#a"));
                assert!(cycle.contains("core#b"));
                assert!(cycle.contains(" -> "));
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_only_mode_suppresses_dependency_scheduling() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("test", &["build"]), ("build", &["^build"])]),
            &all_packages(),
            &["test".to_string()],
            true,
        )
        .unwrap();

        // Only the requested targets are scheduled; build was not
        // pulled in on behalf of test.
        assert_eq!(graph.len(), 3);
        assert!(graph.node(&TaskId::new("ui", "build")).is_none());
        assert!(graph.dependencies(&TaskId::new("ui", "test")).is_empty());
    }

    #[test]
    fn test_only_mode_keeps_edges_between_targets() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("test", &["build"]), ("build", &[])]),
            &all_packages(),
            &["build".to_string(), "test".to_string()],
            true,
        )
        .unwrap();

        assert_eq!(graph.len(), 6);
        assert!(graph
            .dependencies(&TaskId::new("ui", "test"))
            .contains(&TaskId::new("ui", "build")));
    }

    #[test]
    fn test_without_edges_strips_everything() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("build", &["^build"])]),
            &all_packages(),
            &["build".to_string()],
            false,
        )
        .unwrap();

        let stripped = graph.without_edges();
        assert_eq!(stripped.len(), graph.len());
        for id in stripped.task_ids() {
            assert!(stripped.dependencies(&id).is_empty());
            assert!(stripped.dependents(&id).is_empty());
        }
    }

    #[test]
    fn test_transitive_reachability() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("build", &["^build"])]),
            &all_packages(),
            &["build".to_string()],
            false,
        )
        .unwrap();

        let deps = graph.transitive_dependencies(&TaskId::new("app", "build"));
        assert_eq!(deps.len(), 2);
        let dependents = graph.transitive_dependents(&TaskId::new("core", "build"));
        assert_eq!(dependents.len(), 2);
    }

    #[test]
    fn test_to_dot_names_root() {
        let graph = TaskGraph::build(
            &package_graph(),
            &pipeline(&[("build", &["^build"])]),
            &all_packages(),
            &["build".to_string()],
            false,
        )
        .unwrap();

        let dot = graph.to_dot();
        assert!(dot.contains(ROOT_TASK_NAME));
        assert!(dot.contains("\"core#build\" -> \"ui#build\""));
    }
}
