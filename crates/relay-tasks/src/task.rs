//! Task identifiers and definitions

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use relay_core::config::{OutputMode, TaskConfig, TASK_DELIMITER, TOPOLOGICAL_PREFIX};

/// Unique identifier for a task within the workspace, rendered as
/// `package#task`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Package name
    pub package: String,
    /// Task name (e.g. "build", "test", "lint")
    pub task: String,
}

impl TaskId {
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse a `package#task` string.
    pub fn parse(s: &str) -> Option<Self> {
        let (package, task) = s.split_once(TASK_DELIMITER)?;
        if package.is_empty() || task.is_empty() {
            return None;
        }
        Some(Self::new(package, task))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.package, TASK_DELIMITER, self.task)
    }
}

/// A resolved pipeline entry: the `dependsOn` list split into task and
/// topological dependencies, plus output and caching policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    /// Dependencies on other tasks, bare (`build`) or package-scoped
    /// (`web#build`)
    pub task_dependencies: Vec<String>,
    /// Dependencies on the same task in each direct upstream package
    pub topological_dependencies: Vec<String>,
    /// Output globs relative to the package directory
    pub outputs: Vec<String>,
    /// Environment variable names feeding the fingerprint
    pub env: Vec<String>,
    /// Whether outputs are cached at all
    pub cache: bool,
    /// How logs are surfaced and replayed
    pub output_mode: OutputMode,
}

impl TaskDefinition {
    /// Resolve a pipeline config entry, splitting `^`-prefixed entries
    /// out of `dependsOn`.
    pub fn from_config(config: &TaskConfig) -> Self {
        let mut task_dependencies = Vec::new();
        let mut topological_dependencies = Vec::new();
        for dep in &config.depends_on {
            match dep.strip_prefix(TOPOLOGICAL_PREFIX) {
                Some(topo) => topological_dependencies.push(topo.to_string()),
                None => task_dependencies.push(dep.clone()),
            }
        }
        task_dependencies.sort();
        topological_dependencies.sort();

        let mut outputs = config.outputs.clone();
        outputs.sort();
        let mut env = config.env.clone();
        env.sort();

        Self {
            task_dependencies,
            topological_dependencies,
            outputs,
            env,
            cache: config.cache,
            output_mode: config.output_mode,
        }
    }

    /// Canonical serialization for fingerprinting. Every list is kept
    /// sorted by construction, so the value is independent of the
    /// order the pipeline file declared things in.
    pub fn canonical_value(&self) -> serde_json::Value {
        json!({
            "cache": self.cache,
            "env": self.env,
            "outputs": self.outputs,
            "taskDependencies": self.task_dependencies,
            "topologicalDependencies": self.topological_dependencies,
        })
    }
}
