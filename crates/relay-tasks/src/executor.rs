//! Task execution
//!
//! Two visitor implementations drive the scheduler: [`ExecContext`]
//! runs tasks for real — fingerprint, cache lookup, spawn on miss,
//! capture outputs — and [`DryRunVisitor`] records what would run
//! without touching anything.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::paths::AbsolutePath;
use relay_core::workspace::{PackageGraph, PackageManager};

use crate::graph::TaskGraph;
use crate::process::{ProcessError, ProcessManager};
use crate::runcache::{self, RunCache};
use crate::scheduler::{TaskError, Visitor};
use crate::task::TaskId;
use crate::taskhash::HashTracker;
use crate::ui::{ColorCache, TaskUi};

/// Environment variable carrying the task fingerprint into the child.
pub const HASH_ENV_VAR: &str = "RELAY_HASH";

/// Counters for the end-of-run report.
#[derive(Debug, Default)]
pub struct ExecutionSummary {
    pub attempted: usize,
    pub cached: usize,
    pub executed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct SummaryCounters {
    attempted: AtomicUsize,
    cached: AtomicUsize,
    executed: AtomicUsize,
    failed: AtomicUsize,
}

/// The real task visitor.
pub struct ExecContext {
    repo_root: AbsolutePath,
    package_graph: Arc<PackageGraph>,
    task_graph: Arc<TaskGraph>,
    hashes: Arc<HashTracker>,
    run_cache: Arc<RunCache>,
    processes: Arc<ProcessManager>,
    package_manager: PackageManager,
    targets: Vec<String>,
    pass_through_args: Vec<String>,
    continue_on_error: bool,
    colors: ColorCache,
    counters: SummaryCounters,
}

impl ExecContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo_root: AbsolutePath,
        package_graph: Arc<PackageGraph>,
        task_graph: Arc<TaskGraph>,
        hashes: Arc<HashTracker>,
        run_cache: Arc<RunCache>,
        processes: Arc<ProcessManager>,
        package_manager: PackageManager,
        targets: Vec<String>,
        pass_through_args: Vec<String>,
        continue_on_error: bool,
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            task_graph,
            hashes,
            run_cache,
            processes,
            package_manager,
            targets,
            pass_through_args,
            continue_on_error,
            colors: ColorCache::new(),
            counters: SummaryCounters::default(),
        }
    }

    /// Pass-through arguments apply only to tasks the user named on
    /// the command line, never to dependency tasks.
    fn args_for_task(&self, task: &str) -> Vec<String> {
        if self.targets.iter().any(|t| t == task) {
            self.pass_through_args.clone()
        } else {
            Vec::new()
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            attempted: self.counters.attempted.load(Ordering::SeqCst),
            cached: self.counters.cached.load(Ordering::SeqCst),
            executed: self.counters.executed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl Visitor for ExecContext {
    async fn visit(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let node = self
            .task_graph
            .node(task_id)
            .ok_or_else(|| TaskError::Failed {
                task_id: task_id.clone(),
                message: "task is not in the task graph".to_string(),
            })?;
        let package = self
            .package_graph
            .package_info(&task_id.package)
            .ok_or_else(|| TaskError::Failed {
                task_id: task_id.clone(),
                message: format!("cannot find package {}", task_id.package),
            })?;

        let pass_through_args = self.args_for_task(&task_id.task);
        let hash = self
            .hashes
            .calculate_task_hash(
                task_id,
                &node.definition,
                &pass_through_args,
                &node.dependencies,
            )
            .map_err(|err| TaskError::Failed {
                task_id: task_id.clone(),
                message: format!("hashing error: {err}"),
            })?;

        // A task without a script is a pure dependency node.
        if !package.scripts.contains_key(&task_id.task) {
            debug!(task = %task_id, "no script in package, skipping");
            return Ok(());
        }

        self.counters.attempted.fetch_add(1, Ordering::SeqCst);
        let ui = TaskUi::new(task_id, self.colors.style_for(&task_id.package));
        let task_cache = self.run_cache.task_cache(
            task_id.clone(),
            package.dir.clone(),
            &node.definition,
            hash.clone(),
        );

        if task_cache.restore_outputs(&ui).await {
            self.counters.cached.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut command = Command::new(self.package_manager.command());
        command.arg("run").arg(&task_id.task);
        if !pass_through_args.is_empty() {
            command.arg("--").args(&pass_through_args);
        }
        command
            .current_dir(package.dir.as_path())
            .env(HASH_ENV_VAR, &hash)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = match self.processes.spawn(command) {
            Ok(child) => child,
            Err(ProcessError::Closing) => {
                return Err(TaskError::Cancelled {
                    task_id: task_id.clone(),
                })
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(TaskError::Failed {
                    task_id: task_id.clone(),
                    message: err.to_string(),
                });
            }
        };

        let mut writer = task_cache.output_writer(ui.clone()).map_err(|err| {
            TaskError::Failed {
                task_id: task_id.clone(),
                message: format!("could not open log file: {err}"),
            }
        })?;

        // Merge stdout and stderr line streams into the tee writer
        // while waiting, so shutdown escalation is never blocked on a
        // child that keeps its pipes open.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout() {
            pump_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr() {
            pump_lines(stderr, line_tx.clone());
        }
        drop(line_tx);
        let (wait_result, ()) = tokio::join!(child.wait(&self.processes), async {
            while let Some(line) = line_rx.recv().await {
                writer.write_line(&line);
            }
        });
        if let Err(err) = writer.finish() {
            warn!(task = %task_id, error = %err, "could not flush log output");
        }

        let status = match wait_result {
            Ok(status) => status,
            Err(ProcessError::Closing) => {
                return Err(TaskError::Cancelled {
                    task_id: task_id.clone(),
                })
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(TaskError::Failed {
                    task_id: task_id.clone(),
                    message: err.to_string(),
                });
            }
        };
        let duration = start.elapsed();

        if !status.success() {
            let code = status.code().unwrap_or(1);
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            task_cache.on_task_failure(&ui);
            if self.continue_on_error {
                ui.warn("command finished with error, but continuing...");
            } else {
                ui.error(&format!("command finished with error: exit code {code}"));
                self.processes.close();
            }
            return Err(TaskError::ChildExit {
                task_id: task_id.clone(),
                code,
            });
        }

        if let Err(err) = task_cache.save_outputs(duration.as_millis() as u64).await {
            warn!(task = %task_id, error = %err, "error caching output");
        }
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        debug!(task = %task_id, duration_ms = duration.as_millis() as u64, "task complete");
        Ok(())
    }
}

fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// One task's dry-run record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunTask {
    pub task_id: String,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub command: String,
    pub outputs: Vec<String>,
    pub log_file: String,
    pub directory: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

/// Visitor that records what would run. Used with concurrency 1 so
/// the output order is deterministic.
pub struct DryRunVisitor {
    repo_root: AbsolutePath,
    package_graph: Arc<PackageGraph>,
    task_graph: Arc<TaskGraph>,
    hashes: Arc<HashTracker>,
    targets: Vec<String>,
    pass_through_args: Vec<String>,
    tasks: Mutex<Vec<DryRunTask>>,
}

impl DryRunVisitor {
    pub fn new(
        repo_root: AbsolutePath,
        package_graph: Arc<PackageGraph>,
        task_graph: Arc<TaskGraph>,
        hashes: Arc<HashTracker>,
        targets: Vec<String>,
        pass_through_args: Vec<String>,
    ) -> Self {
        Self {
            repo_root,
            package_graph,
            task_graph,
            hashes,
            targets,
            pass_through_args,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn into_tasks(self) -> Vec<DryRunTask> {
        self.tasks.into_inner().unwrap()
    }

    fn repo_relative(&self, path: &AbsolutePath) -> String {
        path.relative_to(&self.repo_root)
            .map(|rel| rel.as_str().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string())
    }
}

#[async_trait]
impl Visitor for DryRunVisitor {
    async fn visit(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let node = self
            .task_graph
            .node(task_id)
            .ok_or_else(|| TaskError::Failed {
                task_id: task_id.clone(),
                message: "task is not in the task graph".to_string(),
            })?;
        let package = self
            .package_graph
            .package_info(&task_id.package)
            .ok_or_else(|| TaskError::Failed {
                task_id: task_id.clone(),
                message: format!("cannot find package {}", task_id.package),
            })?;

        let pass_through_args = if self.targets.iter().any(|t| t == &task_id.task) {
            self.pass_through_args.clone()
        } else {
            Vec::new()
        };
        let hash = self
            .hashes
            .calculate_task_hash(
                task_id,
                &node.definition,
                &pass_through_args,
                &node.dependencies,
            )
            .map_err(|err| TaskError::Failed {
                task_id: task_id.clone(),
                message: format!("hashing error: {err}"),
            })?;

        let command = package
            .scripts
            .get(&task_id.task)
            .cloned()
            .unwrap_or_else(|| "<NONEXISTENT>".to_string());

        let to_sorted_strings = |ids: &BTreeSet<TaskId>| -> Vec<String> {
            ids.iter().map(|id| id.to_string()).collect()
        };
        let dependencies = to_sorted_strings(&self.task_graph.transitive_dependencies(task_id));
        let dependents = to_sorted_strings(&self.task_graph.transitive_dependents(task_id));

        self.tasks.lock().unwrap().push(DryRunTask {
            task_id: task_id.to_string(),
            task: task_id.task.clone(),
            package: task_id.package.clone(),
            hash,
            command,
            outputs: node.definition.outputs.clone(),
            log_file: self.repo_relative(&runcache::log_file_path(&package.dir, &task_id.task)),
            directory: self.repo_relative(&package.dir),
            dependencies,
            dependents,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskGraph;
    use crate::runcache::RunCacheOpts;
    use crate::scheduler::{execute, ExecOpts};
    use relay_cache::MultiCache;
    use relay_core::config::TaskConfig;
    use relay_core::workspace::PackageInfo;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tokio::sync::watch;

    struct Fixture {
        _ws: TempDir,
        root: AbsolutePath,
        package_graph: Arc<PackageGraph>,
        task_graph: Arc<TaskGraph>,
        hashes: Arc<HashTracker>,
    }

    /// Two packages, `app` depending on `core`, both with a `build`
    /// script on disk.
    async fn fixture() -> Fixture {
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());
        let mut infos = Vec::new();
        for (name, deps) in [("core", vec![]), ("app", vec!["core".to_string()])] {
            let dir = root.join("packages").join(name);
            dir.create_dir_all().unwrap();
            dir.join("index.js").write(b"content\n").unwrap();
            infos.push(PackageInfo {
                name: name.to_string(),
                dir,
                scripts: BTreeMap::from([("build".to_string(), "node build.js".to_string())]),
                workspace_dependencies: deps,
            });
        }
        let package_graph = Arc::new(PackageGraph::build(root.clone(), infos).unwrap());
        let pipeline = BTreeMap::from([(
            "build".to_string(),
            TaskConfig {
                depends_on: vec!["^build".to_string()],
                ..TaskConfig::default()
            },
        )]);
        let task_graph = Arc::new(
            TaskGraph::build(
                &package_graph,
                &pipeline,
                &["app".to_string(), "core".to_string()],
                &["build".to_string()],
                false,
            )
            .unwrap(),
        );

        let hashes = Arc::new(HashTracker::new("global".to_string()));
        let packages = vec![
            (
                "app".to_string(),
                package_graph.package_info("app").unwrap().dir.clone(),
            ),
            (
                "core".to_string(),
                package_graph.package_info("core").unwrap().dir.clone(),
            ),
        ];
        hashes
            .calculate_file_hashes(packages, 2, None)
            .await
            .unwrap();

        Fixture {
            _ws: ws,
            root,
            package_graph,
            task_graph,
            hashes,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_dry_run_records_all_tasks() {
        let fx = fixture().await;
        let visitor = Arc::new(DryRunVisitor::new(
            fx.root.clone(),
            fx.package_graph.clone(),
            fx.task_graph.clone(),
            fx.hashes.clone(),
            vec!["build".to_string()],
            vec![],
        ));

        let opts = ExecOpts {
            concurrency: 1,
            ..ExecOpts::default()
        };
        let errors = execute(&fx.task_graph, visitor.clone(), &opts, no_cancel()).await;
        assert!(errors.is_empty());

        let visitor = Arc::try_unwrap(visitor).map_err(|_| ()).unwrap();
        let tasks = visitor.into_tasks();
        assert_eq!(tasks.len(), 2);

        // Dependencies first: deterministic serial order.
        assert_eq!(tasks[0].task_id, "core#build");
        assert_eq!(tasks[1].task_id, "app#build");

        assert_eq!(tasks[0].command, "node build.js");
        assert_eq!(tasks[0].hash.len(), 32);
        assert!(tasks[1].dependencies.contains(&"core#build".to_string()));
        assert!(tasks[0].dependents.contains(&"app#build".to_string()));
        assert!(tasks[0].log_file.starts_with("packages/core"));
    }

    #[tokio::test]
    async fn test_no_script_task_is_a_pure_dependency_node() {
        let fx = fixture().await;
        // A pipeline task that no package has a script for.
        let pipeline = BTreeMap::from([("codegen".to_string(), TaskConfig::default())]);
        let task_graph = Arc::new(
            TaskGraph::build(
                &fx.package_graph,
                &pipeline,
                &["app".to_string(), "core".to_string()],
                &["codegen".to_string()],
                false,
            )
            .unwrap(),
        );

        let run_cache = Arc::new(RunCache::new(
            Arc::new(MultiCache::empty()),
            fx.root.clone(),
            RunCacheOpts::default(),
        ));
        let context = Arc::new(ExecContext::new(
            fx.root.clone(),
            fx.package_graph.clone(),
            task_graph.clone(),
            fx.hashes.clone(),
            run_cache,
            Arc::new(ProcessManager::new()),
            PackageManager::Npm,
            vec!["codegen".to_string()],
            vec![],
            false,
        ));

        let opts = ExecOpts {
            concurrency: 2,
            ..ExecOpts::default()
        };
        let errors = execute(&task_graph, context.clone(), &opts, no_cancel()).await;
        assert!(errors.is_empty());
        // Nothing was attempted: no scripts, no spawns.
        assert_eq!(context.summary().attempted, 0);
    }

    #[tokio::test]
    async fn test_args_for_task_only_applies_to_targets() {
        let fx = fixture().await;
        let run_cache = Arc::new(RunCache::new(
            Arc::new(MultiCache::empty()),
            fx.root.clone(),
            RunCacheOpts::default(),
        ));
        let context = ExecContext::new(
            fx.root.clone(),
            fx.package_graph.clone(),
            fx.task_graph.clone(),
            fx.hashes.clone(),
            run_cache,
            Arc::new(ProcessManager::new()),
            PackageManager::Npm,
            vec!["build".to_string()],
            vec!["--minify".to_string()],
            false,
        );

        assert_eq!(context.args_for_task("build"), vec!["--minify".to_string()]);
        assert!(context.args_for_task("codegen").is_empty());
    }
}
