//! Run command — execute tasks across the workspace

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Args;
use console::style;
use tokio::sync::watch;
use tracing::warn;

use relay_cache::{
    default_cache_location, new_multi_cache, CacheError, CacheOpts, MultiCache, RemoteCacheOpts,
};
use relay_core::config::{self, OutputMode};
use relay_core::hash::global_hash;
use relay_core::paths::AbsolutePath;
use relay_core::workspace::{discover_packages, PackageGraph, PackageManager};
use relay_scm::{Scm, ScmError};
use relay_tasks::scheduler::{execute, ExecOpts};
use relay_tasks::{
    DryRunVisitor, ExecContext, HashTracker, ProcessManager, RunCache, RunCacheOpts, TaskGraph,
};

use crate::cli::Cli;
use crate::exit_codes;

/// Async cache upload worker count.
const CACHE_WORKERS: usize = 10;

/// Run tasks across projects in the monorepo, in topological order,
/// caching results. Arguments after `--` pass through to the tasks.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g. build test lint)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Restrict the run to specific packages (repeatable)
    #[arg(long)]
    pub filter: Vec<String>,

    /// Concurrency limit; 1 means serial execution
    #[arg(long, default_value_t = 10)]
    pub concurrency: usize,

    /// Execute all tasks in parallel, ignoring dependency order
    #[arg(long)]
    pub parallel: bool,

    /// Continue executing tasks after a failure
    #[arg(long = "continue")]
    pub continue_on_error: bool,

    /// Run only the specified tasks, not their dependencies
    #[arg(long, hide = true)]
    pub only: bool,

    /// List tasks that would run without executing them
    #[arg(
        long,
        value_name = "FORMAT",
        num_args = 0..=1,
        default_missing_value = "text",
        require_equals = true
    )]
    pub dry_run: Option<String>,

    /// Write the task graph in DOT form to a file instead of running
    #[arg(long, value_name = "FILE")]
    pub graph: Option<PathBuf>,

    /// Ignore existing cached artifacts and force execution
    #[arg(long)]
    pub force: bool,

    /// Skip the filesystem cache, using only the remote cache
    #[arg(long)]
    pub remote_only: bool,

    /// Do not store task outputs in any cache
    #[arg(long)]
    pub no_cache: bool,

    /// Override the local cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Override every task's output mode
    /// (full, hash-only, new-only, errors-only, none)
    #[arg(long, value_name = "MODE")]
    pub output_logs: Option<String>,

    /// Arguments forwarded to the named tasks
    #[arg(last = true)]
    pub pass_through: Vec<String>,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let started_at = Instant::now();
        let cwd = match &cli.directory {
            Some(dir) if dir.is_absolute() => AbsolutePath::new_unchecked(dir.clone()),
            Some(dir) => AbsolutePath::cwd()?.join(dir),
            None => AbsolutePath::cwd()?,
        };

        let (config, config_path) = config::load_config_from_dir(cwd.as_path())
            .context("could not load relay.json")?;
        let root = AbsolutePath::new_unchecked(
            config_path
                .parent()
                .context("relay.json has no parent directory")?,
        );
        config::validate_targets(&config, &self.tasks)?;

        let packages = discover_packages(&root)?;
        let package_graph = Arc::new(PackageGraph::build(root.clone(), packages)?);

        let scope = self.resolve_scope(&package_graph)?;
        let package_manager = PackageManager::detect(&root);

        let mut task_graph = TaskGraph::build(
            &package_graph,
            &config.pipeline,
            &scope,
            &self.tasks,
            self.only,
        )?;
        // Parallel mode ignores ordering entirely: rebuild the graph
        // with every edge stripped so hashing and scheduling agree.
        if self.parallel {
            task_graph = task_graph.without_edges();
        }
        let task_graph = Arc::new(task_graph);

        if let Some(graph_file) = &self.graph {
            std::fs::write(graph_file, task_graph.to_dot())?;
            if !cli.quiet {
                println!(
                    "{} Generated task graph in {}",
                    style("✔").green(),
                    style(graph_file.display()).bold()
                );
            }
            return Ok(exit_codes::SUCCESS);
        }

        if task_graph.is_empty() {
            if !cli.quiet {
                println!("{} No tasks to run.", style("✓").green());
            }
            return Ok(exit_codes::SUCCESS);
        }

        let scm = match Scm::open(&root) {
            Ok(scm) => Some(Arc::new(scm)),
            Err(ScmError::NotARepository(_)) => {
                warn!("workspace is not in a git repository, hashing by directory walk");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let hashes = Arc::new(HashTracker::new(global_hash(
            &root,
            &config.global_dependencies,
        )?));
        let mut hash_packages: Vec<(String, AbsolutePath)> = task_graph
            .task_ids()
            .iter()
            .map(|id| id.package.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|name| {
                package_graph
                    .package_info(&name)
                    .map(|info| (name, info.dir.clone()))
            })
            .collect();
        hash_packages.sort();
        hashes
            .calculate_file_hashes(hash_packages, self.concurrency.max(1), scm)
            .await
            .context("error hashing package files")?;

        if let Some(format) = &self.dry_run {
            return self.execute_dry_run(cli, format, &root, &package_graph, &task_graph, &hashes)
                .await;
        }

        let run_cache_opts = RunCacheOpts {
            skip_reads: self.force || env_flag("RELAY_FORCE"),
            skip_writes: self.no_cache,
            output_mode_override: self
                .output_logs
                .as_deref()
                .map(parse_output_mode)
                .transpose()?,
        };
        let cache = Arc::new(self.build_caches(cli, &root, &config)?);
        let run_cache = Arc::new(RunCache::new(cache.clone(), root.clone(), run_cache_opts));

        if !cli.quiet {
            println!(
                "{}",
                style(format!("• Packages in scope: {}", scope.join(", "))).dim()
            );
            println!(
                "{} {} {}",
                style("• Running").dim(),
                style(self.tasks.join(", ")).bold(),
                style(format!("in {} packages", scope.len())).dim()
            );
        }

        let processes = Arc::new(ProcessManager::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let processes = processes.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(true);
                    processes.close();
                }
            });
        }

        let context = Arc::new(ExecContext::new(
            root.clone(),
            package_graph.clone(),
            task_graph.clone(),
            hashes,
            run_cache,
            processes,
            package_manager,
            self.tasks.clone(),
            self.pass_through.clone(),
            self.continue_on_error,
        ));
        let opts = ExecOpts {
            concurrency: self.concurrency.max(1),
            parallel: self.parallel,
            continue_on_error: self.continue_on_error,
        };
        let errors = execute(&task_graph, context.clone(), &opts, cancel_rx).await;

        cache.shutdown().await;

        let mut exit_code = exit_codes::SUCCESS;
        let mut cancelled = 0usize;
        for error in &errors {
            if error.is_cancellation() {
                cancelled += 1;
                continue;
            }
            eprintln!("{} {error}", style("error:").red().bold());
            match error.exit_code() {
                Some(code) => exit_code = exit_code.max(code),
                None => exit_code = exit_code.max(exit_codes::ERROR),
            }
        }

        if !cli.quiet {
            let summary = context.summary();
            let succeeded = summary.cached + summary.executed;
            println!();
            println!(
                " Tasks:    {} successful, {} total",
                style(succeeded).bold(),
                summary.attempted
            );
            println!(
                " Cached:   {} cached, {} total",
                style(summary.cached).bold(),
                summary.attempted
            );
            if cancelled > 0 {
                println!(" Cancelled: {}", style(cancelled).bold());
            }
            println!(
                " Time:     {}",
                style(format!("{:.2}s", started_at.elapsed().as_secs_f64())).bold()
            );
            println!();
        }

        Ok(exit_code)
    }

    fn resolve_scope(&self, package_graph: &PackageGraph) -> anyhow::Result<Vec<String>> {
        if self.filter.is_empty() {
            return Ok(package_graph.package_names());
        }
        for name in &self.filter {
            if package_graph.package_info(name).is_none() {
                anyhow::bail!("filtered package `{name}` is not in the workspace");
            }
        }
        let mut scope = self.filter.clone();
        scope.sort();
        scope.dedup();
        Ok(scope)
    }

    fn build_caches(
        &self,
        cli: &Cli,
        root: &AbsolutePath,
        config: &config::RelayConfig,
    ) -> anyhow::Result<MultiCache> {
        let dir = match &self.cache_dir {
            Some(dir) => AbsolutePath::new(dir.clone()).unwrap_or_else(|_| root.join(dir)),
            None => default_cache_location(root),
        };

        let remote = match (std::env::var("RELAY_API"), std::env::var("RELAY_TOKEN"),
                            std::env::var("RELAY_TEAM")) {
            (Ok(api_url), Ok(token), Ok(team_id)) => Some(RemoteCacheOpts {
                api_url,
                token,
                team_id,
                signature: config.remote_cache.signature,
            }),
            _ => None,
        };

        let opts = CacheOpts {
            dir,
            workers: CACHE_WORKERS,
            skip_filesystem: self.remote_only || env_flag("RELAY_REMOTE_ONLY"),
            skip_remote: remote.is_none(),
            remote,
        };
        match new_multi_cache(&opts) {
            Ok(cache) => Ok(cache),
            Err(CacheError::NoCachesEnabled) => {
                if !cli.quiet {
                    eprintln!(
                        "{} no caches are enabled; tasks will always execute",
                        style("warning:").yellow().bold()
                    );
                }
                Ok(MultiCache::empty())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn execute_dry_run(
        &self,
        cli: &Cli,
        format: &str,
        root: &AbsolutePath,
        package_graph: &Arc<PackageGraph>,
        task_graph: &Arc<TaskGraph>,
        hashes: &Arc<HashTracker>,
    ) -> anyhow::Result<i32> {
        let visitor = Arc::new(DryRunVisitor::new(
            root.clone(),
            package_graph.clone(),
            task_graph.clone(),
            hashes.clone(),
            self.tasks.clone(),
            self.pass_through.clone(),
        ));
        // Concurrency 1 keeps dry-run output deterministic.
        let opts = ExecOpts {
            concurrency: 1,
            parallel: false,
            continue_on_error: false,
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let errors = execute(task_graph, visitor.clone(), &opts, cancel_rx).await;
        drop(cancel_tx);
        if !errors.is_empty() {
            for error in &errors {
                eprintln!("{} {error}", style("error:").red().bold());
            }
            anyhow::bail!("errors occurred during dry-run graph traversal");
        }

        let visitor = Arc::try_unwrap(visitor)
            .map_err(|_| anyhow::anyhow!("dry-run visitor still shared"))?;
        let tasks = visitor.into_tasks();

        match format {
            "json" => {
                let rendered = serde_json::to_string_pretty(&serde_json::json!({
                    "tasks": tasks,
                }))?;
                println!("{rendered}");
            }
            "text" => {
                if !cli.quiet {
                    println!();
                }
                println!("{}", style("Tasks to Run").cyan().bold());
                for task in &tasks {
                    println!("{}", style(&task.task_id).bold());
                    println!("  {} = {}", style("Task").dim(), task.task);
                    println!("  {} = {}", style("Package").dim(), task.package);
                    println!("  {} = {}", style("Hash").dim(), task.hash);
                    println!("  {} = {}", style("Directory").dim(), task.directory);
                    println!("  {} = {}", style("Command").dim(), task.command);
                    println!("  {} = {}", style("Outputs").dim(), task.outputs.join(", "));
                    println!("  {} = {}", style("Log File").dim(), task.log_file);
                    println!(
                        "  {} = {}",
                        style("Dependencies").dim(),
                        task.dependencies.join(", ")
                    );
                    println!(
                        "  {} = {}",
                        style("Dependents").dim(),
                        task.dependents.join(", ")
                    );
                }
            }
            other => anyhow::bail!("invalid dry-run format `{other}`; expected text or json"),
        }
        Ok(exit_codes::SUCCESS)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn parse_output_mode(value: &str) -> anyhow::Result<OutputMode> {
    match value {
        "full" => Ok(OutputMode::Full),
        "hash-only" => Ok(OutputMode::HashOnly),
        "new-only" => Ok(OutputMode::NewOnly),
        "errors-only" => Ok(OutputMode::ErrorsOnly),
        "none" => Ok(OutputMode::None),
        other => anyhow::bail!(
            "invalid output mode `{other}`; expected full, hash-only, new-only, errors-only, or none"
        ),
    }
}
