//! Per-task cache façade
//!
//! `RunCache` sits between the executor and the cache backends. For
//! each task it hands out a `TaskCache` that knows the task's output
//! globs, log file, and output mode, and that enforces one invariant:
//! nothing outside the package directory is ever captured.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use relay_cache::{CacheError, MultiCache};
use relay_core::config::OutputMode;
use relay_core::paths::AbsolutePath;

use crate::task::{TaskDefinition, TaskId};
use crate::ui::TaskUi;

/// Directory under each package holding captured task logs.
const LOG_DIR: &str = ".relay";

/// Where a task's captured log lives inside its package.
pub fn log_file_path(package_dir: &AbsolutePath, task: &str) -> AbsolutePath {
    package_dir.join(LOG_DIR).join(format!("relay-{task}.log"))
}

/// Run-level cache behavior flags.
#[derive(Debug, Clone, Default)]
pub struct RunCacheOpts {
    /// Never fetch: force execution even on a warm cache
    pub skip_reads: bool,
    /// Never store outputs
    pub skip_writes: bool,
    /// Override every task's configured output mode
    pub output_mode_override: Option<OutputMode>,
}

/// Mediates between the task executor and the cache backends.
pub struct RunCache {
    cache: Arc<MultiCache>,
    repo_root: AbsolutePath,
    opts: RunCacheOpts,
}

impl RunCache {
    pub fn new(cache: Arc<MultiCache>, repo_root: AbsolutePath, opts: RunCacheOpts) -> Self {
        Self {
            cache,
            repo_root,
            opts,
        }
    }

    /// The per-task cache handle.
    pub fn task_cache(
        self: &Arc<Self>,
        task_id: TaskId,
        package_dir: AbsolutePath,
        definition: &TaskDefinition,
        hash: String,
    ) -> TaskCache {
        let log_file = log_file_path(&package_dir, &task_id.task);
        TaskCache {
            run_cache: self.clone(),
            output_mode: self
                .opts
                .output_mode_override
                .unwrap_or(definition.output_mode),
            caching_disabled: !definition.cache,
            outputs: definition.outputs.clone(),
            task_id,
            package_dir,
            log_file,
            hash,
        }
    }
}

/// Cache operations scoped to one task execution.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    task_id: TaskId,
    package_dir: AbsolutePath,
    log_file: AbsolutePath,
    outputs: Vec<String>,
    output_mode: OutputMode,
    caching_disabled: bool,
    hash: String,
}

impl TaskCache {
    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn log_file(&self) -> &AbsolutePath {
        &self.log_file
    }

    fn status_line(&self, ui: &TaskUi, message: &str) {
        if !matches!(self.output_mode, OutputMode::None | OutputMode::ErrorsOnly) {
            ui.output(message);
        }
    }

    /// Try to restore this task's outputs from the caches. On a hit
    /// the captured log replays through the UI (subject to the output
    /// mode) and the caller skips execution.
    pub async fn restore_outputs(&self, ui: &TaskUi) -> bool {
        if self.caching_disabled || self.run_cache.opts.skip_reads {
            self.status_line(ui, &format!("cache bypass, force executing {}", self.hash));
            return false;
        }

        match self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await
        {
            None => {
                self.status_line(ui, &format!("cache miss, executing {}", self.hash));
                false
            }
            Some(hit) => {
                // New-only surfaces logs only when the task actually
                // ran, so replay is full-mode behavior.
                if self.output_mode == OutputMode::Full {
                    self.status_line(
                        ui,
                        &format!("cache hit, replaying output {}", self.hash),
                    );
                    self.replay_log_file(ui);
                } else {
                    self.status_line(
                        ui,
                        &format!("cache hit, suppressing output {}", self.hash),
                    );
                }
                debug!(task = %self.task_id, duration_saved_ms = hit.duration_ms, "restored outputs from cache");
                true
            }
        }
    }

    /// Replay the captured log through the UI line by line.
    pub fn replay_log_file(&self, ui: &TaskUi) {
        if let Ok(contents) = self.log_file.read_to_string() {
            for line in contents.lines() {
                ui.output(line);
            }
        }
    }

    /// Called when the task failed: errors-only mode withholds logs
    /// until this moment.
    pub fn on_task_failure(&self, ui: &TaskUi) {
        if self.output_mode == OutputMode::ErrorsOnly {
            self.replay_log_file(ui);
        }
    }

    /// A writer that tees task output to the captured log file and,
    /// depending on the output mode, to the UI.
    pub fn output_writer(&self, ui: TaskUi) -> std::io::Result<TaskOutputWriter> {
        self.log_file.ensure_parent_dir()?;
        let file = File::create(self.log_file.as_path())?;
        let stream_to_ui = matches!(self.output_mode, OutputMode::Full | OutputMode::NewOnly);
        Ok(TaskOutputWriter {
            log: BufWriter::new(file),
            ui,
            stream_to_ui,
        })
    }

    /// Glob the declared output patterns and store the matches, plus
    /// the captured log, in the caches. Put failures degrade to
    /// warnings inside the multi-cache: the task has already
    /// succeeded.
    pub async fn save_outputs(&self, duration_ms: u64) -> Result<(), CacheError> {
        if self.caching_disabled || self.run_cache.opts.skip_writes {
            return Ok(());
        }

        let mut files = self.collect_output_files()?;
        if self.log_file.exists() {
            files.push(self.log_file.clone());
        }
        debug!(task = %self.task_id, files = files.len(), "saving outputs");
        self.run_cache
            .cache
            .put(&self.run_cache.repo_root, &self.hash, duration_ms, &files)
            .await;
        Ok(())
    }

    /// Expand output globs relative to the package directory. Matches
    /// that resolve outside the package directory are dropped: a task
    /// cannot capture its neighbors' files.
    fn collect_output_files(&self) -> Result<Vec<AbsolutePath>, CacheError> {
        let mut found = Vec::new();
        for pattern in &self.outputs {
            let full_pattern = self
                .package_dir
                .join(pattern)
                .to_string_lossy()
                .to_string();
            let Ok(matches) = glob::glob(&full_pattern) else {
                warn!(task = %self.task_id, pattern = %pattern, "invalid output glob");
                continue;
            };
            for path in matches.flatten() {
                let path = AbsolutePath::new_unchecked(path);
                if path.relative_to(&self.package_dir).is_err() {
                    warn!(task = %self.task_id, path = %path, "output outside package directory, skipping");
                    continue;
                }
                collect_tree(&path, &mut found)?;
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }
}

/// Collect a matched path: files and symlinks directly, directories
/// recursively. Does not descend into symlinked directories — the
/// link entry itself is captured and the extractor recreates it.
fn collect_tree(path: &AbsolutePath, out: &mut Vec<AbsolutePath>) -> Result<(), CacheError> {
    let metadata = path.symlink_metadata()?;
    if metadata.file_type().is_symlink() || !metadata.is_dir() {
        out.push(path.clone());
        return Ok(());
    }
    out.push(path.clone());
    for entry in std::fs::read_dir(path.as_path())? {
        let entry = entry?;
        collect_tree(&AbsolutePath::new_unchecked(entry.path()), out)?;
    }
    Ok(())
}

/// Tees child output to the captured log and the console.
pub struct TaskOutputWriter {
    log: BufWriter<File>,
    ui: TaskUi,
    stream_to_ui: bool,
}

impl TaskOutputWriter {
    pub fn write_line(&mut self, line: &str) {
        if let Err(err) = writeln!(self.log, "{line}") {
            warn!(error = %err, "failed to write task log");
        }
        if self.stream_to_ui {
            self.ui.output(line);
        }
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        self.log.flush()
    }
}
