//! Task scheduler
//!
//! Bounded-concurrency traversal of the task graph. A visitor runs for
//! a task only after every predecessor's visitor has returned
//! successfully. Errors are collected rather than fast-failed; when
//! `continue_on_error` is off, the first error stops new dispatch but
//! in-flight visitors run to completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use crate::graph::TaskGraph;
use crate::task::TaskId;

/// Per-task failure surfaced by a visitor.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task's child process exited non-zero. The run's exit code
    /// is the maximum such code.
    #[error("{task_id}: command exited with code {code}")]
    ChildExit { task_id: TaskId, code: i32 },

    /// The task was interrupted by run cancellation. Not a failure.
    #[error("{task_id}: cancelled")]
    Cancelled { task_id: TaskId },

    /// Anything else that stopped the task.
    #[error("{task_id}: {message}")]
    Failed { task_id: TaskId, message: String },
}

impl TaskError {
    /// The child exit code, for errors that carry one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskError::ChildExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }
}

/// One task visit. Implemented by the executor and by dry-run.
#[async_trait]
pub trait Visitor: Send + Sync {
    async fn visit(&self, task_id: &TaskId) -> Result<(), TaskError>;
}

/// Scheduler options.
#[derive(Debug, Clone)]
pub struct ExecOpts {
    /// Maximum visitors in flight
    pub concurrency: usize,
    /// Ignore edges entirely: every task is immediately ready
    pub parallel: bool,
    /// Keep dispatching after a failure
    pub continue_on_error: bool,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            concurrency: 10,
            parallel: false,
            continue_on_error: false,
        }
    }
}

/// Traverse the graph, invoking the visitor per task. Returns every
/// collected error; an empty vec is a fully successful run.
///
/// With `concurrency == 1` the visit order is deterministic: a
/// topological order with lexicographic tie-break on task id.
#[instrument(skip_all, fields(tasks = graph.len(), concurrency = opts.concurrency))]
pub async fn execute(
    graph: &TaskGraph,
    visitor: Arc<dyn Visitor>,
    opts: &ExecOpts,
    cancel: watch::Receiver<bool>,
) -> Vec<TaskError> {
    let concurrency = opts.concurrency.max(1);

    let mut in_degree: BTreeMap<TaskId, usize> = BTreeMap::new();
    let mut ready: BTreeSet<TaskId> = BTreeSet::new();
    for id in graph.task_ids() {
        let degree = if opts.parallel {
            0
        } else {
            graph.dependencies(&id).len()
        };
        if degree == 0 {
            ready.insert(id.clone());
        }
        in_degree.insert(id, degree);
    }

    let mut errors: Vec<TaskError> = Vec::new();
    let mut stopped = false;
    let mut in_flight: JoinSet<(TaskId, Result<(), TaskError>)> = JoinSet::new();
    let mut cancel = cancel;

    loop {
        if *cancel.borrow() {
            stopped = true;
        }

        while !stopped && in_flight.len() < concurrency {
            // Lexicographically smallest ready task first.
            let Some(next) = ready.iter().next().cloned() else {
                break;
            };
            ready.remove(&next);
            let visitor = visitor.clone();
            in_flight.spawn(async move {
                let result = visitor.visit(&next).await;
                (next, result)
            });
        }

        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            changed = cancel.changed(), if !stopped => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("cancellation requested, draining in-flight tasks");
                    stopped = true;
                }
            }
            Some(joined) = in_flight.join_next() => {
                match joined {
                    Ok((id, Ok(()))) => {
                        if !opts.parallel {
                            for dependent in graph.dependents(&id) {
                                if let Some(degree) = in_degree.get_mut(&dependent) {
                                    *degree -= 1;
                                    if *degree == 0 {
                                        ready.insert(dependent);
                                    }
                                }
                            }
                        }
                    }
                    Ok((id, Err(err))) => {
                        debug!(task = %id, error = %err, "task visitor failed");
                        if !opts.continue_on_error && !err.is_cancellation() {
                            stopped = true;
                        }
                        errors.push(err);
                    }
                    Err(join_err) => {
                        if !opts.continue_on_error {
                            stopped = true;
                        }
                        errors.push(TaskError::Failed {
                            task_id: TaskId::new("unknown", "unknown"),
                            message: format!("task panicked: {join_err}"),
                        });
                    }
                }
            }
        }
    }

    errors
}
