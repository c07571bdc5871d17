//! Relay execution engine
//!
//! This crate turns a package graph and a pipeline into work: it
//! builds the task graph, schedules it under a concurrency limit,
//! fingerprints every task, consults the caches before spawning
//! anything, and captures outputs back into the caches afterwards.

pub mod executor;
pub mod graph;
pub mod process;
pub mod runcache;
pub mod scheduler;
pub mod task;
pub mod taskhash;
pub mod ui;

pub use executor::{DryRunTask, DryRunVisitor, ExecContext, ExecutionSummary};
pub use graph::{TaskGraph, TaskGraphError, TaskNode};
pub use process::{ProcessError, ProcessManager};
pub use scheduler::{execute, ExecOpts, TaskError, Visitor};
pub use task::{TaskDefinition, TaskId};
pub use taskhash::HashTracker;
pub use runcache::{RunCache, RunCacheOpts, TaskCache};
pub use ui::{ColorCache, TaskUi};
