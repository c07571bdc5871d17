//! Relay core - shared types for the relay task runner
//!
//! This crate provides the pieces every other relay crate builds on:
//! typed filesystem paths, content hashing, pipeline configuration,
//! and the workspace package graph.

pub mod config;
pub mod error;
pub mod hash;
pub mod paths;
pub mod workspace;

pub use config::{OutputMode, RelayConfig, TaskConfig};
pub use error::{ConfigError, GraphError, HashError, PathError, RelayError, Result};
pub use paths::{AbsolutePath, RelativeUnixPath};
pub use workspace::{PackageGraph, PackageInfo, PackageManager, ROOT_PKG_NAME};
