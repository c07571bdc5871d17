//! Error types for relay core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for relay core operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Path-related errors
    #[error(transparent)]
    Path(#[from] PathError),

    /// Hashing errors
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Package graph errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Pipeline file not found
    #[error("relay.json not found in {0} or any parent directory")]
    NotFound(PathBuf),

    /// Failed to parse the pipeline file
    #[error("failed to parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A requested task has no pipeline entry
    #[error("task `{0}` not found in the `pipeline` section of relay.json")]
    MissingPipelineTask(String),

    /// Invalid pipeline entry
    #[error("invalid pipeline entry `{entry}`: {message}")]
    InvalidEntry { entry: String, message: String },

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Typed-path errors
#[derive(Debug, Error)]
pub enum PathError {
    /// A checked constructor was given a non-absolute path
    #[error("path is not absolute: {0}")]
    NotAbsolute(PathBuf),

    /// A relative-unix path constructor was given an absolute path
    #[error("path is not relative: {0}")]
    NotRelative(String),

    /// A path could not be made relative to the given base
    #[error("path {path} is not contained in {base}")]
    NotContained { path: PathBuf, base: PathBuf },

    /// A path was not valid unicode
    #[error("path is not valid unicode: {0}")]
    InvalidUnicode(PathBuf),
}

/// Hashing errors
#[derive(Debug, Error)]
pub enum HashError {
    /// A file that should contribute to a hash could not be read
    #[error("failed to hash {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A package had no computed file hash when a task hash was requested
    #[error("no file hash computed for package `{0}`")]
    MissingPackageHash(String),

    /// A dependency task's hash was requested before it was computed
    #[error("hash for dependency task `{0}` has not been computed")]
    MissingDependencyHash(String),

    /// Path error during hashing
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Package graph errors
#[derive(Debug, Error)]
pub enum GraphError {
    /// Cyclic dependency detected
    #[error("invalid package dependency graph: cycle detected: {0}")]
    CyclicDependency(String),

    /// Workspace root manifest missing or unreadable
    #[error("no package manifest found at {0}")]
    MissingRootManifest(PathBuf),

    /// A workspace member manifest failed to parse
    #[error("failed to parse {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    /// No packages matched the workspace globs
    #[error("no packages found in workspace")]
    NoPackages,

    /// IO error during discovery
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
