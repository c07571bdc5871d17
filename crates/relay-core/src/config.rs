//! Pipeline configuration
//!
//! The pipeline lives in `relay.json` at the workspace root. Task keys
//! are either bare task names (`"build"`) or package-scoped overrides
//! (`"web#build"`) — any key containing `#` is an override. Entries in
//! `dependsOn` starting with `^` denote topological dependencies: the
//! same task in every direct upstream package.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Name of the pipeline file.
pub const CONFIG_FILE_NAME: &str = "relay.json";

/// Prefix marking a topological dependency in `dependsOn`.
pub const TOPOLOGICAL_PREFIX: char = '^';

/// Separator between package and task in a scoped pipeline key.
pub const TASK_DELIMITER: char = '#';

/// Root configuration parsed from `relay.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Task name (or `package#task` override) to task definition
    pub pipeline: BTreeMap<String, TaskConfig>,

    /// Globs, relative to the workspace root, whose contents feed the
    /// global hash
    pub global_dependencies: Vec<String>,

    /// Remote cache behavior
    pub remote_cache: RemoteCacheConfig,
}

/// One pipeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Task and `^`-prefixed topological dependencies
    pub depends_on: Vec<String>,

    /// Output globs relative to the package directory
    pub outputs: Vec<String>,

    /// Environment variable names whose values feed the task hash
    pub env: Vec<String>,

    /// Whether outputs of this task are cached at all
    pub cache: bool,

    /// How task logs are surfaced and replayed
    pub output_mode: OutputMode,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            outputs: Vec::new(),
            env: Vec::new(),
            cache: true,
            output_mode: OutputMode::default(),
        }
    }
}

/// Policy controlling how task log output is surfaced, and whether it
/// is replayed on a cache hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Stream everything, replay on hit
    #[default]
    Full,
    /// Only surface the cache status line
    HashOnly,
    /// Stream and replay only on cache miss
    NewOnly,
    /// Surface logs only when the task fails
    ErrorsOnly,
    /// No task output at all
    None,
}

/// Remote cache options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteCacheConfig {
    /// Require and verify HMAC artifact signatures
    pub signature: bool,
}

/// Load and validate the pipeline file at `path`.
pub fn load_config(path: &Path) -> Result<RelayConfig, ConfigError> {
    info!(path = %path.display(), "loading pipeline config");
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    let config: RelayConfig =
        serde_json::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
    validate_config(&config)?;
    debug!(tasks = config.pipeline.len(), "pipeline config loaded");
    Ok(config)
}

/// Find `relay.json` in `start_dir` or the nearest parent directory.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            debug!(path = %candidate.display(), "found pipeline config");
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

/// Load configuration starting from a directory, searching upward.
pub fn load_config_from_dir(dir: &Path) -> Result<(RelayConfig, PathBuf), ConfigError> {
    let path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;
    let config = load_config(&path)?;
    Ok((config, path))
}

fn validate_config(config: &RelayConfig) -> Result<(), ConfigError> {
    for (name, task) in &config.pipeline {
        if name.is_empty() || name.ends_with(TASK_DELIMITER) || name.starts_with(TASK_DELIMITER) {
            return Err(ConfigError::InvalidEntry {
                entry: name.clone(),
                message: "pipeline keys must be `task` or `package#task`".to_string(),
            });
        }
        for dep in &task.depends_on {
            let bare = dep.trim_start_matches(TOPOLOGICAL_PREFIX);
            if bare.is_empty() {
                return Err(ConfigError::InvalidEntry {
                    entry: name.clone(),
                    message: format!("empty dependsOn entry `{dep}`"),
                });
            }
            if dep.starts_with(TOPOLOGICAL_PREFIX) && bare.contains(TASK_DELIMITER) {
                return Err(ConfigError::InvalidEntry {
                    entry: name.clone(),
                    message: format!(
                        "`{dep}` cannot be both topological and package-scoped"
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Check that every requested target has a pipeline entry, bare or
/// package-scoped.
pub fn validate_targets(config: &RelayConfig, targets: &[String]) -> Result<(), ConfigError> {
    for target in targets {
        let has_entry = config.pipeline.contains_key(target)
            || config
                .pipeline
                .keys()
                .any(|key| key.split(TASK_DELIMITER).nth(1) == Some(target));
        if !has_entry {
            return Err(ConfigError::MissingPipelineTask(target.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "pipeline": {
            "build": {
                "dependsOn": ["^build"],
                "outputs": ["dist/**"],
                "env": ["NODE_ENV"]
            },
            "test": {
                "dependsOn": ["build"],
                "outputMode": "new-only"
            },
            "web#build": {
                "dependsOn": ["^build"],
                "outputs": [".next/**"],
                "cache": false
            }
        },
        "globalDependencies": ["tsconfig.json"],
        "remoteCache": { "signature": true }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config: RelayConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.pipeline.len(), 3);

        let build = &config.pipeline["build"];
        assert_eq!(build.depends_on, vec!["^build"]);
        assert!(build.cache);
        assert_eq!(build.output_mode, OutputMode::Full);

        let test = &config.pipeline["test"];
        assert_eq!(test.output_mode, OutputMode::NewOnly);

        let scoped = &config.pipeline["web#build"];
        assert!(!scoped.cache);
        assert!(config.remote_cache.signature);
    }

    #[test]
    fn test_find_config_walks_up() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), "{}").unwrap();
        let nested = temp.path().join("packages").join("a");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, temp.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_load_config_rejects_invalid_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_depends_on() {
        let mut config = RelayConfig::default();
        config.pipeline.insert(
            "build".to_string(),
            TaskConfig {
                depends_on: vec!["^".to_string()],
                ..TaskConfig::default()
            },
        );
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_targets() {
        let config: RelayConfig = serde_json::from_str(SAMPLE).unwrap();
        assert!(validate_targets(&config, &["build".to_string()]).is_ok());
        assert!(validate_targets(&config, &["deploy".to_string()]).is_err());
    }

    #[test]
    fn test_validate_targets_accepts_scoped_only_entries() {
        let mut config = RelayConfig::default();
        config
            .pipeline
            .insert("web#lint".to_string(), TaskConfig::default());
        assert!(validate_targets(&config, &["lint".to_string()]).is_ok());
    }
}
