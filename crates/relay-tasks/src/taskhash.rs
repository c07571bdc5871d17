//! Task fingerprinting
//!
//! A task's fingerprint is a pure function of: the run-global hash,
//! the owning package's file hash, the canonicalized task definition,
//! pass-through arguments, the values of declared environment
//! variables, and the fingerprints of every dependency task. No
//! timestamps, no absolute paths; set-valued inputs are sorted before
//! hashing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use relay_core::error::HashError;
use relay_core::hash::{hash_file_blob, hash_file_list, hash_value};
use relay_core::paths::{AbsolutePath, RelativeUnixPath};
use relay_scm::Scm;

use crate::task::{TaskDefinition, TaskId};

/// Computes and memoizes package file hashes and task fingerprints.
pub struct HashTracker {
    global_hash: String,
    package_file_hashes: Mutex<HashMap<String, String>>,
    task_hashes: Mutex<HashMap<TaskId, String>>,
}

impl HashTracker {
    pub fn new(global_hash: String) -> Self {
        Self {
            global_hash,
            package_file_hashes: Mutex::new(HashMap::new()),
            task_hashes: Mutex::new(HashMap::new()),
        }
    }

    pub fn global_hash(&self) -> &str {
        &self.global_hash
    }

    /// Pre-compute file hashes for every named package. File lists
    /// come from the SCM when available; otherwise the package
    /// directory is walked.
    #[instrument(skip_all, fields(packages = packages.len(), concurrency))]
    pub async fn calculate_file_hashes(
        &self,
        packages: Vec<(String, AbsolutePath)>,
        concurrency: usize,
        scm: Option<Arc<Scm>>,
    ) -> Result<(), HashError> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers: JoinSet<Result<(String, String), HashError>> = JoinSet::new();

        for (name, dir) in packages {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let scm = scm.clone();
            workers.spawn(async move {
                let result = tokio::task::spawn_blocking(move || {
                    let hash = hash_package_files(&dir, scm.as_deref())?;
                    Ok((name, hash))
                })
                .await
                .map_err(|e| HashError::FileRead {
                    path: std::path::PathBuf::new(),
                    source: std::io::Error::other(format!("hash worker panicked: {e}")),
                })?;
                drop(permit);
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            let (name, hash) = joined.map_err(|e| HashError::FileRead {
                path: std::path::PathBuf::new(),
                source: std::io::Error::other(format!("hash worker panicked: {e}")),
            })??;
            debug!(package = %name, hash = %hash, "package file hash");
            self.package_file_hashes.lock().unwrap().insert(name, hash);
        }
        Ok(())
    }

    /// The memoized file hash for a package, when computed.
    pub fn package_file_hash(&self, package: &str) -> Option<String> {
        self.package_file_hashes
            .lock()
            .unwrap()
            .get(package)
            .cloned()
    }

    /// The memoized fingerprint for a task, when computed.
    pub fn task_hash(&self, task_id: &TaskId) -> Option<String> {
        self.task_hashes.lock().unwrap().get(task_id).cloned()
    }

    /// Compute (or return the memoized) fingerprint for one task.
    /// Dependency fingerprints must already exist; the scheduler's
    /// ordering guarantee provides that.
    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId,
        definition: &TaskDefinition,
        pass_through_args: &[String],
        dependencies: &BTreeSet<TaskId>,
    ) -> Result<String, HashError> {
        if let Some(existing) = self.task_hash(task_id) {
            return Ok(existing);
        }

        let package_file_hash = self
            .package_file_hash(&task_id.package)
            .ok_or_else(|| HashError::MissingPackageHash(task_id.package.clone()))?;

        // BTreeSet iteration is already sorted, which keeps the input
        // list canonical.
        let mut input_hashes = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let hash = self
                .task_hash(dep)
                .ok_or_else(|| HashError::MissingDependencyHash(dep.to_string()))?;
            input_hashes.push(hash);
        }

        let env_values: BTreeMap<&str, String> = definition
            .env
            .iter()
            .map(|name| (name.as_str(), std::env::var(name).unwrap_or_default()))
            .collect();

        let value = json!({
            "globalHash": self.global_hash,
            "packageFileHash": package_file_hash,
            "taskDefinition": definition.canonical_value(),
            "passThroughArgs": pass_through_args,
            "env": env_values,
            "inputHashes": input_hashes,
        });
        let computed = hash_value(&value);

        // Under a concurrent race both sides compute the same digest;
        // the first insert wins and every caller sees one value.
        let mut hashes = self.task_hashes.lock().unwrap();
        let hash = hashes
            .entry(task_id.clone())
            .or_insert(computed)
            .clone();
        debug!(task = %task_id, hash = %hash, "task hash");
        Ok(hash)
    }
}

/// Hash a package's files: tracked files from the SCM when available,
/// a directory walk otherwise.
fn hash_package_files(dir: &AbsolutePath, scm: Option<&Scm>) -> Result<String, HashError> {
    let files = match scm {
        Some(scm) => match scm.tracked_files(dir) {
            Ok(files) => files,
            Err(err) => {
                debug!(package = %dir, error = %err, "SCM listing failed, walking directory");
                walk_package_files(dir)?
            }
        },
        None => walk_package_files(dir)?,
    };

    let mut entries = Vec::with_capacity(files.len());
    for rel in files {
        let blob = hash_file_blob(&dir.join_unix(&rel))?;
        entries.push((rel, blob));
    }
    Ok(hash_file_list(entries))
}

/// Fallback file enumeration. Skips `.git`, `node_modules`, and
/// relay's own `.relay` bookkeeping, and does not descend into
/// symlinked directories.
fn walk_package_files(dir: &AbsolutePath) -> Result<Vec<RelativeUnixPath>, HashError> {
    fn walk(
        root: &AbsolutePath,
        current: &AbsolutePath,
        out: &mut Vec<RelativeUnixPath>,
    ) -> Result<(), HashError> {
        let entries =
            std::fs::read_dir(current.as_path()).map_err(|source| HashError::FileRead {
                path: current.as_path().to_path_buf(),
                source,
            })?;
        for entry in entries {
            let entry = entry.map_err(|source| HashError::FileRead {
                path: current.as_path().to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == ".git" || name == "node_modules" || name == ".relay" {
                continue;
            }
            let path = AbsolutePath::new_unchecked(entry.path());
            let metadata = path.symlink_metadata().map_err(|source| HashError::FileRead {
                path: path.as_path().to_path_buf(),
                source,
            })?;
            if metadata.is_dir() {
                walk(root, &path, out)?;
            } else if metadata.is_file() {
                out.push(path.relative_to(root)?);
            }
            // Symlinks are left to the SCM to describe; the walk
            // neither follows nor records them.
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::TaskConfig;
    use tempfile::TempDir;

    fn definition() -> TaskDefinition {
        TaskDefinition::from_config(&TaskConfig::default())
    }

    fn tracker_with_package(package: &str) -> HashTracker {
        let tracker = HashTracker::new("global".to_string());
        tracker
            .package_file_hashes
            .lock()
            .unwrap()
            .insert(package.to_string(), "filehash".to_string());
        tracker
    }

    #[test]
    fn test_task_hash_is_memoized() {
        let tracker = tracker_with_package("app");
        let id = TaskId::new("app", "build");
        let first = tracker
            .calculate_task_hash(&id, &definition(), &[], &BTreeSet::new())
            .unwrap();
        let second = tracker
            .calculate_task_hash(&id, &definition(), &[], &BTreeSet::new())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_task_hash_changes_with_args() {
        let tracker = tracker_with_package("app");
        let with_args = tracker
            .calculate_task_hash(
                &TaskId::new("app", "build"),
                &definition(),
                &["--minify".to_string()],
                &BTreeSet::new(),
            )
            .unwrap();
        let without_args = tracker
            .calculate_task_hash(
                &TaskId::new("app", "test"),
                &definition(),
                &[],
                &BTreeSet::new(),
            )
            .unwrap();
        assert_ne!(with_args, without_args);
    }

    #[test]
    fn test_task_hash_depends_on_inputs() {
        let tracker = tracker_with_package("app");
        let dep = TaskId::new("app", "codegen");
        tracker
            .task_hashes
            .lock()
            .unwrap()
            .insert(dep.clone(), "dephash-1".to_string());

        let deps = BTreeSet::from([dep.clone()]);
        let first = tracker
            .calculate_task_hash(&TaskId::new("app", "build"), &definition(), &[], &deps)
            .unwrap();

        // Same inputs in a fresh tracker with a different dependency
        // fingerprint produce a different hash.
        let other = tracker_with_package("app");
        other
            .task_hashes
            .lock()
            .unwrap()
            .insert(dep.clone(), "dephash-2".to_string());
        let second = other
            .calculate_task_hash(&TaskId::new("app", "build"), &definition(), &[], &deps)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_dependency_hash_is_an_error() {
        let tracker = tracker_with_package("app");
        let deps = BTreeSet::from([TaskId::new("app", "codegen")]);
        match tracker.calculate_task_hash(
            &TaskId::new("app", "build"),
            &definition(),
            &[],
            &deps,
        ) {
            Err(HashError::MissingDependencyHash(_)) => {}
            other => panic!("expected MissingDependencyHash, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_package_hash_is_an_error() {
        let tracker = HashTracker::new("global".to_string());
        match tracker.calculate_task_hash(
            &TaskId::new("app", "build"),
            &definition(),
            &[],
            &BTreeSet::new(),
        ) {
            Err(HashError::MissingPackageHash(_)) => {}
            other => panic!("expected MissingPackageHash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_calculate_file_hashes_walk_fallback() {
        let temp = TempDir::new().unwrap();
        let pkg = AbsolutePath::new_unchecked(temp.path());
        pkg.join("src").create_dir_all().unwrap();
        pkg.join("src").join("index.ts").write(b"export {}\n").unwrap();
        pkg.join("node_modules").create_dir_all().unwrap();
        pkg.join("node_modules").join("junk.js").write(b"x").unwrap();

        let tracker = HashTracker::new("global".to_string());
        tracker
            .calculate_file_hashes(vec![("pkg".to_string(), pkg.clone())], 2, None)
            .await
            .unwrap();
        let before = tracker.package_file_hash("pkg").unwrap();

        // node_modules contents do not affect the hash.
        pkg.join("node_modules").join("junk.js").write(b"y").unwrap();
        let other = HashTracker::new("global".to_string());
        other
            .calculate_file_hashes(vec![("pkg".to_string(), pkg.clone())], 2, None)
            .await
            .unwrap();
        assert_eq!(before, other.package_file_hash("pkg").unwrap());

        // Source contents do.
        pkg.join("src").join("index.ts").write(b"changed\n").unwrap();
        let changed = HashTracker::new("global".to_string());
        changed
            .calculate_file_hashes(vec![("pkg".to_string(), pkg)], 2, None)
            .await
            .unwrap();
        assert_ne!(before, changed.package_file_hash("pkg").unwrap());
    }
}
