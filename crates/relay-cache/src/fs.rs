//! Local filesystem cache
//!
//! Artifacts are stored as literal file trees: `<dir>/<hash>/…` mirrors
//! the workspace-relative layout of the captured outputs, and
//! `<dir>/<hash>-meta.json` records the original task duration so a
//! later hit can report time saved. Files move in and out of the cache
//! by hard link where the filesystem allows it, by copy otherwise.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use relay_core::paths::AbsolutePath;

use crate::{Cache, CacheError, CacheHit};

/// Metadata persisted alongside each artifact.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

/// Local filesystem cache backend.
#[derive(Debug, Clone)]
pub struct FsCache {
    cache_dir: AbsolutePath,
}

impl FsCache {
    pub fn new(cache_dir: AbsolutePath) -> Self {
        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> &AbsolutePath {
        &self.cache_dir
    }

    fn artifact_dir(&self, hash: &str) -> AbsolutePath {
        self.cache_dir.join(hash)
    }

    fn meta_path(&self, hash: &str) -> AbsolutePath {
        self.cache_dir.join(format!("{hash}-meta.json"))
    }

    /// Remove artifacts older than `max_age`, judged by the artifact
    /// directory's modification time.
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        let mut stats = PruneStats::default();
        if !self.cache_dir.exists() {
            return Ok(stats);
        }
        let cutoff = SystemTime::now().checked_sub(max_age);

        for entry in std::fs::read_dir(self.cache_dir.as_path())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            stats.total += 1;
            let expired = match (entry.metadata().and_then(|m| m.modified()), cutoff) {
                (Ok(modified), Some(cutoff)) => modified < cutoff,
                _ => false,
            };
            if expired {
                let hash = entry.file_name().to_string_lossy().to_string();
                if std::fs::remove_dir_all(entry.path()).is_ok() {
                    let _ = self.meta_path(&hash).remove_file();
                    stats.removed += 1;
                    continue;
                }
            }
            stats.kept += 1;
        }
        Ok(stats)
    }

    /// Entry count and total size of the cache directory.
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        if !self.cache_dir.exists() {
            return Ok(stats);
        }
        for entry in std::fs::read_dir(self.cache_dir.as_path())? {
            let entry = entry?;
            if entry.path().is_dir() {
                stats.entries += 1;
            }
            stats.total_size += tree_size(&entry.path())?;
        }
        Ok(stats)
    }

    /// Remove every cached artifact.
    pub fn clean_all(&self) -> Result<(), CacheError> {
        if self.cache_dir.exists() {
            std::fs::remove_dir_all(self.cache_dir.as_path())?;
        }
        Ok(())
    }
}

fn tree_size(path: &std::path::Path) -> Result<u64, CacheError> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += tree_size(&entry?.path())?;
    }
    Ok(total)
}

#[async_trait]
impl Cache for FsCache {
    #[instrument(skip_all, fields(hash, files = files.len()))]
    async fn put(
        &self,
        root: &AbsolutePath,
        hash: &str,
        duration_ms: u64,
        files: &[AbsolutePath],
    ) -> Result<(), CacheError> {
        let artifact_dir = self.artifact_dir(hash);
        artifact_dir.create_dir_all()?;

        // One linker pool per put, sized to hardware parallelism.
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut workers: JoinSet<Result<(), CacheError>> = JoinSet::new();

        for file in files {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let root = root.clone();
            let artifact_dir = artifact_dir.clone();
            let file = file.clone();
            workers.spawn(async move {
                let result =
                    tokio::task::spawn_blocking(move || store_file(&root, &artifact_dir, &file))
                        .await
                        .map_err(|e| {
                            CacheError::Io(std::io::Error::other(format!(
                                "cache worker panicked: {e}"
                            )))
                        })?;
                drop(permit);
                result
            });
        }

        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| {
                CacheError::Io(std::io::Error::other(format!("cache worker panicked: {e}")))
            })??;
        }

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration: duration_ms,
        };
        self.meta_path(hash).write(serde_json::to_vec(&meta)?)?;
        debug!(hash, "stored artifact in filesystem cache");
        Ok(())
    }

    async fn fetch(
        &self,
        root: &AbsolutePath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        let artifact_dir = self.artifact_dir(hash);
        if !artifact_dir.exists() {
            debug!(hash, "filesystem cache miss");
            return Ok(None);
        }

        let mut restored = Vec::new();
        restore_tree(&artifact_dir, &artifact_dir, root, &mut restored)?;

        let meta: CacheMetadata = serde_json::from_slice(&self.meta_path(hash).read()?)?;
        debug!(hash, files = restored.len(), "filesystem cache hit");
        Ok(Some(CacheHit {
            files: restored,
            duration_ms: meta.duration,
        }))
    }

    async fn clean(&self, hash: &str) -> Result<(), CacheError> {
        let artifact_dir = self.artifact_dir(hash);
        if artifact_dir.exists() {
            std::fs::remove_dir_all(artifact_dir.as_path())?;
        }
        let meta = self.meta_path(hash);
        if meta.exists() {
            meta.remove_file()?;
        }
        Ok(())
    }
}

fn store_file(
    root: &AbsolutePath,
    artifact_dir: &AbsolutePath,
    file: &AbsolutePath,
) -> Result<(), CacheError> {
    let metadata = file.symlink_metadata()?;
    if metadata.is_dir() {
        // Directories materialize from the files below them.
        return Ok(());
    }
    let rel = file.relative_to(root)?;
    let dest = artifact_dir.join_unix(&rel);
    dest.ensure_parent_dir()?;
    link_or_copy(file, &dest)
}

/// Hard-link `from` to `to`, falling back to a copy. Symlinks are
/// recreated rather than linked: hard links to symlinks do not behave
/// consistently across platforms.
pub(crate) fn link_or_copy(from: &AbsolutePath, to: &AbsolutePath) -> Result<(), CacheError> {
    let metadata = from.symlink_metadata()?;
    if to.exists() {
        to.remove_file()?;
    }
    if metadata.file_type().is_symlink() {
        let target = from.read_link()?;
        to.symlink_to(target)?;
        return Ok(());
    }
    if from.hard_link_to(to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from.as_path(), to.as_path())?;
    Ok(())
}

/// Recursively link-or-copy a cached tree into the workspace. Does not
/// descend into symlinked directories: the link itself is recreated.
fn restore_tree(
    artifact_root: &AbsolutePath,
    current: &AbsolutePath,
    workspace_root: &AbsolutePath,
    restored: &mut Vec<AbsolutePath>,
) -> Result<(), CacheError> {
    for entry in std::fs::read_dir(current.as_path())? {
        let entry = entry?;
        let source = AbsolutePath::new_unchecked(entry.path());
        let rel = source.relative_to(artifact_root)?;
        let dest = workspace_root.join_unix(&rel);
        let metadata = source.symlink_metadata()?;

        if metadata.is_dir() {
            dest.create_dir_all()?;
            restore_tree(artifact_root, &source, workspace_root, restored)?;
        } else {
            dest.ensure_parent_dir()?;
            link_or_copy(&source, &dest)?;
            restored.push(dest);
        }
    }
    Ok(())
}

/// Statistics from a prune operation.
#[derive(Debug, Default)]
pub struct PruneStats {
    pub total: usize,
    pub removed: usize,
    pub kept: usize,
}

/// Cache directory statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
}

impl CacheStats {
    /// Total size in human-readable form.
    pub fn formatted_size(&self) -> String {
        const KIB: f64 = 1024.0;
        let size = self.total_size as f64;
        if size < KIB {
            format!("{} B", self.total_size)
        } else if size < KIB * KIB {
            format!("{:.1} KB", size / KIB)
        } else if size < KIB * KIB * KIB {
            format!("{:.1} MB", size / (KIB * KIB))
        } else {
            format!("{:.1} GB", size / (KIB * KIB * KIB))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_outputs(root: &AbsolutePath) -> Vec<AbsolutePath> {
        let dist = root.join("packages").join("a").join("dist");
        dist.create_dir_all().unwrap();
        dist.join("main.js").write(b"bundle\n").unwrap();
        dist.join("main.js.map").write(b"map\n").unwrap();
        vec![dist.join("main.js"), dist.join("main.js.map")]
    }

    #[tokio::test]
    async fn test_put_then_fetch_roundtrip() {
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());
        let files = write_outputs(&root);

        let cache_dir = TempDir::new().unwrap();
        let cache = FsCache::new(AbsolutePath::new_unchecked(cache_dir.path()));
        cache.put(&root, "abc123", 1500, &files).await.unwrap();

        let restore = TempDir::new().unwrap();
        let restore_root = AbsolutePath::new_unchecked(restore.path());
        let hit = cache.fetch(&restore_root, "abc123").await.unwrap().unwrap();

        assert_eq!(hit.duration_ms, 1500);
        assert_eq!(hit.files.len(), 2);
        assert_eq!(
            restore_root
                .join("packages")
                .join("a")
                .join("dist")
                .join("main.js")
                .read()
                .unwrap(),
            b"bundle\n"
        );
    }

    #[tokio::test]
    async fn test_fetch_miss() {
        let cache_dir = TempDir::new().unwrap();
        let cache = FsCache::new(AbsolutePath::new_unchecked(cache_dir.path()));
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());

        assert!(cache.fetch(&root, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_preserves_symlinks() {
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());
        let dist = root.join("dist");
        dist.create_dir_all().unwrap();
        dist.join("real.js").write(b"real\n").unwrap();
        dist.join("alias.js").symlink_to("real.js").unwrap();

        let cache_dir = TempDir::new().unwrap();
        let cache = FsCache::new(AbsolutePath::new_unchecked(cache_dir.path()));
        cache
            .put(
                &root,
                "withlink",
                10,
                &[dist.join("real.js"), dist.join("alias.js")],
            )
            .await
            .unwrap();

        let restore = TempDir::new().unwrap();
        let restore_root = AbsolutePath::new_unchecked(restore.path());
        cache.fetch(&restore_root, "withlink").await.unwrap().unwrap();

        let alias = restore_root.join("dist").join("alias.js");
        assert!(alias.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(alias.read().unwrap(), b"real\n");
    }

    #[tokio::test]
    async fn test_clean_removes_entry() {
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());
        let files = write_outputs(&root);

        let cache_dir = TempDir::new().unwrap();
        let cache = FsCache::new(AbsolutePath::new_unchecked(cache_dir.path()));
        cache.put(&root, "gone", 5, &files).await.unwrap();

        cache.clean("gone").await.unwrap();
        assert!(cache.fetch(&root, "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_counts_entries() {
        let ws = TempDir::new().unwrap();
        let root = AbsolutePath::new_unchecked(ws.path());
        let files = write_outputs(&root);

        let cache_dir = TempDir::new().unwrap();
        let cache = FsCache::new(AbsolutePath::new_unchecked(cache_dir.path()));
        assert_eq!(cache.status().unwrap().entries, 0);

        cache.put(&root, "one", 5, &files).await.unwrap();
        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 1);
        assert!(stats.total_size > 0);
    }

    #[test]
    fn test_formatted_size() {
        let stats = CacheStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");
        let stats = CacheStats {
            entries: 0,
            total_size: 12,
        };
        assert_eq!(stats.formatted_size(), "12 B");
    }
}
