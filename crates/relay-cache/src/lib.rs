//! Cache backends for the relay task runner
//!
//! Three interchangeable backends sit behind one [`Cache`] interface:
//! a local filesystem tree, an asynchronous write-through queue
//! wrapping another backend, and a remote HTTP cache with optional
//! HMAC artifact signing. [`MultiCache`] composes them: fetch tries
//! backends in order and the first hit wins; put fans out to all.

pub mod archive;
pub mod async_cache;
pub mod fs;
pub mod http;
pub mod multi;
pub mod signature;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use relay_core::paths::AbsolutePath;

pub use async_cache::AsyncCache;
pub use fs::FsCache;
pub use http::HttpCache;
pub use multi::MultiCache;
pub use signature::ArtifactSignature;

/// A successful fetch: the restored files and the original task
/// duration recorded when the artifact was stored.
#[derive(Debug)]
pub struct CacheHit {
    pub files: Vec<AbsolutePath>,
    pub duration_ms: u64,
}

/// One cache backend.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store the given workspace files under `hash`.
    async fn put(
        &self,
        root: &AbsolutePath,
        hash: &str,
        duration_ms: u64,
        files: &[AbsolutePath],
    ) -> Result<(), CacheError>;

    /// Restore the artifact stored under `hash` into `root`. A miss is
    /// `Ok(None)`, not an error.
    async fn fetch(&self, root: &AbsolutePath, hash: &str)
        -> Result<Option<CacheHit>, CacheError>;

    /// Remove the entry stored under `hash`, where the backend supports
    /// removal at all.
    async fn clean(&self, _hash: &str) -> Result<(), CacheError> {
        Ok(())
    }

    /// Flush and release backend resources. The async backend blocks
    /// here until its queue drains.
    async fn shutdown(&self) {}
}

/// Errors from cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Every backend was disabled by configuration
    #[error("no caches are enabled")]
    NoCachesEnabled,

    /// Local cache IO failure
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored path could not be expressed relative to the workspace
    #[error(transparent)]
    Path(#[from] relay_core::error::PathError),

    /// Cache metadata could not be read or written
    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Remote cache transport failure. Degrades the backend, never the
    /// task.
    #[error("remote cache request failed: {0}")]
    Transport(String),

    /// Artifact failed signature verification. Treated as a miss.
    #[error("artifact verification failed: {0}")]
    Integrity(String),

    /// The artifact stream could not be decoded
    #[error("corrupt cache artifact: {0}")]
    CorruptArtifact(String),
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Transport(err.to_string())
    }
}

impl CacheError {
    /// Whether this error should degrade the backend for the rest of
    /// the run, as opposed to being handled per-artifact.
    pub fn disables_backend(&self) -> bool {
        matches!(self, CacheError::Transport(_))
    }
}

/// Remote cache configuration.
#[derive(Debug, Clone)]
pub struct RemoteCacheOpts {
    pub api_url: String,
    pub token: String,
    pub team_id: String,
    pub signature: bool,
}

/// Cache assembly options.
#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Local cache directory
    pub dir: AbsolutePath,
    /// Async write-through worker count
    pub workers: usize,
    /// Exclude the filesystem backend
    pub skip_filesystem: bool,
    /// Exclude the remote backend
    pub skip_remote: bool,
    /// Remote backend configuration, when available
    pub remote: Option<RemoteCacheOpts>,
}

/// The default local cache location under a workspace root.
pub fn default_cache_location(root: &AbsolutePath) -> AbsolutePath {
    root.join("node_modules").join(".cache").join("relay")
}

/// Assemble the multi-cache from options. The remote backend, when
/// enabled, is wrapped in the async write-through queue so uploads do
/// not block the run.
pub fn new_multi_cache(opts: &CacheOpts) -> Result<MultiCache, CacheError> {
    let mut backends: Vec<(&'static str, Arc<dyn Cache>)> = Vec::new();

    if !opts.skip_filesystem {
        backends.push(("filesystem", Arc::new(FsCache::new(opts.dir.clone()))));
    }
    if !opts.skip_remote {
        if let Some(remote) = &opts.remote {
            let http: Arc<dyn Cache> = Arc::new(HttpCache::new(remote.clone()));
            backends.push(("remote", Arc::new(AsyncCache::new(http, opts.workers))));
        }
    }

    if backends.is_empty() {
        return Err(CacheError::NoCachesEnabled);
    }
    Ok(MultiCache::new(backends))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_caches_enabled() {
        let opts = CacheOpts {
            dir: AbsolutePath::new_unchecked("/tmp/cache"),
            workers: 2,
            skip_filesystem: true,
            skip_remote: true,
            remote: None,
        };
        match new_multi_cache(&opts) {
            Err(CacheError::NoCachesEnabled) => {}
            Err(other) => panic!("expected NoCachesEnabled, got {other}"),
            Ok(_) => panic!("expected NoCachesEnabled, got a cache"),
        }
    }

    #[test]
    fn test_default_cache_location() {
        let root = AbsolutePath::new_unchecked("/ws");
        let dir = default_cache_location(&root);
        assert!(dir.to_string_lossy().ends_with("relay"));
        assert!(dir.to_string_lossy().contains("node_modules"));
    }
}
