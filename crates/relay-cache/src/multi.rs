//! Multi-cache composition
//!
//! Fetch tries backends in order and the first hit wins. Put fans out
//! to every backend; one backend's failure never blocks the others.
//! A backend that reports a transport failure is warned about once and
//! then disabled for the rest of the run — remote trouble degrades
//! caching, it does not fail tasks. Integrity failures are treated as
//! misses for that artifact only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use relay_core::paths::AbsolutePath;

use crate::{Cache, CacheHit};

struct Backend {
    label: &'static str,
    cache: Arc<dyn Cache>,
    disabled: AtomicBool,
}

impl Backend {
    fn disable(&self, err: &crate::CacheError) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            warn!(backend = self.label, error = %err, "cache backend unavailable, disabling for this run");
        }
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

/// Ordered composition of cache backends.
pub struct MultiCache {
    backends: Vec<Backend>,
}

impl MultiCache {
    pub fn new(backends: Vec<(&'static str, Arc<dyn Cache>)>) -> Self {
        Self {
            backends: backends
                .into_iter()
                .map(|(label, cache)| Backend {
                    label,
                    cache,
                    disabled: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    /// A multi-cache with no backends: every fetch misses and every
    /// put is dropped. Used when caching is fully disabled but the run
    /// proceeds.
    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Fan out to every live backend. Failures are logged, never
    /// propagated: by the time outputs are saved the task has already
    /// succeeded.
    pub async fn put(
        &self,
        root: &AbsolutePath,
        hash: &str,
        duration_ms: u64,
        files: &[AbsolutePath],
    ) {
        for backend in &self.backends {
            if backend.is_disabled() {
                continue;
            }
            if let Err(err) = backend.cache.put(root, hash, duration_ms, files).await {
                if err.disables_backend() {
                    backend.disable(&err);
                } else {
                    warn!(backend = backend.label, hash, error = %err, "cache write failed");
                }
            }
        }
    }

    /// First hit wins. Transport errors disable the backend;
    /// integrity errors downgrade to a miss so the task executes.
    pub async fn fetch(&self, root: &AbsolutePath, hash: &str) -> Option<CacheHit> {
        for backend in &self.backends {
            if backend.is_disabled() {
                continue;
            }
            match backend.cache.fetch(root, hash).await {
                Ok(Some(hit)) => return Some(hit),
                Ok(None) => continue,
                Err(err) => {
                    if err.disables_backend() {
                        backend.disable(&err);
                    } else {
                        warn!(backend = backend.label, hash, error = %err, "treating unreadable artifact as a miss");
                    }
                }
            }
        }
        None
    }

    /// Shut backends down in reverse creation order.
    pub async fn shutdown(&self) {
        for backend in self.backends.iter().rev() {
            backend.cache.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheError, CacheHit};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedCache {
        hit: bool,
        fail_transport: bool,
        fetches: AtomicUsize,
        puts: AtomicUsize,
    }

    impl ScriptedCache {
        fn new(hit: bool, fail_transport: bool) -> Arc<Self> {
            Arc::new(Self {
                hit,
                fail_transport,
                fetches: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Cache for ScriptedCache {
        async fn put(
            &self,
            _root: &AbsolutePath,
            _hash: &str,
            _duration_ms: u64,
            _files: &[AbsolutePath],
        ) -> Result<(), CacheError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(CacheError::Transport("connection refused".to_string()));
            }
            Ok(())
        }

        async fn fetch(
            &self,
            _root: &AbsolutePath,
            _hash: &str,
        ) -> Result<Option<CacheHit>, CacheError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(CacheError::Transport("connection refused".to_string()));
            }
            if self.hit {
                Ok(Some(CacheHit {
                    files: Vec::new(),
                    duration_ms: 42,
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn test_first_hit_wins() {
        let first = ScriptedCache::new(true, false);
        let second = ScriptedCache::new(true, false);
        let multi = MultiCache::new(vec![
            ("first", first.clone() as Arc<dyn Cache>),
            ("second", second.clone() as Arc<dyn Cache>),
        ]);

        let root = AbsolutePath::new_unchecked("/ws");
        let hit = multi.fetch(&root, "h").await.unwrap();
        assert_eq!(hit.duration_ms, 42);
        assert_eq!(first.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(second.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_miss_falls_through() {
        let first = ScriptedCache::new(false, false);
        let second = ScriptedCache::new(true, false);
        let multi = MultiCache::new(vec![
            ("first", first as Arc<dyn Cache>),
            ("second", second as Arc<dyn Cache>),
        ]);

        let root = AbsolutePath::new_unchecked("/ws");
        assert!(multi.fetch(&root, "h").await.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_disables_backend() {
        let flaky = ScriptedCache::new(false, true);
        let solid = ScriptedCache::new(true, false);
        let multi = MultiCache::new(vec![
            ("flaky", flaky.clone() as Arc<dyn Cache>),
            ("solid", solid as Arc<dyn Cache>),
        ]);

        let root = AbsolutePath::new_unchecked("/ws");
        assert!(multi.fetch(&root, "h1").await.is_some());
        assert!(multi.fetch(&root, "h2").await.is_some());
        // The flaky backend was consulted exactly once.
        assert_eq!(flaky.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_put_fans_out_despite_failures() {
        let flaky = ScriptedCache::new(false, true);
        let solid = ScriptedCache::new(false, false);
        let multi = MultiCache::new(vec![
            ("flaky", flaky.clone() as Arc<dyn Cache>),
            ("solid", solid.clone() as Arc<dyn Cache>),
        ]);

        let root = AbsolutePath::new_unchecked("/ws");
        multi.put(&root, "h", 0, &[]).await;
        assert_eq!(flaky.puts.load(Ordering::SeqCst), 1);
        assert_eq!(solid.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_multi_cache_misses() {
        let multi = MultiCache::empty();
        let root = AbsolutePath::new_unchecked("/ws");
        assert!(multi.fetch(&root, "h").await.is_none());
        multi.put(&root, "h", 0, &[]).await;
        multi.shutdown().await;
    }
}
