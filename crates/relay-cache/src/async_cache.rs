//! Asynchronous write-through cache
//!
//! Wraps another backend so `put` returns as soon as the request is
//! queued. A fixed pool of workers drains the queue; the queue is
//! bounded, so producers block when writes fall far enough behind.
//! Fetch and clean stay synchronous pass-throughs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use relay_core::paths::AbsolutePath;

use crate::{Cache, CacheError, CacheHit};

struct CacheRequest {
    root: AbsolutePath,
    hash: String,
    duration_ms: u64,
    files: Vec<AbsolutePath>,
}

/// Async write-through wrapper around another cache backend.
pub struct AsyncCache {
    inner: Arc<dyn Cache>,
    sender: Mutex<Option<mpsc::Sender<CacheRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncCache {
    pub fn new(inner: Arc<dyn Cache>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<CacheRequest>(workers);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let receiver = receiver.clone();
            let backend = inner.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let request = { receiver.lock().await.recv().await };
                    let Some(request) = request else { break };
                    if let Err(err) = backend
                        .put(
                            &request.root,
                            &request.hash,
                            request.duration_ms,
                            &request.files,
                        )
                        .await
                    {
                        warn!(hash = %request.hash, error = %err, "async cache write failed");
                    }
                }
            }));
        }

        Self {
            inner,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }
}

#[async_trait]
impl Cache for AsyncCache {
    async fn put(
        &self,
        root: &AbsolutePath,
        hash: &str,
        duration_ms: u64,
        files: &[AbsolutePath],
    ) -> Result<(), CacheError> {
        let guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref() {
            // Blocks only when the queue is full: intentional
            // backpressure against a slow inner backend.
            let _ = sender
                .send(CacheRequest {
                    root: root.clone(),
                    hash: hash.to_string(),
                    duration_ms,
                    files: files.to_vec(),
                })
                .await;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        root: &AbsolutePath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        self.inner.fetch(root, hash).await
    }

    async fn clean(&self, hash: &str) -> Result<(), CacheError> {
        self.inner.clean(hash).await
    }

    /// Close the queue and wait for the workers to finish every
    /// enqueued write.
    async fn shutdown(&self) {
        self.sender.lock().await.take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        self.inner.shutdown().await;
    }
}
