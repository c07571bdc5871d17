//! Remote HTTP cache
//!
//! Artifacts are uploaded as gzip tar bodies to
//! `PUT /v8/artifacts/<hash>` and fetched back with a GET on the same
//! path. A 404 is a clean miss. The original task duration rides in
//! the `x-artifact-duration` header, the HMAC signature (when signing
//! is enabled) in `x-artifact-tag`. A counting semaphore bounds
//! concurrent remote operations.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use relay_core::paths::AbsolutePath;

use crate::{archive, ArtifactSignature, Cache, CacheError, CacheHit, RemoteCacheOpts};

const DURATION_HEADER: &str = "x-artifact-duration";
const TAG_HEADER: &str = "x-artifact-tag";

/// Maximum concurrent remote operations.
const REQUEST_LIMIT: usize = 20;

/// Remote HTTP cache backend.
pub struct HttpCache {
    client: reqwest::Client,
    opts: RemoteCacheOpts,
    signer: ArtifactSignature,
    request_limiter: Semaphore,
}

impl HttpCache {
    pub fn new(opts: RemoteCacheOpts) -> Self {
        let signer = ArtifactSignature::new(opts.signature, opts.team_id.clone());
        Self {
            client: reqwest::Client::new(),
            opts,
            signer,
            request_limiter: Semaphore::new(REQUEST_LIMIT),
        }
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!(
            "{}/v8/artifacts/{}?teamId={}",
            self.opts.api_url.trim_end_matches('/'),
            hash,
            self.opts.team_id
        )
    }
}

#[async_trait]
impl Cache for HttpCache {
    #[instrument(skip_all, fields(hash))]
    async fn put(
        &self,
        root: &AbsolutePath,
        hash: &str,
        duration_ms: u64,
        files: &[AbsolutePath],
    ) -> Result<(), CacheError> {
        let _permit = self
            .request_limiter
            .acquire()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        // The uploader needs a known content length, so the artifact is
        // built fully in memory; the signature is computed over the
        // same buffer.
        let body = archive::create(root, files)?;

        let mut request = self
            .client
            .put(self.artifact_url(hash))
            .header(AUTHORIZATION, format!("Bearer {}", self.opts.token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(DURATION_HEADER, duration_ms.to_string());
        if self.signer.is_enabled() {
            request = request.header(TAG_HEADER, self.signer.generate_tag(hash, &body)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CacheError::Transport(format!(
                "artifact upload returned {status}: {message}"
            )));
        }
        debug!(hash, "uploaded artifact to remote cache");
        Ok(())
    }

    #[instrument(skip_all, fields(hash))]
    async fn fetch(
        &self,
        root: &AbsolutePath,
        hash: &str,
    ) -> Result<Option<CacheHit>, CacheError> {
        let _permit = self
            .request_limiter
            .acquire()
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;

        let response = self
            .client
            .get(self.artifact_url(hash))
            .header(AUTHORIZATION, format!("Bearer {}", self.opts.token))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(hash, "remote cache miss");
                return Ok(None);
            }
            StatusCode::OK => {}
            status => {
                let message = response.text().await.unwrap_or_default();
                return Err(CacheError::Transport(format!(
                    "artifact download returned {status}: {message}"
                )));
            }
        }

        let duration_ms = match response.headers().get(DURATION_HEADER) {
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| {
                    CacheError::Transport(format!("invalid {DURATION_HEADER} header"))
                })?,
            None => 0,
        };
        let tag = response
            .headers()
            .get(TAG_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await?;

        if self.signer.is_enabled() {
            let tag = tag.ok_or_else(|| {
                CacheError::Integrity(format!(
                    "downloaded artifact is missing the required {TAG_HEADER} header"
                ))
            })?;
            if !self.signer.validate(hash, &body, &tag)? {
                return Err(CacheError::Integrity(
                    "artifact tag does not match the expected tag".to_string(),
                ));
            }
        }

        let files = archive::extract(root, &body)?;
        debug!(hash, files = files.len(), "remote cache hit");
        Ok(Some(CacheHit { files, duration_ms }))
    }
}
