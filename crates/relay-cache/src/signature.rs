//! Artifact signature authentication
//!
//! When signing is enabled, every uploaded artifact carries an
//! HMAC-SHA256 tag over `hash || artifact bytes`, keyed by the team
//! identifier, and every download must present a tag that verifies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::CacheError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC signer/verifier for cache artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactSignature {
    enabled: bool,
    team_id: String,
}

impl ArtifactSignature {
    pub fn new(enabled: bool, team_id: impl Into<String>) -> Self {
        Self {
            enabled,
            team_id: team_id.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn mac(&self, hash: &str, artifact: &[u8]) -> Result<HmacSha256, CacheError> {
        let mut mac = HmacSha256::new_from_slice(self.team_id.as_bytes())
            .map_err(|e| CacheError::Integrity(e.to_string()))?;
        mac.update(hash.as_bytes());
        mac.update(artifact);
        Ok(mac)
    }

    /// Produce the base64 tag for an artifact about to be uploaded.
    pub fn generate_tag(&self, hash: &str, artifact: &[u8]) -> Result<String, CacheError> {
        let mac = self.mac(hash, artifact)?;
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Verify a downloaded artifact against its presented tag.
    pub fn validate(
        &self,
        hash: &str,
        artifact: &[u8],
        expected_tag: &str,
    ) -> Result<bool, CacheError> {
        let expected = BASE64
            .decode(expected_tag)
            .map_err(|e| CacheError::Integrity(format!("malformed artifact tag: {e}")))?;
        let mac = self.mac(hash, artifact)?;
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let signer = ArtifactSignature::new(true, "team_abc");
        let tag = signer.generate_tag("deadbeef", b"artifact bytes").unwrap();
        assert!(signer.validate("deadbeef", b"artifact bytes", &tag).unwrap());
    }

    #[test]
    fn test_tampered_artifact_fails() {
        let signer = ArtifactSignature::new(true, "team_abc");
        let tag = signer.generate_tag("deadbeef", b"artifact bytes").unwrap();
        assert!(!signer.validate("deadbeef", b"tampered bytes", &tag).unwrap());
    }

    #[test]
    fn test_wrong_team_fails() {
        let signer = ArtifactSignature::new(true, "team_abc");
        let verifier = ArtifactSignature::new(true, "team_xyz");
        let tag = signer.generate_tag("deadbeef", b"artifact bytes").unwrap();
        assert!(!verifier.validate("deadbeef", b"artifact bytes", &tag).unwrap());
    }

    #[test]
    fn test_malformed_tag_is_integrity_error() {
        let signer = ArtifactSignature::new(true, "team_abc");
        match signer.validate("deadbeef", b"bytes", "not-base64!!!") {
            Err(CacheError::Integrity(_)) => {}
            other => panic!("expected Integrity error, got {other:?}"),
        }
    }
}
