//! Image Verifier (C3)

use chrono::{DateTime, Utc};
use hv_types::manifest::{ArtifactType, TrustedManifest};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub verified: bool,
    pub path: String,
    pub expected_hash: Option<String>,
    pub actual_hash: String,
    pub verified_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Stateless beyond the currently loaded manifest; [`load_manifest`]
/// replaces the previous one wholesale.
#[derive(Debug, Default)]
pub struct ImageVerifier {
    manifest: Option<TrustedManifest>,
}

impl ImageVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_manifest(&mut self, manifest: TrustedManifest) {
        self.manifest = Some(manifest);
    }

    /// Verify `(artifact_type, key, data)` against the loaded manifest.
    pub fn verify(
        &self,
        artifact_type: ArtifactType,
        key: &str,
        data: &[u8],
    ) -> VerificationResult {
        let actual_hash = hex::encode(Sha256::digest(data));
        let now = Utc::now();

        let Some(manifest) = &self.manifest else {
            return VerificationResult {
                verified: false,
                path: key.to_string(),
                expected_hash: None,
                actual_hash,
                verified_at: now,
                error: Some("no manifest loaded".into()),
            };
        };

        let digests = manifest.digests_for(artifact_type);
        let Some(expected) = digests.get(key) else {
            return VerificationResult {
                verified: false,
                path: key.to_string(),
                expected_hash: None,
                actual_hash,
                verified_at: now,
                error: Some(format!("key \"{key}\" not found in manifest")),
            };
        };

        if expected.eq_ignore_ascii_case(&actual_hash) {
            VerificationResult {
                verified: true,
                path: key.to_string(),
                expected_hash: Some(expected.clone()),
                actual_hash,
                verified_at: now,
                error: None,
            }
        } else {
            VerificationResult {
                verified: false,
                path: key.to_string(),
                expected_hash: Some(expected.clone()),
                actual_hash,
                verified_at: now,
                error: Some("hash mismatch".into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manifest() -> TrustedManifest {
        let mut images = HashMap::new();
        images.insert("/img".to_string(), hex::encode(Sha256::digest(b"A")));
        TrustedManifest {
            version: "1".into(),
            images,
            kernels: HashMap::new(),
            plugins: HashMap::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn verifies_matching_digest() {
        let mut verifier = ImageVerifier::new();
        verifier.load_manifest(manifest());
        let result = verifier.verify(ArtifactType::Images, "/img", b"A");
        assert!(result.verified);
    }

    #[test]
    fn mismatch_reports_hash_mismatch() {
        let mut verifier = ImageVerifier::new();
        verifier.load_manifest(manifest());
        let result = verifier.verify(ArtifactType::Images, "/img", b"B");
        assert!(!result.verified);
        assert!(result.error.unwrap().contains("hash mismatch"));
    }

    #[test]
    fn missing_key_reports_not_found() {
        let mut verifier = ImageVerifier::new();
        verifier.load_manifest(manifest());
        let result = verifier.verify(ArtifactType::Images, "/other", b"A");
        assert!(!result.verified);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[test]
    fn no_manifest_loaded() {
        let verifier = ImageVerifier::new();
        let result = verifier.verify(ArtifactType::Images, "/img", b"A");
        assert!(!result.verified);
        assert!(result.error.unwrap().contains("no manifest"));
    }

    #[test]
    fn loading_new_manifest_replaces_old() {
        let mut verifier = ImageVerifier::new();
        verifier.load_manifest(manifest());
        verifier.load_manifest(TrustedManifest::default());
        let result = verifier.verify(ArtifactType::Images, "/img", b"A");
        assert!(!result.verified);
    }
}
