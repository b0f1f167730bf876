//! Trusted Manifest.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Images,
    Kernels,
    Plugins,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustedManifest {
    pub version: String,
    #[serde(default)]
    pub images: HashMap<String, String>,
    #[serde(default)]
    pub kernels: HashMap<String, String>,
    #[serde(default)]
    pub plugins: HashMap<String, String>,
    pub updated_at: i64,
}

impl TrustedManifest {
    pub fn digests_for(&self, artifact_type: ArtifactType) -> &HashMap<String, String> {
        match artifact_type {
            ArtifactType::Images => &self.images,
            ArtifactType::Kernels => &self.kernels,
            ArtifactType::Plugins => &self.plugins,
        }
    }
}
