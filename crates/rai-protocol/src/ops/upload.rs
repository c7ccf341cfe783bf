//! Upload types.
//!
//! A staged source bundle, addressed by content.

use serde::{Deserialize, Serialize};

/// Reference to a source bundle staged on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRef {
    /// Broker-side key the worker fetches the bundle from.
    pub key: String,
    /// SHA-256 hex digest of the bundle bytes.
    pub sha256: String,
    /// Bundle length in bytes.
    pub size_bytes: u64,
    /// Archive format of the bundle.
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "tar".to_string()
}

impl UploadRef {
    /// Create a reference to a tar bundle.
    pub fn tar(key: impl Into<String>, sha256: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            key: key.into(),
            sha256: sha256.into(),
            size_bytes,
            format: default_format(),
        }
    }
}
