//! Publish operation types.
//!
//! Announces a job to a queue, referencing a previously staged upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::upload::UploadRef;

/// Classification attached to a job for downstream grading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "label", rename_all = "lowercase")]
pub enum SubmissionTag {
    M1,
    M2,
    M3,
    M4,
    Final,
    /// Free-form tag, carried verbatim.
    Custom(String),
}

impl SubmissionTag {
    /// The label the tag was resolved from.
    pub fn as_str(&self) -> &str {
        match self {
            Self::M1 => "m1",
            Self::M2 => "m2",
            Self::M3 => "m3",
            Self::M4 => "m4",
            Self::Final => "final",
            Self::Custom(label) => label,
        }
    }

    /// Whether this is one of the fixed milestone tags.
    pub fn is_milestone(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for SubmissionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `name` can be used as a queue name.
///
/// A queue name is a single path-safe component: ASCII letters, digits,
/// `_`, `.` and `-`, and never `.` or `..`.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Publish request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Schema identifier.
    pub schema_id: String,
    /// Unique job identifier, chosen by the client.
    pub job_id: String,
    /// Queue the job is enqueued on.
    pub queue: String,
    /// The staged source bundle.
    pub upload: UploadRef,
    /// Raw build file contents.
    pub build_file: String,
    /// Submission classification, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<SubmissionTag>,
    /// Whether the broker should apply its submission throttling.
    pub rate_limit: bool,
    /// SHA-256 hex digest of the application secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_digest: Option<String>,
    /// Client version string.
    pub client_version: String,
    /// When the request was built.
    pub created_at: DateTime<Utc>,
}

/// Publish acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// The job ID (echoed).
    pub job_id: String,
    /// Queue the job landed on.
    pub queue: String,
    /// When the broker accepted the job.
    pub accepted_at: DateTime<Utc>,
}
