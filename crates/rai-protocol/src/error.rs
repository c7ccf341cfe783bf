//! Rejection types reported by the broker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes a broker attaches to a rejected operation.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request or invalid field values.
    InvalidRequest,
    /// The credential presented with the request was not accepted.
    Unauthorized,
    /// The named queue does not exist.
    QueueNotFound,
    /// The uploaded artifact was refused by the staging area.
    UploadRejected,
    /// Upload exceeds the maximum allowed size.
    PayloadTooLarge,
    /// The broker throttled the submission.
    RateLimited,
    /// The broker is unreachable or shutting down.
    Unavailable,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::QueueNotFound => write!(f, "QUEUE_NOT_FOUND"),
            Self::UploadRejected => write!(f, "UPLOAD_REJECTED"),
            Self::PayloadTooLarge => write!(f, "PAYLOAD_TOO_LARGE"),
            Self::RateLimited => write!(f, "RATE_LIMITED"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// A rejected broker operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line message.
    /// Must not contain secrets.
    pub message: String,
}

impl Rejection {
    /// Create a new rejection.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a QUEUE_NOT_FOUND rejection.
    pub fn queue_not_found(queue: &str) -> Self {
        Self::new(ErrorCode::QueueNotFound, format!("queue '{}' does not exist", queue))
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
