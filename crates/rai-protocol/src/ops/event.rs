//! Job event types.
//!
//! Status and output pushed by the broker while a job runs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job is waiting for a worker.
    Queued,
    /// Job is actively executing.
    Running,
    /// Job completed successfully.
    Succeeded,
    /// Job completed with failure.
    Failed,
    /// The remote side gave up on the job.
    TimedOut,
    /// Job was cancelled remotely.
    Cancelled,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Check if this is the successful terminal state.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Output stream a log chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// An event delivered on a job's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    /// Non-terminal state change.
    Progress {
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A chunk of job output.
    Log { stream: LogStream, chunk: String },
    /// Final job state. No further events follow.
    Terminal {
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl JobEvent {
    /// Terminal event helper.
    pub fn terminal(state: JobState, message: Option<&str>) -> Self {
        Self::Terminal {
            state,
            message: message.map(str::to_string),
        }
    }

    /// Stdout log helper.
    pub fn stdout(chunk: impl Into<String>) -> Self {
        Self::Log {
            stream: LogStream::Stdout,
            chunk: chunk.into(),
        }
    }

    /// Stderr log helper.
    pub fn stderr(chunk: impl Into<String>) -> Self {
        Self::Log {
            stream: LogStream::Stderr,
            chunk: chunk.into(),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}
