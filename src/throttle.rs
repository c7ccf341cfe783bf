//! Client-side submission throttle
//!
//! Remembers when the last job was published and refuses a new one until
//! `min_interval` has passed. Disabled entirely by `--ratelimit=false`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::write_atomic;

pub const THROTTLE_SCHEMA_ID: &str = "rai/throttle@1";

/// Errors for throttle operations
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("submitted too recently; retry in {}s", retry_after.as_secs().max(1))]
    TooSoon { retry_after: Duration },

    #[error("throttle state {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("corrupt throttle state {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThrottleState {
    schema_id: String,
    last_submission: DateTime<Utc>,
}

/// Minimum spacing between submissions, persisted in a small JSON file
#[derive(Debug, Clone)]
pub struct SubmissionThrottle {
    state_path: PathBuf,
    min_interval: Duration,
}

impl SubmissionThrottle {
    pub fn new(state_path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            state_path: state_path.into(),
            min_interval,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Time of the last stamped submission, if any
    pub fn last_submission(&self) -> Result<Option<DateTime<Utc>>, ThrottleError> {
        let data = match fs::read(&self.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ThrottleError::Io {
                    path: self.state_path.clone(),
                    source,
                })
            }
        };

        let state: ThrottleState =
            serde_json::from_slice(&data).map_err(|source| ThrottleError::Corrupt {
                path: self.state_path.clone(),
                source,
            })?;
        Ok(Some(state.last_submission))
    }

    /// Fail with `TooSoon` if the window since the last submission is still open
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), ThrottleError> {
        if self.min_interval.is_zero() {
            return Ok(());
        }

        let Some(last) = self.last_submission()? else {
            return Ok(());
        };

        let interval = ChronoDuration::from_std(self.min_interval)
            .unwrap_or_else(|_| ChronoDuration::days(365));
        let open_at = last + interval;
        if now < open_at {
            let retry_after = (open_at - now).to_std().unwrap_or(self.min_interval);
            return Err(ThrottleError::TooSoon { retry_after });
        }
        Ok(())
    }

    /// Record `now` as the last submission
    pub fn mark(&self, now: DateTime<Utc>) -> Result<(), ThrottleError> {
        let state = ThrottleState {
            schema_id: THROTTLE_SCHEMA_ID.to_string(),
            last_submission: now,
        };
        let json = serde_json::to_vec_pretty(&state).map_err(|source| ThrottleError::Corrupt {
            path: self.state_path.clone(),
            source,
        })?;
        write_atomic(&self.state_path, &json).map_err(|source| ThrottleError::Io {
            path: self.state_path.clone(),
            source,
        })
    }
}
