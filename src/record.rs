//! Job outcome records
//!
//! After a job reaches a terminal state the client persists a record of it.
//! `FileRecorder` keeps one JSON file per job; other stores can plug in
//! through [`Recorder`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rai_protocol::{JobState, SubmissionTag, RECORD_SCHEMA_ID};

use crate::util::write_atomic;

/// Errors for record operations
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("failed to write record {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Persisted outcome of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub schema_id: String,
    pub job_id: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<SubmissionTag>,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub source_sha256: String,
    pub directory: PathBuf,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, queue: impl Into<String>, state: JobState) -> Self {
        let now = Utc::now();
        Self {
            schema_id: RECORD_SCHEMA_ID.to_string(),
            job_id: job_id.into(),
            queue: queue.into(),
            submission: None,
            state,
            message: None,
            source_sha256: String::new(),
            directory: PathBuf::new(),
            submitted_at: now,
            finished_at: now,
        }
    }
}

/// Sink for job records
pub trait Recorder: Send + Sync {
    fn record(&self, record: &JobRecord) -> Result<(), RecordError>;
}

/// One `<job_id>.json` per job under a records directory
#[derive(Debug, Clone)]
pub struct FileRecorder {
    dir: PathBuf,
}

impl FileRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Read a record back
    pub fn load(&self, job_id: &str) -> Result<JobRecord, RecordError> {
        let path = self.record_path(job_id);
        let data = fs::read(&path).map_err(|source| RecordError::Io { path, source })?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl Recorder for FileRecorder {
    fn record(&self, record: &JobRecord) -> Result<(), RecordError> {
        let path = self.record_path(&record.job_id);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &json).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(job_id = %record.job_id, path = %path.display(), "job recorded");
        Ok(())
    }
}
