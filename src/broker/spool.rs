//! Spool-directory broker
//!
//! A broker backed by a directory shared with the worker fleet (NFS mount,
//! synced volume, or a local dir for single-host setups). Layout:
//!
//! ```text
//! <root>/uploads/<sha256>.tar          staged source bundles
//! <root>/queues/<queue>/<job_id>.json  published jobs, one file each
//! <root>/subscriptions/<job_id>        subscription markers
//! <root>/events/<job_id>.jsonl         job events, appended by the worker
//! ```
//!
//! The client tails the events file by polling; the worker only ever
//! appends whole JSON lines.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rai_protocol::{
    is_valid_queue_name, ErrorCode, JobEvent, PublishReceipt, PublishRequest, Rejection, UploadRef,
};

use super::{Broker, BrokerError, BrokerOp, EventChannel, Subscription};
use crate::bundle::SourceBundle;
use crate::util::write_atomic;

/// Spool broker settings
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub root: PathBuf,
    /// How often the event tail checks for new lines
    pub poll_interval: Duration,
}

impl SpoolConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Broker backed by a shared spool directory
#[derive(Debug, Clone)]
pub struct SpoolBroker {
    config: SpoolConfig,
}

impl SpoolBroker {
    pub fn new(config: SpoolConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn upload_path(&self, sha256: &str) -> PathBuf {
        self.config.root.join("uploads").join(format!("{}.tar", sha256))
    }

    /// Directory of a queue; refuses names that would leave `queues/`
    pub fn queue_dir(&self, queue: &str) -> Result<PathBuf, BrokerError> {
        if !is_valid_queue_name(queue) {
            return Err(Self::rejected(
                BrokerOp::Publish,
                ErrorCode::InvalidRequest,
                format!("invalid queue name '{}'", queue),
            ));
        }
        Ok(self.config.root.join("queues").join(queue))
    }

    pub fn job_path(&self, queue: &str, job_id: &str) -> Result<PathBuf, BrokerError> {
        Ok(self.queue_dir(queue)?.join(format!("{}.json", job_id)))
    }

    pub fn subscription_path(&self, job_id: &str) -> PathBuf {
        self.config.root.join("subscriptions").join(job_id)
    }

    pub fn events_path(&self, job_id: &str) -> PathBuf {
        self.config
            .root
            .join("events")
            .join(format!("{}.jsonl", job_id))
    }

    /// Append an event for a job, the way a worker reports progress
    pub fn append_event(&self, job_id: &str, event: &JobEvent) -> Result<(), BrokerError> {
        let path = self.events_path(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Jobs waiting in a queue, oldest file name first
    pub fn pending_jobs(&self, queue: &str) -> Result<Vec<PublishRequest>, BrokerError> {
        let dir = self.queue_dir(queue)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let data = fs::read(&path)?;
            jobs.push(serde_json::from_slice(&data)?);
        }
        Ok(jobs)
    }

    fn rejected(op: BrokerOp, code: ErrorCode, message: String) -> BrokerError {
        BrokerError::Rejected {
            op,
            rejection: Rejection::new(code, message),
        }
    }
}

impl Broker for SpoolBroker {
    fn subscribe(&self, job_id: &str) -> Result<Subscription, BrokerError> {
        let marker = self.subscription_path(job_id);
        write_atomic(&marker, Utc::now().to_rfc3339().as_bytes())?;

        // Create the events file up front so connect never races the worker
        let events = self.events_path(job_id);
        if let Some(parent) = events.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&events)?;

        tracing::debug!(job_id, marker = %marker.display(), "subscribed");
        Ok(Subscription::for_job(job_id))
    }

    fn upload(&self, job_id: &str, bundle: &SourceBundle) -> Result<UploadRef, BrokerError> {
        let path = self.upload_path(&bundle.sha256);

        if path.is_file() {
            tracing::debug!(job_id, sha256 = %bundle.sha256, "upload already staged");
        } else {
            write_atomic(&path, &bundle.tar_bytes)?;
            tracing::debug!(job_id, bytes = bundle.size(), path = %path.display(), "upload staged");
        }

        Ok(UploadRef::tar(
            path.to_string_lossy().into_owned(),
            bundle.sha256.clone(),
            bundle.size(),
        ))
    }

    fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, BrokerError> {
        if !self.upload_path(&request.upload.sha256).is_file() {
            return Err(Self::rejected(
                BrokerOp::Publish,
                ErrorCode::InvalidRequest,
                format!("upload {} was never staged", request.upload.sha256),
            ));
        }

        let path = self.job_path(&request.queue, &request.job_id)?;
        if path.exists() {
            return Err(Self::rejected(
                BrokerOp::Publish,
                ErrorCode::InvalidRequest,
                format!("job {} already published", request.job_id),
            ));
        }

        let json = serde_json::to_vec_pretty(request)?;
        write_atomic(&path, &json)?;

        tracing::debug!(job_id = %request.job_id, queue = %request.queue, "job enqueued");
        Ok(PublishReceipt {
            job_id: request.job_id.clone(),
            queue: request.queue.clone(),
            accepted_at: Utc::now(),
        })
    }

    fn connect(&self, subscription: &Subscription) -> Result<Box<dyn EventChannel>, BrokerError> {
        if !self.subscription_path(&subscription.job_id).is_file() {
            return Err(BrokerError::NotSubscribed(subscription.job_id.clone()));
        }

        let path = self.events_path(&subscription.job_id);
        let file = File::open(&path).map_err(|e| {
            BrokerError::ConnectionFailed(format!("cannot open {}: {}", path.display(), e))
        })?;

        Ok(Box::new(SpoolChannel {
            reader: BufReader::new(file),
            partial: Vec::new(),
            poll_interval: self.config.poll_interval,
        }))
    }

    fn disconnect(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        match fs::remove_file(self.subscription_path(&subscription.job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Tail of a job's events file
struct SpoolChannel {
    reader: BufReader<File>,
    /// Bytes of a line the worker has not finished writing yet
    partial: Vec<u8>,
    poll_interval: Duration,
}

impl SpoolChannel {
    /// Next complete line as raw bytes
    ///
    /// A line is only decoded once its newline has arrived, so a write that
    /// stops inside a multibyte character is held back like any other.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, BrokerError> {
        let read = self.reader.read_until(b'\n', &mut self.partial)?;
        if read == 0 || self.partial.last() != Some(&b'\n') {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.partial)))
    }
}

impl EventChannel for SpoolChannel {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<JobEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            while let Some(line) = self.next_line()? {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = serde_json::from_str(trimmed)
                    .map_err(|e| BrokerError::MalformedEvent(format!("{}: {}", e, trimmed)))?;
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
