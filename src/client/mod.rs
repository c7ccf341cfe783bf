//! Job client
//!
//! Owns one submission from validation to disconnect. Every lifecycle
//! operation checks the client state first; an out-of-order call fails with
//! [`ClientError::OutOfOrder`] and leaves the client untouched. A client is
//! good for exactly one job.

mod state;

pub use state::ClientState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rai_protocol::{
    is_valid_queue_name, JobEvent, JobState, LogStream, PublishReceipt, PublishRequest, UploadRef, CLIENT_VERSION,
    PUBLISH_SCHEMA_ID,
};
use sha2::{Digest, Sha256};

use crate::broker::{Broker, BrokerError, EventChannel, Subscription};
use crate::build_file::{BuildFile, BuildFileError};
use crate::bundle::{BundleError, Bundler};
use crate::lifecycle::Stage;
use crate::options::{check_working_dir, OptionSet, OptionsError};
use crate::record::{JobRecord, RecordError, Recorder};
use crate::throttle::{SubmissionThrottle, ThrottleError};

/// Errors raised by lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{stage} called out of order (client is {state})")]
    OutOfOrder { stage: Stage, state: ClientState },

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    BuildFile(#[from] BuildFileError),

    #[error("no queue could be resolved for {0}")]
    NoQueue(String),

    #[error("invalid queue name '{0}': use letters, digits, '_', '.' and '-' only")]
    InvalidQueue(String),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),

    #[error("bundle failed: {0}")]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("job {job_id} did not finish within {}s", timeout.as_secs())]
    WaitTimeout { job_id: String, timeout: Duration },

    #[error("terminal event carried non-terminal state {0}")]
    BadTerminalState(JobState),

    #[error("no job outcome to record")]
    MissingOutcome,

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Knobs for a client, taken from the effective configuration
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Give up waiting after this long; `None` waits forever
    pub wait_timeout: Option<Duration>,
    /// Longest single blocking receive during Wait
    pub poll_interval: Duration,
    pub throttle: Option<SubmissionThrottle>,
    /// App secret; only its digest leaves the client
    pub secret: Option<String>,
    /// 0 means unlimited
    pub max_bundle_bytes: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            wait_timeout: None,
            poll_interval: Duration::from_millis(500),
            throttle: None,
            secret: None,
            max_bundle_bytes: 0,
        }
    }
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub state: JobState,
    pub message: Option<String>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }
}

/// Stateful submission client
pub struct JobClient {
    options: OptionSet,
    broker: Arc<dyn Broker>,
    recorder: Arc<dyn Recorder>,
    settings: ClientSettings,
    job_id: String,
    state: ClientState,

    build_file: Option<BuildFile>,
    queue: Option<String>,
    subscription: Option<Subscription>,
    upload: Option<UploadRef>,
    receipt: Option<PublishReceipt>,
    submitted_at: Option<DateTime<Utc>>,
    channel: Option<Box<dyn EventChannel>>,
    outcome: Option<JobOutcome>,
}

impl JobClient {
    pub fn new(
        options: OptionSet,
        broker: Arc<dyn Broker>,
        recorder: Arc<dyn Recorder>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            options,
            broker,
            recorder,
            settings,
            job_id: uuid::Uuid::new_v4().to_string(),
            state: ClientState::Created,
            build_file: None,
            queue: None,
            subscription: None,
            upload: None,
            receipt: None,
            submitted_at: None,
            channel: None,
            outcome: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Queue resolved during Validate
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn upload_ref(&self) -> Option<&UploadRef> {
        self.upload.as_ref()
    }

    pub fn receipt(&self) -> Option<&PublishReceipt> {
        self.receipt.as_ref()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// Run a single stage by name
    pub fn perform(&mut self, stage: Stage) -> Result<(), ClientError> {
        match stage {
            Stage::Validate => self.validate(),
            Stage::Subscribe => self.subscribe(),
            Stage::Upload => self.upload(),
            Stage::Publish => self.publish(),
            Stage::Connect => self.connect(),
            Stage::Wait => self.wait(),
            Stage::Record => self.record(),
            Stage::Disconnect => self.disconnect(),
        }
    }

    fn ensure(&self, stage: Stage, target: ClientState) -> Result<(), ClientError> {
        if self.state.can_transition_to(target) {
            Ok(())
        } else {
            Err(ClientError::OutOfOrder {
                stage,
                state: self.state,
            })
        }
    }

    /// Check every precondition; touches nothing outside the client
    pub fn validate(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Validate, ClientState::Validated)?;

        if let Some(issue) = self.options.path_issues().first() {
            return Err(issue.to_error().into());
        }
        check_working_dir(self.options.directory())?;

        let build_file = BuildFile::load(&self.options.build_file())?;
        let queue = build_file.resolve_queue(self.options.queue_name());
        if queue.trim().is_empty() {
            return Err(ClientError::NoQueue(build_file.path.display().to_string()));
        }
        if !is_valid_queue_name(&queue) {
            return Err(ClientError::InvalidQueue(queue));
        }

        if self.options.rate_limit_enabled() {
            if let Some(throttle) = &self.settings.throttle {
                throttle.check(Utc::now())?;
            }
        } else {
            tracing::debug!("rate limiting disabled");
        }

        tracing::debug!(
            job_id = %self.job_id,
            directory = %self.options.directory().display(),
            build_file = %build_file.path.display(),
            queue = %queue,
            "validated submission"
        );

        self.build_file = Some(build_file);
        self.queue = Some(queue);
        self.state = ClientState::Validated;
        Ok(())
    }

    pub fn subscribe(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Subscribe, ClientState::Subscribed)?;

        let subscription = self.broker.subscribe(&self.job_id)?;
        tracing::debug!(job_id = %self.job_id, subscription = %subscription.id, "subscribed");

        self.subscription = Some(subscription);
        self.state = ClientState::Subscribed;
        Ok(())
    }

    /// Bundle the directory and stage it on the broker
    pub fn upload(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Upload, ClientState::Uploaded)?;

        let bundle = Bundler::new(self.options.directory())?
            .with_max_bytes(self.settings.max_bundle_bytes)
            .create_bundle()?;
        let upload = self.broker.upload(&self.job_id, &bundle)?;

        tracing::info!(
            files = bundle.file_count,
            bytes = upload.size_bytes,
            sha256 = %upload.sha256,
            "uploaded source directory"
        );

        self.upload = Some(upload);
        self.state = ClientState::Uploaded;
        Ok(())
    }

    pub fn publish(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Publish, ClientState::Published)?;

        let (Some(build_file), Some(queue), Some(upload)) =
            (&self.build_file, &self.queue, &self.upload)
        else {
            return Err(ClientError::OutOfOrder {
                stage: Stage::Publish,
                state: self.state,
            });
        };

        let now = Utc::now();
        let request = PublishRequest {
            schema_id: PUBLISH_SCHEMA_ID.to_string(),
            job_id: self.job_id.clone(),
            queue: queue.clone(),
            upload: upload.clone(),
            build_file: build_file.contents.clone(),
            submission: self.options.submission_tag().cloned(),
            rate_limit: self.options.rate_limit_enabled(),
            credential_digest: self.settings.secret.as_deref().map(credential_digest),
            client_version: CLIENT_VERSION.to_string(),
            created_at: now,
        };

        let receipt = self.broker.publish(&request)?;
        tracing::info!(job_id = %receipt.job_id, queue = %receipt.queue, "job published");

        if self.options.rate_limit_enabled() {
            if let Some(throttle) = &self.settings.throttle {
                // The job is already queued; a missed stamp only loosens the throttle
                if let Err(e) = throttle.mark(now) {
                    tracing::warn!(error = %e, "failed to stamp submission throttle");
                }
            }
        }

        self.receipt = Some(receipt);
        self.submitted_at = Some(now);
        self.state = ClientState::Published;
        Ok(())
    }

    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Connect, ClientState::Connected)?;

        let subscription = self
            .subscription
            .as_ref()
            .ok_or_else(|| BrokerError::NotSubscribed(self.job_id.clone()))?;
        let channel = self.broker.connect(subscription)?;
        tracing::debug!(job_id = %self.job_id, "connected to job events");

        self.channel = Some(channel);
        self.state = ClientState::Connected;
        Ok(())
    }

    /// Block until the job reports a terminal state
    ///
    /// Log chunks go to the matching sink and progress messages to stdout.
    /// A failed job is an outcome, not an error.
    pub fn wait(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Wait, ClientState::Waited)?;

        let channel = self.channel.as_mut().ok_or(BrokerError::ChannelClosed)?;
        let started = Instant::now();
        let poll = self.settings.poll_interval;

        let outcome = loop {
            let slice = match self.settings.wait_timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(ClientError::WaitTimeout {
                            job_id: self.job_id.clone(),
                            timeout,
                        });
                    }
                    (timeout - elapsed).min(poll)
                }
                None => poll,
            };

            let Some(event) = channel.recv_timeout(slice)? else {
                continue;
            };

            match event {
                JobEvent::Log { stream, chunk } => forward_log(&self.options, stream, &chunk),
                JobEvent::Progress { state, message } => {
                    tracing::debug!(job_id = %self.job_id, %state, "job progress");
                    if let Some(message) = message {
                        forward_log(&self.options, LogStream::Stdout, &format!("{}\n", message));
                    }
                }
                JobEvent::Terminal { state, message } => {
                    if !state.is_terminal() {
                        return Err(ClientError::BadTerminalState(state));
                    }
                    break JobOutcome {
                        job_id: self.job_id.clone(),
                        state,
                        message,
                    };
                }
            }
        };

        tracing::info!(job_id = %self.job_id, state = %outcome.state, "job finished");
        self.outcome = Some(outcome);
        self.state = ClientState::Waited;
        Ok(())
    }

    pub fn record(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Record, ClientState::Recorded)?;

        let outcome = self.outcome.as_ref().ok_or(ClientError::MissingOutcome)?;
        let record = JobRecord {
            schema_id: rai_protocol::RECORD_SCHEMA_ID.to_string(),
            job_id: self.job_id.clone(),
            queue: self.queue.clone().unwrap_or_default(),
            submission: self.options.submission_tag().cloned(),
            state: outcome.state,
            message: outcome.message.clone(),
            source_sha256: self
                .upload
                .as_ref()
                .map(|u| u.sha256.clone())
                .unwrap_or_default(),
            directory: self.options.directory().to_path_buf(),
            submitted_at: self.submitted_at.unwrap_or_else(Utc::now),
            finished_at: Utc::now(),
        };

        self.recorder.record(&record)?;
        self.state = ClientState::Recorded;
        Ok(())
    }

    /// Close the event channel and release the subscription
    ///
    /// The client counts as disconnected even when the broker call fails.
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        self.ensure(Stage::Disconnect, ClientState::Disconnected)?;

        self.channel = None;
        self.state = ClientState::Disconnected;

        if let Some(subscription) = self.subscription.take() {
            self.broker.disconnect(&subscription)?;
        }
        tracing::debug!(job_id = %self.job_id, "disconnected");
        Ok(())
    }
}

impl std::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("job_id", &self.job_id)
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

fn forward_log(options: &OptionSet, stream: LogStream, chunk: &str) {
    let sink = match stream {
        LogStream::Stdout => options.stdout(),
        LogStream::Stderr => options.stderr(),
    };
    if let Err(e) = sink.write_all(chunk.as_bytes()) {
        tracing::warn!(error = %e, "failed to forward job output");
    }
}

/// SHA-256 hex of the app secret
pub fn credential_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
