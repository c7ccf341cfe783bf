//! Lifecycle driver
//!
//! Runs a [`JobClient`] through its stages in the order given by
//! [`TRANSITIONS`]. The first failing stage aborts the run. Once Connect has
//! succeeded a guard owns the client, and dropping that guard always
//! disconnects, whichever way the run ends.

use std::fmt;
use std::ops::{Deref, DerefMut};

use rai_protocol::JobState;

use crate::client::{ClientError, ClientState, JobClient, JobOutcome};

/// Lifecycle stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    Subscribe,
    Upload,
    Publish,
    Connect,
    Wait,
    Record,
    Disconnect,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Validate,
        Stage::Subscribe,
        Stage::Upload,
        Stage::Publish,
        Stage::Connect,
        Stage::Wait,
        Stage::Record,
        Stage::Disconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Subscribe => "subscribe",
            Stage::Upload => "upload",
            Stage::Publish => "publish",
            Stage::Connect => "connect",
            Stage::Wait => "wait",
            Stage::Record => "record",
            Stage::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failing stage does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Abort,
    /// Abort, log at error level and prefix the error with the annotation
    AbortWithAnnotation(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ClientState,
    pub stage: Stage,
    pub to: ClientState,
    pub on_failure: FailurePolicy,
}

pub const JOB_NOT_RECORDED: &str = "job not recorded";

const JOB_NOT_RECORDED_DETAIL: &str =
    "job not recorded. If this was a submission, it was not recorded.";

/// Stages 1-7; disconnect is left to the guard
pub const TRANSITIONS: [Transition; 7] = [
    Transition {
        from: ClientState::Created,
        stage: Stage::Validate,
        to: ClientState::Validated,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Validated,
        stage: Stage::Subscribe,
        to: ClientState::Subscribed,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Subscribed,
        stage: Stage::Upload,
        to: ClientState::Uploaded,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Uploaded,
        stage: Stage::Publish,
        to: ClientState::Published,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Published,
        stage: Stage::Connect,
        to: ClientState::Connected,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Connected,
        stage: Stage::Wait,
        to: ClientState::Waited,
        on_failure: FailurePolicy::Abort,
    },
    Transition {
        from: ClientState::Waited,
        stage: Stage::Record,
        to: ClientState::Recorded,
        on_failure: FailurePolicy::AbortWithAnnotation(JOB_NOT_RECORDED),
    },
];

/// Errors that end a run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{source}")]
    Stage { stage: Stage, source: ClientError },

    #[error("{annotation}: {source}")]
    Annotated {
        stage: Stage,
        annotation: &'static str,
        source: ClientError,
    },

    #[error("job {job_id} ended {state}: {}", message.as_deref().unwrap_or("no details"))]
    JobFailed {
        job_id: String,
        state: JobState,
        message: Option<String>,
    },
}

impl RunError {
    /// Stage that failed; `None` when the job itself failed
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunError::Stage { stage, .. } | RunError::Annotated { stage, .. } => Some(*stage),
            RunError::JobFailed { .. } => None,
        }
    }
}

/// Client with a live channel; disconnects on drop
struct Connected<'a>(&'a mut JobClient);

impl Deref for Connected<'_> {
    type Target = JobClient;

    fn deref(&self) -> &JobClient {
        &*self.0
    }
}

impl DerefMut for Connected<'_> {
    fn deref_mut(&mut self) -> &mut JobClient {
        &mut *self.0
    }
}

impl Drop for Connected<'_> {
    fn drop(&mut self) {
        if !self.0.state().is_connected() {
            return;
        }
        if let Err(e) = self.0.disconnect() {
            tracing::warn!(job_id = %self.0.job_id(), error = %e, "disconnect failed");
        }
    }
}

fn execute(client: &mut JobClient, transition: &Transition) -> Result<(), RunError> {
    tracing::trace!(stage = %transition.stage, from = %client.state(), "running stage");

    match client.perform(transition.stage) {
        Ok(()) => {
            debug_assert_eq!(client.state(), transition.to);
            Ok(())
        }
        Err(source) => match transition.on_failure {
            FailurePolicy::Abort => Err(RunError::Stage {
                stage: transition.stage,
                source,
            }),
            FailurePolicy::AbortWithAnnotation(annotation) => {
                tracing::error!(job_id = %client.job_id(), error = %source, "{}", JOB_NOT_RECORDED_DETAIL);
                Err(RunError::Annotated {
                    stage: transition.stage,
                    annotation,
                    source,
                })
            }
        },
    }
}

/// Drive a fresh client through the whole lifecycle
pub fn run(client: &mut JobClient) -> Result<JobOutcome, RunError> {
    let split = TRANSITIONS
        .iter()
        .position(|t| t.stage == Stage::Connect)
        .map_or(TRANSITIONS.len(), |i| i + 1);
    let (before, after) = TRANSITIONS.split_at(split);

    for transition in before {
        execute(client, transition)?;
    }

    let outcome = {
        let mut connected = Connected(client);
        for transition in after {
            execute(&mut connected, transition)?;
        }
        connected.outcome().cloned()
    };

    let outcome = outcome.ok_or(RunError::Stage {
        stage: Stage::Wait,
        source: ClientError::MissingOutcome,
    })?;

    if !outcome.is_success() {
        return Err(RunError::JobFailed {
            job_id: outcome.job_id,
            state: outcome.state,
            message: outcome.message,
        });
    }
    Ok(outcome)
}
