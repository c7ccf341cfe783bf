//! rai - job submission client
//!
//! Packages a working directory that contains a `rai_build.yml`, stages it on
//! a job broker, enqueues it, streams the job's output back and records the
//! outcome. The orchestration lives in [`lifecycle`]; [`client::JobClient`]
//! owns the per-submission state.

pub mod broker;
pub mod build_file;
pub mod bundle;
pub mod client;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod options;
pub mod record;
pub mod submission;
pub mod throttle;
mod util;

pub use broker::{Broker, BrokerError, BrokerOp, MemoryBroker, SpoolBroker, SpoolConfig};
pub use client::{ClientError, ClientSettings, ClientState, JobClient, JobOutcome};
pub use config::{AppConfig, ConfigError};
pub use lifecycle::{run, FailurePolicy, RunError, Stage, TRANSITIONS};
pub use options::{OptionSet, OptionsError, OutputSink, PathResolution};
pub use record::{FileRecorder, JobRecord, Recorder, RecordError};
pub use rai_protocol::{JobEvent, JobState, SubmissionTag};
