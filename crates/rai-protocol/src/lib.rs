//! RAI Protocol Types
//!
//! Defines the messages exchanged between the submitting client and the job
//! broker: the staged upload reference, the publish request, and the job
//! events streamed back while the job runs.

pub mod error;
pub mod ops;

pub use error::{ErrorCode, Rejection};
pub use ops::{
    is_valid_queue_name, JobEvent, JobState, LogStream, PublishReceipt, PublishRequest, SubmissionTag, UploadRef,
};

/// Schema identifier stamped on every publish request.
pub const PUBLISH_SCHEMA_ID: &str = "rai/publish@1";

/// Schema identifier stamped on persisted job records.
pub const RECORD_SCHEMA_ID: &str = "rai/job_record@1";

/// Client version reported to the broker.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default build file name looked up inside the submitted directory.
pub const DEFAULT_BUILD_FILE: &str = "rai_build.yml";
