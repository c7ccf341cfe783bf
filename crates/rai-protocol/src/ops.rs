//! Operation-specific types.

pub mod event;
pub mod publish;
pub mod upload;

pub use event::{JobEvent, JobState, LogStream};
pub use publish::{is_valid_queue_name, PublishReceipt, PublishRequest, SubmissionTag};
pub use upload::UploadRef;

/// Broker operation names, used in logs and call journals.
pub mod names {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UPLOAD: &str = "upload";
    pub const PUBLISH: &str = "publish";
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
}
