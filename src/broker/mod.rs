//! Broker seam
//!
//! The broker is the remote queueing service a job is submitted to. The
//! client only talks to it through the [`Broker`] trait so the orchestration
//! can be driven against any backend:
//! - [`MemoryBroker`]: in-process broker with a scripted worker, for tests
//! - [`SpoolBroker`]: a shared spool directory served by an external worker

mod memory;
mod spool;

pub use memory::MemoryBroker;
pub use spool::{SpoolBroker, SpoolConfig};

use std::fmt;
use std::io;
use std::time::Duration;

use rai_protocol::ops::names;
use rai_protocol::{JobEvent, PublishReceipt, PublishRequest, Rejection, UploadRef};

use crate::bundle::SourceBundle;

/// Broker operations, in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerOp {
    Subscribe,
    Upload,
    Publish,
    Connect,
    Disconnect,
}

impl BrokerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOp::Subscribe => names::SUBSCRIBE,
            BrokerOp::Upload => names::UPLOAD,
            BrokerOp::Publish => names::PUBLISH,
            BrokerOp::Connect => names::CONNECT,
            BrokerOp::Disconnect => names::DISCONNECT,
        }
    }
}

impl fmt::Display for BrokerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{op} rejected: {rejection}")]
    Rejected { op: BrokerOp, rejection: Rejection },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No subscription for job {0}")]
    NotSubscribed(String),

    #[error("Event channel closed before the job finished")]
    ChannelClosed,

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Registered interest in a job's events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub job_id: String,
}

impl Subscription {
    pub fn for_job(job_id: &str) -> Self {
        Self {
            id: format!("sub-{}", job_id),
            job_id: job_id.to_string(),
        }
    }
}

/// Live channel delivering a subscribed job's events
pub trait EventChannel: Send {
    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(BrokerError::ChannelClosed)` when the sender went away.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<JobEvent>, BrokerError>;
}

/// Remote queueing service
pub trait Broker: Send + Sync {
    /// Register interest in a job before it exists remotely.
    /// Events emitted before [`Broker::connect`] are buffered.
    fn subscribe(&self, job_id: &str) -> Result<Subscription, BrokerError>;

    /// Stage a source bundle where workers can fetch it
    fn upload(&self, job_id: &str, bundle: &SourceBundle) -> Result<UploadRef, BrokerError>;

    /// Enqueue the job; from here on it is schedulable
    fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, BrokerError>;

    /// Open the live channel for a subscription
    fn connect(&self, subscription: &Subscription) -> Result<Box<dyn EventChannel>, BrokerError>;

    /// Release the channel and the subscription
    fn disconnect(&self, subscription: &Subscription) -> Result<(), BrokerError>;
}
