//! In-process broker
//!
//! Holds uploads and published jobs in memory and plays a scripted worker:
//! publishing a job pushes the script's events onto the job's channel. Any
//! operation can be made to fail, and every call is journaled so tests can
//! assert on ordering.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rai_protocol::{
    ErrorCode, JobEvent, JobState, PublishReceipt, PublishRequest, Rejection, UploadRef,
};

use super::{Broker, BrokerError, BrokerOp, EventChannel, Subscription};
use crate::bundle::SourceBundle;

struct Slot {
    sender: Option<Sender<JobEvent>>,
    receiver: Option<Receiver<JobEvent>>,
}

#[derive(Default)]
struct MemoryState {
    slots: HashMap<String, Slot>,
    uploads: HashMap<String, Vec<u8>>,
    published: Vec<PublishRequest>,
    calls: Vec<BrokerOp>,
    failures: HashMap<BrokerOp, Rejection>,
}

#[derive(Clone)]
struct Script {
    events: Vec<JobEvent>,
    event_delay: Option<Duration>,
    close_after: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            events: vec![
                JobEvent::Progress {
                    state: JobState::Queued,
                    message: None,
                },
                JobEvent::Progress {
                    state: JobState::Running,
                    message: None,
                },
                JobEvent::stdout("build complete\n"),
                JobEvent::terminal(JobState::Succeeded, None),
            ],
            event_delay: None,
            close_after: false,
        }
    }
}

/// In-memory broker with a scripted worker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    script: Arc<Mutex<Script>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker whose worker queues, runs and succeeds every job
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Replace the events emitted for each published job
    pub fn with_script(self, events: Vec<JobEvent>) -> Self {
        lock(&self.script).events = events;
        self
    }

    /// Emit events from a background thread, spaced by `delay`
    pub fn with_event_delay(self, delay: Duration) -> Self {
        lock(&self.script).event_delay = Some(delay);
        self
    }

    /// Drop the job's sender once the script is exhausted
    pub fn closing_after_script(self) -> Self {
        lock(&self.script).close_after = true;
        self
    }

    /// Make an operation fail with the given rejection
    pub fn fail_on(&self, op: BrokerOp, code: ErrorCode, message: impl Into<String>) {
        lock(&self.state)
            .failures
            .insert(op, Rejection::new(code, message));
    }

    /// Every operation attempted so far, in order
    pub fn calls(&self) -> Vec<BrokerOp> {
        lock(&self.state).calls.clone()
    }

    /// Number of attempts of one operation
    pub fn call_count(&self, op: BrokerOp) -> usize {
        lock(&self.state).calls.iter().filter(|c| **c == op).count()
    }

    /// Jobs accepted by publish
    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.state).published.clone()
    }

    /// Staged bundle bytes by digest
    pub fn upload_bytes(&self, sha256: &str) -> Option<Vec<u8>> {
        lock(&self.state).uploads.get(sha256).cloned()
    }

    /// Journal the call and apply any injected failure
    fn enter(&self, op: BrokerOp) -> Result<MutexGuard<'_, MemoryState>, BrokerError> {
        let mut state = lock(&self.state);
        state.calls.push(op);
        if let Some(rejection) = state.failures.get(&op) {
            return Err(BrokerError::Rejected {
                op,
                rejection: rejection.clone(),
            });
        }
        Ok(state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Broker for MemoryBroker {
    fn subscribe(&self, job_id: &str) -> Result<Subscription, BrokerError> {
        let mut state = self.enter(BrokerOp::Subscribe)?;
        let (sender, receiver) = mpsc::channel();
        state.slots.insert(
            job_id.to_string(),
            Slot {
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
        Ok(Subscription::for_job(job_id))
    }

    fn upload(&self, _job_id: &str, bundle: &SourceBundle) -> Result<UploadRef, BrokerError> {
        let mut state = self.enter(BrokerOp::Upload)?;
        state
            .uploads
            .insert(bundle.sha256.clone(), bundle.tar_bytes.clone());
        Ok(UploadRef::tar(
            format!("memory://uploads/{}.tar", bundle.sha256),
            bundle.sha256.clone(),
            bundle.size(),
        ))
    }

    fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, BrokerError> {
        let mut state = self.enter(BrokerOp::Publish)?;

        if !state.uploads.contains_key(&request.upload.sha256) {
            return Err(BrokerError::Rejected {
                op: BrokerOp::Publish,
                rejection: Rejection::new(
                    ErrorCode::InvalidRequest,
                    format!("upload {} was never staged", request.upload.sha256),
                ),
            });
        }

        state.published.push(request.clone());

        let script = lock(&self.script).clone();
        if let Some(slot) = state.slots.get_mut(&request.job_id) {
            let sender = if script.close_after {
                slot.sender.take()
            } else {
                slot.sender.clone()
            };

            if let Some(sender) = sender {
                match script.event_delay {
                    Some(delay) => {
                        thread::spawn(move || {
                            for event in script.events {
                                thread::sleep(delay);
                                if sender.send(event).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    None => {
                        for event in script.events {
                            // Receiver gone means nobody is listening anymore
                            let _ = sender.send(event);
                        }
                    }
                }
            }
        }

        Ok(PublishReceipt {
            job_id: request.job_id.clone(),
            queue: request.queue.clone(),
            accepted_at: Utc::now(),
        })
    }

    fn connect(&self, subscription: &Subscription) -> Result<Box<dyn EventChannel>, BrokerError> {
        let mut state = self.enter(BrokerOp::Connect)?;
        let receiver = state
            .slots
            .get_mut(&subscription.job_id)
            .and_then(|slot| slot.receiver.take())
            .ok_or_else(|| BrokerError::NotSubscribed(subscription.job_id.clone()))?;
        Ok(Box::new(MemoryChannel { receiver }))
    }

    fn disconnect(&self, subscription: &Subscription) -> Result<(), BrokerError> {
        let mut state = self.enter(BrokerOp::Disconnect)?;
        state.slots.remove(&subscription.job_id);
        Ok(())
    }
}

struct MemoryChannel {
    receiver: Receiver<JobEvent>,
}

impl EventChannel for MemoryChannel {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<JobEvent>, BrokerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::ChannelClosed),
        }
    }
}
