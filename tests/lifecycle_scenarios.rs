//! Lifecycle scenarios
//!
//! End-to-end runs of the lifecycle driver against the in-memory broker:
//! stage ordering, abort behavior, guaranteed disconnect and the record
//! annotation.

mod fixtures;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fixtures::{options, Workspace};
use rai_client::{
    lifecycle, BrokerOp, ClientError, ClientSettings, ClientState, FileRecorder, JobClient,
    JobEvent, JobRecord, JobState, MemoryBroker, OptionSet, PathResolution, RecordError,
    Recorder, RunError, Stage, SubmissionTag,
};
use rai_protocol::ErrorCode;

/// Recorder whose store is always down
#[derive(Default)]
struct UnavailableRecorder {
    attempts: AtomicUsize,
}

impl Recorder for UnavailableRecorder {
    fn record(&self, _record: &JobRecord) -> Result<(), RecordError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RecordError::Unavailable("records volume offline".to_string()))
    }
}

/// In-memory writer for the fmt subscriber
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run the lifecycle with a subscriber that records every log line
fn run_logged(client: &mut JobClient) -> (Result<rai_client::JobOutcome, RunError>, String) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || lifecycle::run(client));
    (result, capture.contents())
}

fn client(ws: &Workspace, options: OptionSet, broker: &MemoryBroker) -> JobClient {
    JobClient::new(
        options,
        Arc::new(broker.clone()),
        Arc::new(FileRecorder::new(ws.records_dir())),
        ClientSettings::default(),
    )
}

// =============================================================================
// Scenario 1: tagged submission of a valid directory
// =============================================================================

#[test]
fn test_final_submission_runs_every_stage_in_order() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let (options, captured) = options(&ws.project(), Some(SubmissionTag::Final));
    let mut client = client(&ws, options, &broker);

    let outcome = lifecycle::run(&mut client).unwrap();

    assert_eq!(outcome.state, JobState::Succeeded);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(
        broker.calls(),
        vec![
            BrokerOp::Subscribe,
            BrokerOp::Upload,
            BrokerOp::Publish,
            BrokerOp::Connect,
            BrokerOp::Disconnect,
        ]
    );

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].queue, "rai_amd64");
    assert_eq!(published[0].submission, Some(SubmissionTag::Final));

    let record = FileRecorder::new(ws.records_dir())
        .load(client.job_id())
        .unwrap();
    assert_eq!(record.state, JobState::Succeeded);
    assert_eq!(record.submission, Some(SubmissionTag::Final));
    assert_eq!(record.source_sha256, published[0].upload.sha256);

    assert!(captured.stdout.contents().contains("build complete"));
}

#[test]
fn test_events_from_background_worker() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new()
        .with_script(vec![
            JobEvent::Progress {
                state: JobState::Running,
                message: Some("building".to_string()),
            },
            JobEvent::stdout("[ 50%] Building CUDA object\n"),
            JobEvent::stderr("warning: unused variable\n"),
            JobEvent::terminal(JobState::Succeeded, None),
        ])
        .with_event_delay(Duration::from_millis(5));
    let (options, captured) = options(&ws.project(), None);
    let mut client = client(&ws, options, &broker);

    lifecycle::run(&mut client).unwrap();

    assert_eq!(
        captured.stdout.contents(),
        "building\n[ 50%] Building CUDA object\n"
    );
    assert_eq!(captured.stderr.contents(), "warning: unused variable\n");
}

// =============================================================================
// Scenario 2: unreachable directory
// =============================================================================

#[test]
fn test_missing_directory_has_no_remote_side_effects() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let (options, _) = options(&ws.root().join("does-not-exist"), None);
    let mut client = client(&ws, options, &broker);

    let err = lifecycle::run(&mut client).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    assert!(err.to_string().contains("directory not found"));
    assert!(broker.calls().is_empty());
    assert_eq!(client.state(), ClientState::Created);
    assert!(!ws.records_dir().exists());
}

#[test]
fn test_strict_paths_reject_unresolvable_directory() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let options = OptionSet::builder("")
        .path_resolution(PathResolution::Strict)
        .build();
    let mut client = client(&ws, options, &broker);

    let err = lifecycle::run(&mut client).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    assert!(err.to_string().contains("could not be resolved"));
    assert!(broker.calls().is_empty());
}

#[test]
fn test_lenient_paths_keep_original_and_fail_later() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let options = OptionSet::builder("")
        .path_resolution(PathResolution::Lenient)
        .build();
    assert!(options.path_issues().is_empty());
    let mut client = client(&ws, options, &broker);

    let err = lifecycle::run(&mut client).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Validate));
    assert!(!err.to_string().contains("could not be resolved"));
    assert!(broker.calls().is_empty());
}

// =============================================================================
// Scenario 3: the job fails remotely
// =============================================================================

#[test]
fn test_remote_failure_is_recorded_then_reported() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new().with_script(vec![
        JobEvent::stderr("nvcc fatal: unsupported gpu architecture\n"),
        JobEvent::terminal(JobState::Failed, Some("build step 1 exited with 1")),
    ]);
    let (options, captured) = options(&ws.project(), Some(SubmissionTag::M2));
    let mut client = client(&ws, options, &broker);

    let err = lifecycle::run(&mut client).unwrap_err();

    match &err {
        RunError::JobFailed { state, message, .. } => {
            assert_eq!(*state, JobState::Failed);
            assert_eq!(message.as_deref(), Some("build step 1 exited with 1"));
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }
    assert_eq!(err.stage(), None);

    let record = FileRecorder::new(ws.records_dir())
        .load(client.job_id())
        .unwrap();
    assert_eq!(record.state, JobState::Failed);

    assert_eq!(broker.calls().last(), Some(&BrokerOp::Disconnect));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(captured.stderr.contents().contains("nvcc fatal"));
}

// =============================================================================
// Scenario 4: the record store fails
// =============================================================================

#[test]
fn test_record_failure_is_annotated_and_still_disconnects() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let recorder = Arc::new(UnavailableRecorder::default());
    let (options, _) = options(&ws.project(), None);
    let mut client = JobClient::new(
        options,
        Arc::new(broker.clone()),
        recorder.clone(),
        ClientSettings::default(),
    );

    let err = lifecycle::run(&mut client).unwrap_err();

    assert!(matches!(
        err,
        RunError::Annotated {
            stage: Stage::Record,
            source: ClientError::Record(RecordError::Unavailable(_)),
            ..
        }
    ));
    let message = err.to_string();
    assert!(message.starts_with("job not recorded"), "{message}");
    assert!(message.contains("records volume offline"));

    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.calls().last(), Some(&BrokerOp::Disconnect));
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn test_only_record_failure_logs_not_recorded() {
    let ws = Workspace::new();
    let (record_options, _) = options(&ws.project(), None);
    let mut unrecorded = JobClient::new(
        record_options,
        Arc::new(MemoryBroker::new()),
        Arc::new(UnavailableRecorder::default()),
        ClientSettings::default(),
    );

    let (result, logs) = run_logged(&mut unrecorded);

    assert_eq!(result.unwrap_err().stage(), Some(Stage::Record));
    let line = logs
        .lines()
        .find(|l| l.contains("If this was a submission, it was not recorded."))
        .unwrap_or_else(|| panic!("no record failure line in:\n{logs}"));
    assert!(line.contains("ERROR"), "{line}");
    assert!(line.contains(unrecorded.job_id()), "{line}");

    // A Wait failure aborts too, but without that line
    let broker = MemoryBroker::new()
        .with_script(vec![JobEvent::stdout("partial output\n")])
        .closing_after_script();
    let (wait_options, _) = options(&ws.project(), None);
    let mut dropped = client(&ws, wait_options, &broker);

    let (result, logs) = run_logged(&mut dropped);

    assert_eq!(result.unwrap_err().stage(), Some(Stage::Wait));
    assert!(logs.contains("disconnected"), "{logs}");
    assert!(!logs.contains("not recorded"), "{logs}");
}

// =============================================================================
// Abort properties
// =============================================================================

#[test]
fn test_failing_stage_skips_the_rest() {
    let cases = [
        (BrokerOp::Subscribe, Stage::Subscribe),
        (BrokerOp::Upload, Stage::Upload),
        (BrokerOp::Publish, Stage::Publish),
        (BrokerOp::Connect, Stage::Connect),
    ];

    for (op, stage) in cases {
        let ws = Workspace::new();
        let broker = MemoryBroker::new();
        broker.fail_on(op, ErrorCode::Unavailable, "broker restarting");
        let (options, _) = options(&ws.project(), None);
        let mut client = client(&ws, options, &broker);

        let err = lifecycle::run(&mut client).unwrap_err();

        assert_eq!(err.stage(), Some(stage), "{op}");
        assert!(err.to_string().contains("UNAVAILABLE"), "{op}: {err}");

        // Every op up to and including the failing one, nothing after it,
        // and no disconnect because Connect never succeeded
        let calls = broker.calls();
        assert_eq!(calls.last(), Some(&op), "{op}");
        assert!(!calls.contains(&BrokerOp::Disconnect), "{op}");
        assert!(!ws.records_dir().exists(), "{op}");
    }
}

#[test]
fn test_wait_failure_still_disconnects() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new()
        .with_script(vec![JobEvent::stdout("partial output\n")])
        .closing_after_script();
    let (options, _) = options(&ws.project(), None);
    let mut client = client(&ws, options, &broker);

    let err = lifecycle::run(&mut client).unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Wait));
    assert!(err.to_string().contains("closed"));
    assert_eq!(broker.calls().last(), Some(&BrokerOp::Disconnect));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!ws.records_dir().exists());
}

#[test]
fn test_wait_deadline_still_disconnects() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new().with_script(Vec::new());
    let (options, _) = options(&ws.project(), None);
    let settings = ClientSettings {
        wait_timeout: Some(Duration::from_millis(40)),
        poll_interval: Duration::from_millis(10),
        ..ClientSettings::default()
    };
    let mut client = JobClient::new(
        options,
        Arc::new(broker.clone()),
        Arc::new(FileRecorder::new(ws.records_dir())),
        settings,
    );

    let err = lifecycle::run(&mut client).unwrap_err();

    assert!(matches!(
        err,
        RunError::Stage {
            stage: Stage::Wait,
            source: ClientError::WaitTimeout { .. }
        }
    ));
    assert_eq!(broker.call_count(BrokerOp::Disconnect), 1);
}

#[test]
fn test_client_is_single_use() {
    let ws = Workspace::new();
    let broker = MemoryBroker::new();
    let (options, _) = options(&ws.project(), None);
    let mut client = client(&ws, options, &broker);

    lifecycle::run(&mut client).unwrap();
    let calls_after_first = broker.calls().len();

    let err = lifecycle::run(&mut client).unwrap_err();
    assert!(matches!(
        err,
        RunError::Stage {
            stage: Stage::Validate,
            source: ClientError::OutOfOrder { .. }
        }
    ));
    assert_eq!(broker.calls().len(), calls_after_first);
}
