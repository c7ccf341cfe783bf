//! Exit codes of the `rai` binary

mod fixtures;

use std::process::{Command, Output};
use std::time::Duration;

use fixtures::{spawn_spool_worker, Workspace};
use rai_client::{JobEvent, JobState, SpoolBroker, SpoolConfig, SubmissionTag};

fn rai(ws: &Workspace, config_extra: &str, args: &[&str]) -> Output {
    let config = ws.write_config(config_extra);
    Command::new(env!("CARGO_BIN_EXE_rai"))
        .args(args)
        .env("RAI_CONFIG", &config)
        .env("HOME", ws.root())
        .env_remove("RUST_LOG")
        .output()
        .expect("run rai")
}

fn spool(ws: &Workspace) -> SpoolBroker {
    SpoolBroker::new(SpoolConfig::new(ws.spool_dir()).with_poll_interval(Duration::from_millis(5)))
}

#[test]
fn test_successful_submission_exits_zero() {
    let ws = Workspace::new();
    let worker = spawn_spool_worker(
        spool(&ws),
        "rai_amd64",
        vec![
            JobEvent::stdout("Built target main\n"),
            JobEvent::terminal(JobState::Succeeded, None),
        ],
    );

    let project = ws.project();
    let output = rai(
        &ws,
        "project_mode = true",
        &["-p", project.to_str().unwrap(), "--submit", "final"],
    );
    let job = worker.join().unwrap().expect("worker saw the job");

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Built target main"));
    assert_eq!(job.submission, Some(SubmissionTag::Final));
    assert!(ws.record_path(&job.job_id).is_file());
}

#[test]
fn test_missing_directory_exits_one() {
    let ws = Workspace::new();
    let missing = ws.root().join("nope");

    let output = rai(&ws, "", &["-p", missing.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("directory not found"));
    assert!(!ws.spool_dir().join("queues").exists());
}

#[test]
fn test_submit_outside_project_mode_exits_one() {
    let ws = Workspace::new();
    let project = ws.project();

    let output = rai(&ws, "", &["-p", project.to_str().unwrap(), "--submit", "m1"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("project mode"));
    assert!(!ws.spool_dir().exists());
}

#[test]
fn test_remote_failure_exits_one() {
    let ws = Workspace::new();
    let worker = spawn_spool_worker(
        spool(&ws),
        "rai_amd64",
        vec![JobEvent::terminal(JobState::Failed, Some("make: *** [all] Error 2"))],
    );

    let project = ws.project();
    let output = rai(&ws, "", &["-p", project.to_str().unwrap()]);
    let job = worker.join().unwrap().expect("worker saw the job");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error 2"));
    assert!(ws.record_path(&job.job_id).is_file());
}

#[test]
fn test_help_hides_submit_outside_project_mode() {
    let ws = Workspace::new();

    let plain = rai(&ws, "", &["--help"]);
    assert_eq!(plain.status.code(), Some(0));
    assert!(!String::from_utf8_lossy(&plain.stdout).contains("--submit"));

    let project = rai(&ws, "project_mode = true", &["--help"]);
    assert!(String::from_utf8_lossy(&project.stdout).contains("--submit"));
}
