//! Shared test fixtures
//!
//! - a scratch project directory with a valid `rai_build.yml`
//! - capture sinks for job output
//! - a spool worker thread that answers published jobs

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rai_client::options::CaptureBuffer;
use rai_client::{JobEvent, OptionSet, OutputSink, SpoolBroker, SubmissionTag};
use rai_protocol::PublishRequest;
use tempfile::TempDir;

pub const BUILD_FILE: &str = r#"rai:
  version: 0.2
  image: webgpu/rai:root
resources:
  cpu:
    architecture: amd64
commands:
  build:
    - cmake /src
    - make
"#;

/// Scratch workspace: `project/` to submit plus state directories beside it
pub struct Workspace {
    temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src")).unwrap();
        fs::write(project.join("rai_build.yml"), BUILD_FILE).unwrap();
        fs::write(project.join("src/main.cu"), "int main() { return 0; }\n").unwrap();
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn project(&self) -> PathBuf {
        self.temp.path().join("project")
    }

    pub fn records_dir(&self) -> PathBuf {
        self.temp.path().join("records")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.temp.path().join("spool")
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.records_dir().join(format!("{}.json", job_id))
    }

    /// Write a user config pointing every state path into the workspace
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.temp.path().join("config.toml");
        let contents = format!(
            "color = false\n{extra}\n\n[broker]\nspool_dir = \"{spool}\"\npoll_interval_ms = 10\n\n[wait]\ntimeout_seconds = 30\npoll_interval_ms = 20\n\n[rate_limit]\nstate_file = \"{state}\"\n\n[record]\ndir = \"{records}\"\n",
            extra = extra,
            spool = self.spool_dir().display(),
            state = self.temp.path().join("throttle.json").display(),
            records = self.records_dir().display(),
        );
        fs::write(&path, contents).unwrap();
        path
    }
}

/// Captured stdout/stderr of a run
pub struct Captured {
    pub stdout: CaptureBuffer,
    pub stderr: CaptureBuffer,
}

/// Options for `dir` with output captured
pub fn options(dir: &Path, tag: Option<SubmissionTag>) -> (OptionSet, Captured) {
    let (out, stdout) = OutputSink::capture();
    let (err, stderr) = OutputSink::capture();
    let options = OptionSet::builder(dir)
        .stdout(out)
        .stderr(err)
        .submission_tag(tag)
        .build();
    (options, Captured { stdout, stderr })
}

/// Wait for one job on `queue`, then append `events` for it
pub fn spawn_spool_worker(
    broker: SpoolBroker,
    queue: &str,
    events: Vec<JobEvent>,
) -> JoinHandle<Option<PublishRequest>> {
    let queue = queue.to_string();
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if let Some(job) = broker.pending_jobs(&queue).ok()?.into_iter().next() {
                for event in &events {
                    broker.append_event(&job.job_id, event).ok()?;
                }
                return Some(job);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    })
}
