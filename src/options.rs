//! Submission options
//!
//! The [`OptionSet`] is the immutable description of one submission: which
//! directory to package, where remote output goes, which queue to target and
//! how the job is classified. It is built once through [`OptionSetBuilder`]
//! and never mutated afterwards; a re-submission builds a new one.

use std::env;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use rai_protocol::DEFAULT_BUILD_FILE;

use crate::submission::SubmissionTag;

/// Errors raised while checking submission options
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("directory not readable: {path}: {source}")]
    DirectoryNotReadable { path: PathBuf, source: io::Error },

    #[error("{field} path could not be resolved: {path}: {reason}")]
    PathResolution {
        field: PathField,
        path: PathBuf,
        reason: String,
    },
}

/// Check that a working directory exists and can be listed.
///
/// Callers run this before any lifecycle stage; the Validate stage repeats it.
pub fn check_working_dir(path: &Path) -> Result<(), OptionsError> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(OptionsError::DirectoryNotFound(path.to_path_buf()))
        }
        Err(source) => {
            return Err(OptionsError::DirectoryNotReadable {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if !metadata.is_dir() {
        return Err(OptionsError::NotADirectory(path.to_path_buf()));
    }

    fs::read_dir(path).map_err(|source| OptionsError::DirectoryNotReadable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// How unresolvable paths are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathResolution {
    /// Keep the failure and let Validate reject the submission
    #[default]
    Strict,
    /// Keep the original, possibly relative, path and carry on
    Lenient,
}

/// Which option a path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathField {
    Directory,
    BuildFile,
}

impl fmt::Display for PathField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathField::Directory => write!(f, "directory"),
            PathField::BuildFile => write!(f, "build file"),
        }
    }
}

/// A path that could not be made absolute under strict resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIssue {
    pub field: PathField,
    pub path: PathBuf,
    pub reason: String,
}

impl PathIssue {
    pub fn to_error(&self) -> OptionsError {
        OptionsError::PathResolution {
            field: self.field,
            path: self.path.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Make a path absolute against the process working directory
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot resolve an empty path",
        ));
    }

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

/// Shareable output destination for remote progress and logs
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<dyn Write + Send>>,
    label: &'static str,
}

impl OutputSink {
    /// Wrap any writer
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
            label: "custom",
        }
    }

    /// Process standard output
    pub fn stdout() -> Self {
        Self {
            inner: Arc::new(Mutex::new(io::stdout())),
            label: "stdout",
        }
    }

    /// Process standard error
    pub fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(io::stderr())),
            label: "stderr",
        }
    }

    /// In-memory sink plus a handle to read back what was written
    pub fn capture() -> (Self, CaptureBuffer) {
        let buffer = CaptureBuffer::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Write and flush a chunk
    pub fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink lock poisoned"))?;
        writer.write_all(bytes)?;
        writer.flush()
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink").field("label", &self.label).finish()
    }
}

/// Cloneable in-memory writer backing [`OutputSink::capture`]
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Immutable description of one submission
#[derive(Debug, Clone)]
pub struct OptionSet {
    directory: PathBuf,
    stdout: OutputSink,
    stderr: OutputSink,
    queue_name: Option<String>,
    build_file_path: Option<PathBuf>,
    rate_limit_enabled: bool,
    submission_tag: Option<SubmissionTag>,
    path_resolution: PathResolution,
    path_issues: Vec<PathIssue>,
}

impl OptionSet {
    /// Start building options for the given working directory
    pub fn builder(directory: impl Into<PathBuf>) -> OptionSetBuilder {
        OptionSetBuilder::new(directory)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn stdout(&self) -> &OutputSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputSink {
        &self.stderr
    }

    /// Explicit queue, `None` when it should be inferred from the build file
    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }

    /// Explicit build file override
    pub fn build_file_path(&self) -> Option<&Path> {
        self.build_file_path.as_deref()
    }

    /// Build file to load: the override, or the default name inside the directory
    pub fn build_file(&self) -> PathBuf {
        self.build_file_path
            .clone()
            .unwrap_or_else(|| self.directory.join(DEFAULT_BUILD_FILE))
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.rate_limit_enabled
    }

    pub fn submission_tag(&self) -> Option<&SubmissionTag> {
        self.submission_tag.as_ref()
    }

    pub fn path_resolution(&self) -> PathResolution {
        self.path_resolution
    }

    /// Paths that failed strict resolution
    pub fn path_issues(&self) -> &[PathIssue] {
        &self.path_issues
    }
}

/// Builder for [`OptionSet`]
#[derive(Debug)]
pub struct OptionSetBuilder {
    directory: PathBuf,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    queue_name: Option<String>,
    build_file_path: Option<PathBuf>,
    rate_limit_enabled: bool,
    submission_tag: Option<SubmissionTag>,
    path_resolution: PathResolution,
}

impl OptionSetBuilder {
    fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            stdout: None,
            stderr: None,
            queue_name: None,
            build_file_path: None,
            rate_limit_enabled: true,
            submission_tag: None,
            path_resolution: PathResolution::default(),
        }
    }

    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = Some(sink);
        self
    }

    /// Target queue; an empty name means "infer from the build file"
    pub fn queue_name(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        self.queue_name = if queue.is_empty() { None } else { Some(queue) };
        self
    }

    /// Build file override; an empty path means "use the default"
    pub fn build_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.build_file_path = if path.as_os_str().is_empty() {
            None
        } else {
            Some(path)
        };
        self
    }

    pub fn rate_limit(mut self, enabled: bool) -> Self {
        self.rate_limit_enabled = enabled;
        self
    }

    pub fn disable_rate_limit(self) -> Self {
        self.rate_limit(false)
    }

    pub fn submission_tag(mut self, tag: Option<SubmissionTag>) -> Self {
        self.submission_tag = tag;
        self
    }

    pub fn path_resolution(mut self, policy: PathResolution) -> Self {
        self.path_resolution = policy;
        self
    }

    /// Capture everything into an [`OptionSet`]
    pub fn build(self) -> OptionSet {
        let policy = self.path_resolution;
        let mut issues = Vec::new();

        let directory = resolve_path(PathField::Directory, self.directory, policy, &mut issues);
        let build_file_path = self
            .build_file_path
            .map(|p| resolve_path(PathField::BuildFile, p, policy, &mut issues));

        OptionSet {
            directory,
            stdout: self.stdout.unwrap_or_else(OutputSink::stdout),
            stderr: self.stderr.unwrap_or_else(OutputSink::stderr),
            queue_name: self.queue_name,
            build_file_path,
            rate_limit_enabled: self.rate_limit_enabled,
            submission_tag: self.submission_tag,
            path_resolution: policy,
            path_issues: issues,
        }
    }
}

fn resolve_path(
    field: PathField,
    path: PathBuf,
    policy: PathResolution,
    issues: &mut Vec<PathIssue>,
) -> PathBuf {
    match absolutize(&path) {
        Ok(resolved) => resolved,
        Err(e) => {
            match policy {
                PathResolution::Strict => issues.push(PathIssue {
                    field,
                    path: path.clone(),
                    reason: e.to_string(),
                }),
                PathResolution::Lenient => tracing::debug!(
                    %field,
                    path = %path.display(),
                    error = %e,
                    "keeping unresolved path"
                ),
            }
            path
        }
    }
}
