//! Build file loading
//!
//! The build file (`rai_build.yml` by default) tells the remote worker which
//! image to use and which commands to run. The client only needs enough of
//! it to reject obviously broken submissions and to infer a queue; the
//! raw contents are forwarded untouched in the publish request.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Architecture assumed when the build file does not name one
pub const DEFAULT_ARCHITECTURE: &str = "amd64";

/// Errors for build file operations
#[derive(Debug, thiserror::Error)]
pub enum BuildFileError {
    #[error("build file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read build file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse build file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid build file {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Parsed build specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub rai: RaiSection,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub commands: Commands,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiSection {
    #[serde(deserialize_with = "version_string")]
    pub version: String,
    #[serde(default)]
    pub image: String,
    /// Explicit queue; takes precedence over architecture inference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: CpuResources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuResources>,
    #[serde(default)]
    pub network: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuResources {
    #[serde(default = "default_architecture")]
    pub architecture: String,
}

impl Default for CpuResources {
    fn default() -> Self {
        Self {
            architecture: default_architecture(),
        }
    }
}

fn default_architecture() -> String {
    DEFAULT_ARCHITECTURE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuResources {
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub build: Vec<String>,
}

/// `version: 0.2` and `version: "0.2"` are both accepted
fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a version number or string, found {:?}",
            other
        ))),
    }
}

/// A loaded build file: where it came from, its raw text and the parsed spec
#[derive(Debug, Clone)]
pub struct BuildFile {
    pub path: PathBuf,
    pub contents: String,
    pub spec: BuildSpec,
}

impl BuildFile {
    /// Read, parse and validate a build file
    pub fn load(path: &Path) -> Result<Self, BuildFileError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BuildFileError::NotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(BuildFileError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, contents)
    }

    /// Parse and validate build file contents
    pub fn parse(path: &Path, contents: String) -> Result<Self, BuildFileError> {
        let spec: BuildSpec =
            serde_yaml::from_str(&contents).map_err(|source| BuildFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let invalid = |reason: &str| BuildFileError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if spec.rai.version.trim().is_empty() {
            return Err(invalid("rai.version must not be empty"));
        }
        if spec.rai.image.trim().is_empty() {
            return Err(invalid("rai.image must be set"));
        }
        if spec.commands.build.is_empty() {
            return Err(invalid("commands.build must list at least one command"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            contents,
            spec,
        })
    }

    /// Queue named by the build file, or `rai_<architecture>`
    pub fn inferred_queue(&self) -> String {
        match self.spec.rai.queue.as_deref() {
            Some(queue) if !queue.trim().is_empty() => queue.to_string(),
            _ => format!("rai_{}", self.spec.resources.cpu.architecture),
        }
    }

    /// Explicit queue if given, otherwise the inferred one
    pub fn resolve_queue(&self, explicit: Option<&str>) -> String {
        match explicit {
            Some(queue) if !queue.is_empty() => queue.to_string(),
            _ => self.inferred_queue(),
        }
    }
}
