//! Configuration
//!
//! Three layers, later wins:
//! 1. Built-in defaults (`default.toml`, embedded at compile time)
//! 2. User config: `$RAI_CONFIG`, or `~/.config/rai/config.toml` when present
//! 3. CLI flags
//!
//! The merged value is validated, then typed into [`AppConfig`]. Loading
//! happens once at startup and the result is passed around explicitly.

mod layers;
mod merge;

pub use layers::{ConfigOrigin, ConfigSource};
pub use merge::{deep_merge, merge_layers};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::ClientSettings;
use crate::options::PathResolution;
use crate::throttle::SubmissionThrottle;
use crate::util::expand_home;

const DEFAULT_TOML: &str = include_str!("default.toml");

/// Environment variable naming an explicit user config file
pub const CONFIG_ENV: &str = "RAI_CONFIG";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to parse config {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("invalid config: {0}")]
    Validation(String),

    #[error("invalid config value: {0}")]
    Type(#[from] serde_json::Error),
}

/// Where the user layer comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub path: PathBuf,
    /// Explicitly requested files must exist
    pub required: bool,
}

impl UserConfig {
    /// `$RAI_CONFIG` if set, otherwise the optional file under `$HOME`
    pub fn discover() -> Option<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
            return Some(Self {
                path: PathBuf::from(path),
                required: true,
            });
        }
        std::env::var_os("HOME").map(|home| Self {
            path: PathBuf::from(home).join(".config/rai/config.toml"),
            required: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub spool_dir: String,
    pub poll_interval_ms: u64,
    /// 0 means unlimited
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSettings {
    pub timeout_seconds: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub min_interval_seconds: u64,
    pub state_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSettings {
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSettings {
    pub lenient: bool,
}

/// Effective application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    pub color: bool,
    pub verbose: bool,
    pub debug: bool,
    /// Enables submission tags (`--submit`)
    pub project_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub broker: BrokerSettings,
    pub wait: WaitSettings,
    pub rate_limit: RateLimitSettings,
    pub record: RecordSettings,
    pub paths: PathSettings,

    #[serde(skip)]
    sources: Vec<ConfigSource>,
}

impl AppConfig {
    /// Built-in defaults only
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_layers(None, Value::Object(Default::default()))
    }

    /// Discover the user file and merge `cli` over it
    pub fn load(cli: Value) -> Result<Self, ConfigError> {
        Self::from_layers(UserConfig::discover().as_ref(), cli)
    }

    pub fn from_layers(user: Option<&UserConfig>, cli: Value) -> Result<Self, ConfigError> {
        let mut layers = vec![layers::parse_toml("built-in defaults", DEFAULT_TOML)?];
        let mut sources = vec![ConfigSource::builtin()];

        if let Some(user) = user {
            if user.required || user.path.exists() {
                let (value, digest) = layers::load_toml_file(&user.path)?;
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::User,
                    path: Some(user.path.display().to_string()),
                    digest: Some(digest),
                });
            }
        }

        if cli.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            layers.push(cli);
            sources.push(ConfigSource::cli());
        }

        let merged = merge_layers(layers);
        validate(&merged)?;

        let mut config: AppConfig = serde_json::from_value(merged)?;
        config.sources = sources;
        Ok(config)
    }

    /// Layers that contributed, lowest precedence first
    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// JSON view with secrets replaced, safe to log
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        layers::redact_secrets(&mut value);
        value
    }

    pub fn path_resolution(&self) -> PathResolution {
        if self.paths.lenient {
            PathResolution::Lenient
        } else {
            PathResolution::Strict
        }
    }

    pub fn spool_dir(&self) -> PathBuf {
        expand_home(&self.broker.spool_dir)
    }

    pub fn records_dir(&self) -> PathBuf {
        expand_home(&self.record.dir)
    }

    pub fn throttle_state_file(&self) -> PathBuf {
        expand_home(&self.rate_limit.state_file)
    }

    /// Settings handed to the job client
    pub fn client_settings(&self) -> ClientSettings {
        let throttle = self.rate_limit.enabled.then(|| {
            SubmissionThrottle::new(
                self.throttle_state_file(),
                Duration::from_secs(self.rate_limit.min_interval_seconds),
            )
        });

        ClientSettings {
            wait_timeout: match self.wait.timeout_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            poll_interval: Duration::from_millis(self.wait.poll_interval_ms),
            throttle,
            secret: self.secret.clone().filter(|s| !s.is_empty()),
            max_bundle_bytes: self.broker.max_upload_bytes,
        }
    }
}

fn validate(config: &Value) -> Result<(), ConfigError> {
    let get_u64 = |path: &str| -> Option<u64> {
        path.split('.')
            .try_fold(config, |v, part| v.get(part))
            .and_then(Value::as_u64)
    };

    if config
        .get("app_name")
        .and_then(Value::as_str)
        .map(|s| s.trim().is_empty())
        .unwrap_or(true)
    {
        return Err(ConfigError::Validation("app_name must not be empty".to_string()));
    }

    for key in ["wait.poll_interval_ms", "broker.poll_interval_ms"] {
        if let Some(ms) = get_u64(key) {
            if ms == 0 || ms > 60_000 {
                return Err(ConfigError::Validation(format!("{} must be in (0, 60000]", key)));
            }
        }
    }

    if let Some(secs) = get_u64("wait.timeout_seconds") {
        if secs > 7 * 86_400 {
            return Err(ConfigError::Validation(
                "wait.timeout_seconds must be at most 604800".to_string(),
            ));
        }
    }

    if let Some(secs) = get_u64("rate_limit.min_interval_seconds") {
        if secs > 86_400 {
            return Err(ConfigError::Validation(
                "rate_limit.min_interval_seconds must be at most 86400".to_string(),
            ));
        }
    }

    Ok(())
}

/// Path of the loaded user layer, if any
pub fn user_layer_path(config: &AppConfig) -> Option<&Path> {
    config
        .sources()
        .iter()
        .find(|s| s.origin == ConfigOrigin::User)
        .and_then(|s| s.path.as_deref())
        .map(Path::new)
}
