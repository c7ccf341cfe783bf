//! rai CLI
//!
//! Entry point for the `rai` command-line tool.

use clap::{CommandFactory, FromArgMatches, Parser};
use rai_client::options::check_working_dir;
use rai_client::{
    lifecycle, logging, submission, AppConfig, ConfigError, FileRecorder, JobClient, OptionSet,
    OptionsError, RunError, SpoolBroker, SpoolConfig,
};
use serde_json::{json, Map, Value};
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rai")]
#[command(about = "Submit a directory as a job to the rai job queue", version)]
struct Cli {
    /// Directory to submit (default: current directory)
    #[arg(short = 'p', long)]
    path: Option<PathBuf>,

    /// Build file to use instead of <path>/rai_build.yml
    #[arg(short = 'f', long)]
    build: Option<PathBuf>,

    /// Queue to submit to (default: inferred from the build file)
    #[arg(short = 'q', long)]
    queue: Option<String>,

    #[arg(short = 's', long, hide = true)]
    secret: Option<String>,

    /// Colored output
    #[arg(short = 'c', long, num_args = 0..=1, default_missing_value = "true")]
    color: Option<bool>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Debug output
    #[arg(short = 'd', long)]
    debug: bool,

    #[arg(long, hide = true, num_args = 0..=1, default_missing_value = "true")]
    ratelimit: Option<bool>,

    /// Submission tag: m1, m2, m3, m4, final, or a custom label
    #[arg(long)]
    submit: Option<String>,

    #[arg(long, hide = true)]
    lenient_paths: bool,
}

impl Cli {
    /// Flags that were actually given, as a config layer
    fn overrides(&self) -> Value {
        let mut layer = Map::new();
        if let Some(color) = self.color {
            layer.insert("color".into(), json!(color));
        }
        if self.verbose {
            layer.insert("verbose".into(), json!(true));
        }
        if self.debug {
            layer.insert("debug".into(), json!(true));
        }
        if let Some(secret) = &self.secret {
            layer.insert("secret".into(), json!(secret));
        }
        if let Some(enabled) = self.ratelimit {
            layer.insert("rate_limit".into(), json!({ "enabled": enabled }));
        }
        if self.lenient_paths {
            layer.insert("paths".into(), json!({ "lenient": true }));
        }
        Value::Object(layer)
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("--submit is only available in project mode")]
    SubmitOutsideProjectMode,

    #[error("cannot determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Run(#[from] RunError),
}

fn main() {
    // Project mode decides whether --submit is advertised
    let project_mode = match AppConfig::load(json!({})) {
        Ok(config) => config.project_mode,
        Err(e) => {
            eprintln!("rai: {}", e);
            process::exit(1);
        }
    };

    let matches = Cli::command()
        .mut_arg("submit", |arg| arg.hide(!project_mode))
        .get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Err(e) = run(cli) {
        eprintln!("rai: {}", e);
        process::exit(1);
    }
}

/// Directory to submit: `-p`, or the current directory
fn submit_dir(
    path: Option<PathBuf>,
    current_dir: impl FnOnce() -> io::Result<PathBuf>,
) -> Result<PathBuf, CliError> {
    match path {
        Some(path) => Ok(path),
        None => current_dir().map_err(CliError::CurrentDir),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = AppConfig::load(cli.overrides())?;
    logging::init(config.verbose, config.debug, config.color);
    tracing::debug!(config = %config.redacted(), "effective configuration");

    if cli.submit.is_some() && !config.project_mode {
        return Err(CliError::SubmitOutsideProjectMode);
    }
    let tag = submission::resolve_for_mode(cli.submit.as_deref(), config.project_mode);

    let directory = submit_dir(cli.path, std::env::current_dir)?;
    check_working_dir(&directory)?;

    let options = OptionSet::builder(directory)
        .queue_name(cli.queue.unwrap_or_default())
        .build_file_path(cli.build.unwrap_or_default())
        .rate_limit(config.rate_limit.enabled)
        .submission_tag(tag)
        .path_resolution(config.path_resolution())
        .build();

    let broker = SpoolBroker::new(
        SpoolConfig::new(config.spool_dir())
            .with_poll_interval(Duration::from_millis(config.broker.poll_interval_ms)),
    );
    let recorder = FileRecorder::new(config.records_dir());

    let mut client = JobClient::new(
        options,
        Arc::new(broker),
        Arc::new(recorder),
        config.client_settings(),
    );
    tracing::debug!(job_id = %client.job_id(), "starting submission");

    let outcome = lifecycle::run(&mut client)?;
    tracing::info!(job_id = %outcome.job_id, "job succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_only_given_flags() {
        let cli = Cli::try_parse_from(["rai", "-p", "/tmp/project"]).unwrap();
        assert_eq!(cli.overrides(), json!({}));

        let cli = Cli::try_parse_from(["rai", "--color=false", "-v", "--ratelimit=false"]).unwrap();
        assert_eq!(
            cli.overrides(),
            json!({"color": false, "verbose": true, "rate_limit": {"enabled": false}})
        );
    }

    #[test]
    fn test_bare_color_flag_means_true() {
        let cli = Cli::try_parse_from(["rai", "--color"]).unwrap();
        assert_eq!(cli.color, Some(true));
    }

    #[test]
    fn test_submit_dir_prefers_path_flag() {
        let dir = submit_dir(Some(PathBuf::from("/tmp/project")), || {
            panic!("current directory should not be consulted")
        })
        .unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/project"));

        let dir = submit_dir(None, || Ok(PathBuf::from("/home/student/mp1"))).unwrap();
        assert_eq!(dir, PathBuf::from("/home/student/mp1"));
    }

    #[test]
    fn test_unreadable_current_dir_is_reported() {
        let err = submit_dir(None, || {
            Err(io::Error::new(io::ErrorKind::NotFound, "deleted"))
        })
        .unwrap_err();

        assert!(matches!(err, CliError::CurrentDir(_)));
        assert_eq!(
            err.to_string(),
            "cannot determine the current directory: deleted"
        );
    }

    #[test]
    fn test_submit_parses_regardless_of_visibility() {
        let matches = Cli::command()
            .mut_arg("submit", |arg| arg.hide(true))
            .try_get_matches_from(["rai", "--submit", "m2"])
            .unwrap();
        let cli = Cli::from_arg_matches(&matches).unwrap();
        assert_eq!(cli.submit.as_deref(), Some("m2"));
    }
}
