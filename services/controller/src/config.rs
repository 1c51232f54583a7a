//! Configuration for a run.
//!
//! Values come from, in order of precedence: command-line flags (with
//! `HOSTCYCLE_*` environment fallbacks), an optional TOML file, and built-in
//! defaults. Everything is validated before the controller starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::controller::{ControllerOptions, PhaseTimings};

pub const DEFAULT_PHASE1_MINUTES: u64 = 60;
pub const DEFAULT_POLL_MINUTES: u64 = 5;
pub const DEFAULT_GRACE_MINUTES: u64 = 2;
pub const DEFAULT_PHASE2_MINUTES: u64 = 30;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// hostcycle - drain and reboot a tagged fleet of session hosts.
#[derive(Debug, Default, Parser)]
#[command(name = "hostcycle")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML file with default settings.
    #[arg(long, env = "HOSTCYCLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tag selecting the machines to cycle.
    #[arg(long, env = "HOSTCYCLE_TAG")]
    pub tag: Option<String>,

    /// Broker API base URL.
    #[arg(long, env = "HOSTCYCLE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Bearer token for the broker API.
    #[arg(long, env = "HOSTCYCLE_BROKER_TOKEN", hide_env_values = true)]
    pub broker_token: Option<String>,

    /// Drain phase budget in minutes.
    #[arg(long, env = "HOSTCYCLE_PHASE1_MINUTES")]
    pub phase1_minutes: Option<u64>,

    /// Minutes between drain iterations.
    #[arg(long, env = "HOSTCYCLE_POLL_MINUTES")]
    pub poll_minutes: Option<u64>,

    /// Minutes to wait after restarts before checking registration.
    #[arg(long, env = "HOSTCYCLE_GRACE_MINUTES")]
    pub grace_minutes: Option<u64>,

    /// Fallback phase budget in minutes.
    #[arg(long, env = "HOSTCYCLE_PHASE2_MINUTES")]
    pub phase2_minutes: Option<u64>,

    /// Count only active sessions when deciding whether a machine is drained.
    #[arg(long, env = "HOSTCYCLE_ACTIVE_ONLY", num_args = 0..=1, default_missing_value = "true")]
    pub active_only: Option<bool>,

    /// Send the maintenance notice to active sessions on the first iteration.
    #[arg(long, env = "HOSTCYCLE_NOTIFY_USERS", num_args = 0..=1, default_missing_value = "true")]
    pub notify_users: Option<bool>,

    /// Notification template (title line, then body lines).
    #[arg(long, env = "HOSTCYCLE_MESSAGE_FILE")]
    pub message_file: Option<PathBuf>,

    /// Directory holding run lock files.
    #[arg(long, env = "HOSTCYCLE_LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Maximum concurrent broker calls per step.
    #[arg(long, env = "HOSTCYCLE_BROKER_CONCURRENCY")]
    pub broker_concurrency: Option<usize>,

    /// Broker request timeout in seconds.
    #[arg(long, env = "HOSTCYCLE_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Log format.
    #[arg(long, env = "HOSTCYCLE_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// Append logs to this file instead of stderr.
    #[arg(long, env = "HOSTCYCLE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Write the run summary as JSON to this file.
    #[arg(long, env = "HOSTCYCLE_SUMMARY_FILE")]
    pub summary_file: Option<PathBuf>,
}

/// Settings read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub tag: Option<String>,
    pub broker_url: Option<String>,
    pub broker_token: Option<String>,
    pub phase1_minutes: Option<u64>,
    pub poll_minutes: Option<u64>,
    pub grace_minutes: Option<u64>,
    pub phase2_minutes: Option<u64>,
    pub active_only: Option<bool>,
    pub notify_users: Option<bool>,
    pub message_file: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub broker_concurrency: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub log_format: Option<LogFormat>,
    pub log_file: Option<PathBuf>,
    pub summary_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Validated run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tag: String,
    pub broker_url: String,
    pub broker_token: Option<String>,
    pub phase1_minutes: u64,
    pub poll_minutes: u64,
    pub grace_minutes: u64,
    pub phase2_minutes: u64,
    pub active_only: bool,
    pub notify_users: bool,
    pub message_file: PathBuf,
    pub lock_dir: PathBuf,
    pub broker_concurrency: usize,
    pub request_timeout: Duration,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
    pub summary_file: Option<PathBuf>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "hostcycle", "hostcycle")
}

fn default_message_file() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("notification.txt"))
        .unwrap_or_else(|| std::env::temp_dir().join("hostcycle").join("notification.txt"))
}

fn default_lock_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().join("locks"))
        .unwrap_or_else(|| std::env::temp_dir().join("hostcycle").join("locks"))
}

impl Settings {
    /// Resolve settings from the command line and the optional config file.
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Merge command-line values over file values over defaults.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let settings = Self {
            tag: cli.tag.or(file.tag).ok_or(ConfigError::Missing("tag"))?,
            broker_url: cli
                .broker_url
                .or(file.broker_url)
                .ok_or(ConfigError::Missing("broker_url"))?,
            broker_token: cli.broker_token.or(file.broker_token),
            phase1_minutes: cli
                .phase1_minutes
                .or(file.phase1_minutes)
                .unwrap_or(DEFAULT_PHASE1_MINUTES),
            poll_minutes: cli
                .poll_minutes
                .or(file.poll_minutes)
                .unwrap_or(DEFAULT_POLL_MINUTES),
            grace_minutes: cli
                .grace_minutes
                .or(file.grace_minutes)
                .unwrap_or(DEFAULT_GRACE_MINUTES),
            phase2_minutes: cli
                .phase2_minutes
                .or(file.phase2_minutes)
                .unwrap_or(DEFAULT_PHASE2_MINUTES),
            active_only: cli.active_only.or(file.active_only).unwrap_or(false),
            notify_users: cli.notify_users.or(file.notify_users).unwrap_or(true),
            message_file: cli
                .message_file
                .or(file.message_file)
                .unwrap_or_else(default_message_file),
            lock_dir: cli
                .lock_dir
                .or(file.lock_dir)
                .unwrap_or_else(default_lock_dir),
            broker_concurrency: cli
                .broker_concurrency
                .or(file.broker_concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            request_timeout: Duration::from_secs(
                cli.request_timeout_secs
                    .or(file.request_timeout_secs)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            log_format: cli.log_format.or(file.log_format).unwrap_or_default(),
            log_file: cli.log_file.or(file.log_file),
            summary_file: cli.summary_file.or(file.summary_file),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tag.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "tag",
                reason: "must not be empty".to_string(),
            });
        }

        let url = self.broker_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "broker_url",
                reason: format!("expected an http(s) URL, got '{url}'"),
            });
        }

        for (field, value) in [
            ("phase1_minutes", self.phase1_minutes),
            ("poll_minutes", self.poll_minutes),
            ("grace_minutes", self.grace_minutes),
            ("phase2_minutes", self.phase2_minutes),
            ("request_timeout_secs", self.request_timeout.as_secs()),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a positive integer".to_string(),
                });
            }
        }

        if self.broker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "broker_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn timings(&self) -> PhaseTimings {
        PhaseTimings::from_minutes(
            self.phase1_minutes,
            self.poll_minutes,
            self.grace_minutes,
            self.phase2_minutes,
        )
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            timings: self.timings(),
            notify_users: self.notify_users,
            concurrency: self.broker_concurrency,
        }
    }
}
