//! Run configuration.
//!
//! Layers, lowest first: built-in defaults, the TOML config file, `FLEET_BACKUP_*`
//! environment variables, then command-line flags. The result is an immutable
//! [`RunConfig`] shared by everything in the run.
//!
//! ```toml
//! hosts_file = "/etc/hosts"
//! source_path = "/var/backups"
//! file_pattern = "*.tgz"
//! dest_root = "/srv/fleet-backup"
//! retention_days = 7
//! remote_account = "backup"
//! workers = 4
//! alert_command = "mail -s \"{subject}\" backup-ops@example.com"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::fleet::hosts::DEFAULT_ENV_TAGS;
use crate::fleet::location::Location;
use crate::fleet::probe::{DEFAULT_PROBE_PORT, DEFAULT_PROBE_TIMEOUT_SECS};
use crate::fleet::remote::SshOptions;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FLEET_BACKUP_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Config file contents. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub hosts_file: Option<PathBuf>,
    pub source_path: Option<String>,
    pub file_pattern: Option<String>,
    pub dest_root: Option<PathBuf>,
    pub retention_days: Option<u32>,
    pub remote_account: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_path: Option<String>,
    pub rsync_path: Option<String>,
    pub probe_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub transfer_timeout_secs: Option<u64>,
    pub host_deadline_secs: Option<u64>,
    pub workers: Option<usize>,
    pub env_tag: Option<char>,
    pub env_tags: Option<Vec<char>>,
    pub log_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub alert_command: Option<String>,
    pub secondary: Option<String>,
}

/// Values given by the positional `SOURCE PATTERN DESTINATION RETENTION_DAYS` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOverride {
    pub source_path: String,
    pub file_pattern: String,
    pub dest_root: PathBuf,
    pub retention_days: u32,
}

/// Immutable settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Address table hosts are read from.
    pub hosts_file: PathBuf,
    /// Backup directory on each remote host.
    pub source_path: String,
    pub file_pattern: String,
    /// Local aggregate root; each host gets `<dest_root>/<short_name>`.
    pub dest_root: PathBuf,
    pub retention_days: u32,
    pub remote_account: String,
    pub ssh_port: u16,
    pub ssh_path: String,
    pub rsync_path: String,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout_secs: u64,
    /// Hard ceiling for one host's probe + prune + sync.
    pub host_deadline: Duration,
    pub workers: usize,
    /// Fixed environment tag; detected from the local host name when unset.
    pub env_tag: Option<char>,
    pub env_tags: Vec<char>,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
    pub alert_command: Option<String>,
    pub secondary: Option<Location>,
    pub dry_run: bool,
    pub debug: bool,
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "fleet-backup", "fleet-backup")
}

impl Default for RunConfig {
    fn default() -> Self {
        let data_dir = project_dirs()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/var/lib/fleet-backup"));
        Self {
            hosts_file: PathBuf::from("/etc/hosts"),
            source_path: "/var/backups".to_string(),
            file_pattern: "*.tgz".to_string(),
            dest_root: PathBuf::from("/srv/fleet-backup"),
            retention_days: 7,
            remote_account: "backup".to_string(),
            ssh_port: DEFAULT_PROBE_PORT,
            ssh_path: "ssh".to_string(),
            rsync_path: "rsync".to_string(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(120),
            transfer_timeout_secs: 600,
            host_deadline: Duration::from_secs(3600),
            workers: 1,
            env_tag: None,
            env_tags: DEFAULT_ENV_TAGS.to_vec(),
            log_dir: data_dir.join("logs"),
            state_dir: data_dir,
            alert_command: None,
            secondary: None,
            dry_run: false,
            debug: false,
        }
    }
}

impl RunConfig {
    /// Defaults, then the config file (if any), then the environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(path) = config_path(explicit) {
            cfg.apply_file(read_file_config(&path)?)?;
        }
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(v) = file.hosts_file {
            self.hosts_file = v;
        }
        if let Some(v) = file.source_path {
            self.source_path = v;
        }
        if let Some(v) = file.file_pattern {
            self.file_pattern = v;
        }
        if let Some(v) = file.dest_root {
            self.dest_root = v;
        }
        if let Some(v) = file.retention_days {
            self.retention_days = v;
        }
        if let Some(v) = file.remote_account {
            self.remote_account = v;
        }
        if let Some(v) = file.ssh_port {
            self.ssh_port = v;
        }
        if let Some(v) = file.ssh_path {
            self.ssh_path = v;
        }
        if let Some(v) = file.rsync_path {
            self.rsync_path = v;
        }
        if let Some(v) = file.probe_timeout_secs {
            self.probe_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.command_timeout_secs {
            self.command_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.transfer_timeout_secs {
            self.transfer_timeout_secs = v;
        }
        if let Some(v) = file.host_deadline_secs {
            self.host_deadline = Duration::from_secs(v);
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if file.env_tag.is_some() {
            self.env_tag = file.env_tag;
        }
        if let Some(v) = file.env_tags {
            self.env_tags = v;
        }
        if let Some(v) = file.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = file.state_dir {
            self.state_dir = v;
        }
        if file.alert_command.is_some() {
            self.alert_command = file.alert_command;
        }
        if let Some(raw) = file.secondary {
            self.secondary = Some(parse_secondary(&raw)?);
        }
        Ok(())
    }

    /// Apply `FLEET_BACKUP_*` variables (a `.env` file is honored too).
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_HOSTS_FILE") {
            self.hosts_file = PathBuf::from(v);
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_SOURCE_PATH") {
            self.source_path = v;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_FILE_PATTERN") {
            self.file_pattern = v;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_DEST_ROOT") {
            self.dest_root = PathBuf::from(v);
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_RETENTION_DAYS") {
            self.retention_days = parse_number("FLEET_BACKUP_RETENTION_DAYS", &v)?;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_REMOTE_ACCOUNT") {
            self.remote_account = v;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_SSH_PORT") {
            self.ssh_port = parse_number("FLEET_BACKUP_SSH_PORT", &v)?;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_RSYNC_PATH") {
            self.rsync_path = v;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_SSH_PATH") {
            self.ssh_path = v;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_WORKERS") {
            self.workers = parse_number("FLEET_BACKUP_WORKERS", &v)?;
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_HOST_DEADLINE_SECS") {
            self.host_deadline =
                Duration::from_secs(parse_number("FLEET_BACKUP_HOST_DEADLINE_SECS", &v)?);
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_ENV_TAG") {
            let mut chars = v.trim().chars();
            match (chars.next(), chars.next()) {
                (Some(tag), None) => self.env_tag = Some(tag),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "FLEET_BACKUP_ENV_TAG",
                        reason: format!("`{v}` is not a single character"),
                    });
                }
            }
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = dotenvy::var("FLEET_BACKUP_ALERT_COMMAND") {
            self.alert_command = Some(v);
        }
        Ok(())
    }

    pub fn apply_override(&mut self, job: JobOverride) {
        self.source_path = job.source_path;
        self.file_pattern = job.file_pattern;
        self.dest_root = job.dest_root;
        self.retention_days = job.retention_days;
    }

    /// Reject settings the run cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_pattern.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "file_pattern",
                reason: "must not be empty".into(),
            });
        }
        if let Err(e) = glob::Pattern::new(&self.file_pattern) {
            return Err(ConfigError::Invalid {
                key: "file_pattern",
                reason: e.to_string(),
            });
        }
        if self.source_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "source_path",
                reason: "must not be empty".into(),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.host_deadline.is_zero() {
            return Err(ConfigError::Invalid {
                key: "host_deadline_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(tag) = self.env_tags.iter().find(|t| !t.is_ascii_lowercase()) {
            return Err(ConfigError::Invalid {
                key: "env_tags",
                reason: format!("`{tag}` is not a lowercase letter"),
            });
        }
        if let Some(tag) = self.env_tag
            && !tag.is_ascii_lowercase()
        {
            return Err(ConfigError::Invalid {
                key: "env_tag",
                reason: format!("`{tag}` is not a lowercase letter"),
            });
        }
        Ok(())
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_path: self.ssh_path.clone(),
            port: self.ssh_port,
            connect_timeout_secs: self.probe_timeout.as_secs().max(1),
        }
    }
}

/// The secondary target must be remote: it is probed and reached over SSH.
pub fn parse_secondary(raw: &str) -> Result<Location, ConfigError> {
    let location = Location::parse(raw).map_err(|e| ConfigError::Invalid {
        key: "secondary",
        reason: e.to_string(),
    })?;
    if !location.is_remote() {
        return Err(ConfigError::Invalid {
            key: "secondary",
            reason: format!("`{raw}` must have the form account@host:/path"),
        });
    }
    Ok(location)
}

/// Parse the positional override form.
pub fn parse_job_override(values: &[String]) -> Result<Option<JobOverride>, ConfigError> {
    match values {
        [] => Ok(None),
        [source, pattern, dest, days] => {
            let retention_days = days.parse().map_err(|_| ConfigError::Invalid {
                key: "RETENTION_DAYS",
                reason: format!("`{days}` is not a non-negative whole number"),
            })?;
            Ok(Some(JobOverride {
                source_path: source.clone(),
                file_pattern: pattern.clone(),
                dest_root: PathBuf::from(dest),
                retention_days,
            }))
        }
        other => Err(ConfigError::Invalid {
            key: "arguments",
            reason: format!(
                "expected SOURCE PATTERN DESTINATION RETENTION_DAYS (all four or none), got {} value(s)",
                other.len()
            ),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("`{raw}` is not a valid number"),
    })
}

fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = dotenvy::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .filter(|p| p.exists())
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
