pub mod config;
pub mod fleet;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use thiserror::Error;

use config::{ConfigError, RunConfig};
use fleet::hosts::{self, EnvironmentError, HostDirectory, HostDirectoryError};
use fleet::report::{AlertError, AlertSink, CommandAlert, LogAlert, ReportSink};
use fleet::{BatchCoordinator, SystemOps};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "fleet-backup",
    version,
    about = "Collect backup files from every host of this environment over rsync/SSH"
)]
pub struct Cli {
    /// SOURCE PATTERN DESTINATION RETENTION_DAYS (all four or none)
    #[arg(value_name = "ARGS", num_args = 0..)]
    pub job: Vec<String>,

    /// Verbose logging
    #[arg(short, long)]
    pub debug: bool,

    /// Report what would be pruned and transferred without changing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Forward the collected files to account@host:/path after the batch
    #[arg(short, long, value_name = "TARGET")]
    pub secondary: Option<String>,

    /// Config file (defaults to $FLEET_BACKUP_CONFIG, then the platform config dir)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Failures that stop the run before any host is touched.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Hosts(#[from] HostDirectoryError),

    #[error("alert command: {0}")]
    Alert(#[from] AlertError),

    #[error("required tool `{tool}` not found: {source}")]
    MissingTool {
        tool: String,
        #[source]
        source: which::Error,
    },
}

pub async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let job = match config::parse_job_override(&cli.job) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("error: {e}\n\n{}", Cli::command().render_usage());
            return Ok(ExitCode::from(1));
        }
    };

    let config = build_config(&cli, job).context("loading configuration")?;
    let _guard = logging::init(&config.log_dir, config.debug)?;
    let alert = build_alert(&config).context("configuring alerts")?;

    let local_name = hosts::local_host_name();
    let source_name = local_name.clone().unwrap_or_else(|| "unknown-host".to_string());
    let sink = ReportSink::new(alert, source_name).with_record_dir(&config.state_dir);

    let (env_tag, host_list) = match discover(&config, local_name.as_deref().unwrap_or_default()) {
        Ok(found) => found,
        Err(e) => {
            sink.deliver_fatal(&e.to_string()).await;
            return Ok(ExitCode::from(1));
        }
    };

    tracing::info!(
        env = %env_tag,
        hosts = host_list.len(),
        source = %config.source_path,
        pattern = %config.file_pattern,
        dest = %config.dest_root.display(),
        retention_days = config.retention_days,
        "backup run starting"
    );

    let config = Arc::new(config);
    let ops = Arc::new(SystemOps::new(
        config.ssh_options(),
        config.rsync_path.clone(),
        config.probe_timeout,
        config.command_timeout,
        config.transfer_timeout_secs,
    ));
    let outcome = BatchCoordinator::new(config, ops)
        .run(env_tag, host_list)
        .await;

    sink.deliver(&outcome).await;
    Ok(ExitCode::SUCCESS)
}

fn build_config(
    cli: &Cli,
    job: Option<config::JobOverride>,
) -> Result<RunConfig, SetupError> {
    let mut config = RunConfig::load(cli.config.as_deref())?;
    if let Some(job) = job {
        config.apply_override(job);
    }
    if let Some(raw) = &cli.secondary {
        config.secondary = Some(config::parse_secondary(raw)?);
    }
    config.dry_run |= cli.dry_run;
    config.debug |= cli.debug;
    config.validate()?;
    Ok(config)
}

fn build_alert(config: &RunConfig) -> Result<Box<dyn AlertSink>, SetupError> {
    let sink: Box<dyn AlertSink> = match &config.alert_command {
        Some(command) => Box::new(CommandAlert::parse(command)?),
        None => Box::new(LogAlert),
    };
    Ok(sink)
}

fn discover(
    config: &RunConfig,
    local_name: &str,
) -> Result<(char, Vec<hosts::Host>), SetupError> {
    for tool in [&config.rsync_path, &config.ssh_path] {
        which::which(tool).map_err(|source| SetupError::MissingTool {
            tool: tool.clone(),
            source,
        })?;
    }

    let env_tag = match config.env_tag {
        Some(tag) => hosts::check_configured_tag(tag, &config.env_tags)?,
        None => hosts::resolve_environment(local_name, &config.env_tags)?,
    };
    let directory = HostDirectory::new(&config.hosts_file);
    let host_list = directory.list_hosts(env_tag)?;
    if host_list.is_empty() {
        tracing::warn!(
            env = %env_tag,
            source = %directory.source().display(),
            "no hosts matched this environment"
        );
    }
    Ok((env_tag, host_list))
}
