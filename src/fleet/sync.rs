//! Filtered file transfer between two locations using rsync.
//!
//! # Transfer semantics
//!
//! Files are compared by name and size only (`--size-only`): a file whose
//! timestamp changed but whose size did not is left alone, a file whose size
//! differs is re-sent and overwrites the destination copy. rsync is never run
//! with `--delete`; destination cleanup is the retention pruner's job.
//!
//! The reported file list comes from rsync's itemized change log, not from
//! the candidate list, so files already identical at the destination never
//! show up as transferred.
//!
//! # Status codes
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | usage / syntax error |
//! | 2-35 | rsync exit status, passed through verbatim |
//! | 100 | source missing |
//! | 101 | destination missing (only when it cannot be created) |

use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use super::catalog::{self, CatalogError, Selection};
use super::location::Location;
use super::remote::{RemoteError, RemoteShell};

/// rsync `--out-format`: itemized change flags, then the file name.
pub const OUT_FORMAT: &str = "%i %n";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("checking {location} failed: {detail}")]
    RemoteCheck { location: String, detail: String },

    #[error("listing {location} failed: {detail}")]
    ListFailed { location: String, detail: String },

    #[error("failed to write transfer file list: {0}")]
    FileList(#[source] std::io::Error),

    #[error("failed to execute rsync: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Which files a job considers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum FileSelection {
    /// Files under the source whose name matches the glob and whose age is
    /// within the retention window.
    Matching(String),
    /// Exactly the relative paths listed in a manifest file.
    Manifest(PathBuf),
}

/// One transfer, built per host per run.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub source: Location,
    pub selection: FileSelection,
    pub destination: Location,
    pub retention_days: u32,
    pub dry_run: bool,
}

/// Stable status taxonomy of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    UsageError,
    TransferError(i32),
    SourceMissing,
    DestMissing,
}

impl SyncStatus {
    pub const USAGE_CODE: i32 = 1;
    pub const SOURCE_MISSING_CODE: i32 = 100;
    pub const DEST_MISSING_CODE: i32 = 101;

    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::UsageError => Self::USAGE_CODE,
            Self::TransferError(code) => *code,
            Self::SourceMissing => Self::SOURCE_MISSING_CODE,
            Self::DestMissing => Self::DEST_MISSING_CODE,
        }
    }

    /// Map an rsync exit status.
    pub fn from_rsync_exit(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UsageError,
            other => Self::TransferError(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::UsageError => write!(f, "usage error (1)"),
            Self::TransferError(code) => write!(f, "{} ({code})", describe_rsync_exit(*code)),
            Self::SourceMissing => write!(f, "source missing (100)"),
            Self::DestMissing => write!(f, "destination missing (101)"),
        }
    }
}

/// Outcome of one sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub status: SyncStatus,
    /// Files rsync reported as written (or would write, in dry-run).
    pub transferred: Vec<String>,
    /// Files the selection rule admitted.
    pub candidates: Vec<String>,
    /// Non-fatal oddities seen along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SyncResult {
    pub fn with_status(status: SyncStatus) -> Self {
        Self {
            status,
            transferred: Vec::new(),
            candidates: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Change log scan result.
#[derive(Debug, Default, PartialEq, Eq)]
struct TransferLog {
    files: Vec<String>,
    malformed: usize,
}

fn scan_transfer_log(raw: &str) -> TransferLog {
    let mut log = TransferLog::default();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        let mut chars = line.chars();
        let (Some(direction), Some(kind)) = (chars.next(), chars.next()) else {
            continue;
        };
        if !matches!(direction, '>' | '<') || kind != 'f' {
            continue;
        }
        match line.split_once(' ') {
            Some((_, name)) if !name.trim().is_empty() => log.files.push(name.to_string()),
            _ => log.malformed += 1,
        }
    }
    log
}

/// File names rsync wrote, taken from `%i %n` change-log lines.
///
/// Only lines whose itemize flags start with `>f` (received) or `<f` (sent)
/// count. Directory, symlink, deletion and summary lines are ignored. rsync
/// prints the same flags under `--dry-run`, so the list is the same set of
/// files a real run would write.
pub fn parse_transfer_log(raw: &str) -> Vec<String> {
    scan_transfer_log(raw).files
}

fn describe_rsync_exit(code: i32) -> &'static str {
    match code {
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files",
        5 => "error starting client-server protocol",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        20 => "interrupted",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        255 => "ssh connection failed",
        _ => "rsync error",
    }
}

/// Runs [`SyncJob`]s.
pub struct FileSync {
    shell: RemoteShell,
    rsync_path: String,
    /// rsync I/O inactivity timeout in seconds (0 = none).
    transfer_timeout: u64,
}

impl FileSync {
    pub fn new(shell: RemoteShell, rsync_path: impl Into<String>) -> Self {
        Self {
            shell,
            rsync_path: rsync_path.into(),
            transfer_timeout: 600,
        }
    }

    pub fn with_transfer_timeout(mut self, seconds: u64) -> Self {
        self.transfer_timeout = seconds;
        self
    }

    pub async fn sync(&self, job: &SyncJob) -> Result<SyncResult, SyncError> {
        let start = Instant::now();

        if job.source.is_remote() && job.destination.is_remote() {
            tracing::warn!(
                source = %job.source,
                destination = %job.destination,
                "remote-to-remote transfer is not supported"
            );
            return Ok(SyncResult::with_status(SyncStatus::UsageError));
        }

        if !self.source_exists(&job.source).await? {
            tracing::warn!(source = %job.source, "source directory missing");
            return Ok(SyncResult::with_status(SyncStatus::SourceMissing));
        }

        if !job.dry_run && !self.ensure_destination(&job.destination).await? {
            return Ok(SyncResult::with_status(SyncStatus::DestMissing));
        }

        let mut warnings = Vec::new();
        let candidates = self.select(job, &mut warnings).await?;
        if candidates.is_empty() {
            tracing::info!(source = %job.source, "no candidate files");
            return Ok(SyncResult {
                status: SyncStatus::Success,
                transferred: Vec::new(),
                candidates,
                warnings,
            });
        }

        let mut list = tempfile::NamedTempFile::new().map_err(SyncError::FileList)?;
        for name in &candidates {
            writeln!(list, "{name}").map_err(SyncError::FileList)?;
        }
        list.flush().map_err(SyncError::FileList)?;

        let mut cmd = Command::new(&self.rsync_path);
        cmd.args(self.rsync_args(job, &list.path().display().to_string()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            source = %job.source,
            destination = %job.destination,
            files = candidates.len(),
            dry_run = job.dry_run,
            "starting rsync"
        );

        let output = cmd
            .spawn()
            .map_err(SyncError::Spawn)?
            .wait_with_output()
            .await
            .map_err(SyncError::Spawn)?;

        let code = output.status.code().unwrap_or(20);
        let status = SyncStatus::from_rsync_exit(code);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let log = scan_transfer_log(&stdout);
        if log.malformed > 0 {
            warnings.push(format!(
                "{} change-log line(s) from {} had a transfer marker but no file name",
                log.malformed, job.source
            ));
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        if status.is_success() {
            tracing::info!(
                source = %job.source,
                destination = %job.destination,
                candidates = candidates.len(),
                transferred = log.files.len(),
                dry_run = job.dry_run,
                duration_ms,
                "rsync completed"
            );
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                source = %job.source,
                destination = %job.destination,
                code,
                error = %stderr.trim(),
                duration_ms,
                "rsync failed"
            );
        }

        Ok(SyncResult {
            status,
            transferred: log.files,
            candidates,
            warnings,
        })
    }

    fn rsync_args(&self, job: &SyncJob, files_from: &str) -> Vec<String> {
        // NOTE: no --delete. Pruning is separate and pattern-scoped.
        let mut args = vec![
            "-a".to_string(),
            "--size-only".to_string(),
            format!("--out-format={OUT_FORMAT}"),
            format!("--files-from={files_from}"),
        ];
        if self.transfer_timeout > 0 {
            args.push(format!("--timeout={}", self.transfer_timeout));
        }
        if job.dry_run {
            args.push("--dry-run".to_string());
        }
        if job.source.is_remote() || job.destination.is_remote() {
            args.push("-e".to_string());
            args.push(self.shell.options().rsync_shell());
        }
        args.push(job.source.rsync_dir_arg());
        args.push(job.destination.rsync_dir_arg());
        args
    }

    async fn source_exists(&self, source: &Location) -> Result<bool, SyncError> {
        match source {
            Location::Local { path } => Ok(path.is_dir()),
            Location::Remote {
                account,
                host,
                path,
            } => {
                let out = self.shell.run(account, host, &["test", "-d", path.as_str()]).await?;
                match out.code {
                    0 => Ok(true),
                    1 => Ok(false),
                    _ => Err(SyncError::RemoteCheck {
                        location: source.to_string(),
                        detail: out.stderr,
                    }),
                }
            }
        }
    }

    /// Create the destination if needed. `false` means it could not be made.
    async fn ensure_destination(&self, destination: &Location) -> Result<bool, SyncError> {
        match destination {
            Location::Local { path } => match std::fs::create_dir_all(path) {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::warn!(destination = %destination, error = %e, "cannot create destination");
                    Ok(false)
                }
            },
            Location::Remote {
                account,
                host,
                path,
            } => {
                let out = self.shell.run(account, host, &["mkdir", "-p", path.as_str()]).await?;
                if !out.success() {
                    tracing::warn!(destination = %destination, error = %out.stderr, "cannot create destination");
                }
                Ok(out.success())
            }
        }
    }

    async fn select(
        &self,
        job: &SyncJob,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<String>, SyncError> {
        let pattern = match &job.selection {
            FileSelection::Manifest(path) => return Ok(catalog::read_manifest(path)?),
            FileSelection::Matching(pattern) => pattern,
        };

        let entries = match &job.source {
            Location::Local { path } => catalog::scan_local(path).await?,
            Location::Remote {
                account,
                host,
                path,
            } => {
                let out = self
                    .shell
                    .run(account, host, &catalog::find_command(path))
                    .await?;
                if !out.success() {
                    return Err(SyncError::ListFailed {
                        location: job.source.to_string(),
                        detail: out.stderr,
                    });
                }
                let (entries, malformed) = catalog::parse_find_output(&out.stdout);
                if malformed > 0 {
                    warnings.push(format!(
                        "{malformed} listing record(s) from {} could not be parsed",
                        job.source
                    ));
                }
                entries
            }
        };

        let selection = Selection::new(pattern, job.retention_days, catalog::unix_now())?;
        Ok(selection
            .candidates(&entries)
            .into_iter()
            .map(|e| e.rel_path.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::remote::SshOptions;
    use std::time::Duration;

    fn engine() -> FileSync {
        FileSync::new(
            RemoteShell::new(
                SshOptions {
                    // Any attempt to reach the network fails loudly.
                    ssh_path: "/nonexistent/ssh".into(),
                    ..Default::default()
                },
                Duration::from_secs(1),
            ),
            "rsync",
        )
    }

    #[test]
    fn test_parse_transfer_log() {
        let raw = "\
cd+++++++++ host/
>f+++++++++ host/a.tgz
>f.st...... host/b.tgz
.f          host/unchanged.tgz
<f+++++++++ sent.tgz
cL+++++++++ link -> target
*deleting   gone.tgz

sent 1,234 bytes  received 56 bytes  2,580.00 bytes/sec
total size is 9,999  speedup is 7.75
";
        assert_eq!(
            parse_transfer_log(raw),
            vec!["host/a.tgz", "host/b.tgz", "sent.tgz"]
        );
    }

    #[test]
    fn test_parse_transfer_log_keeps_spaces_in_names() {
        assert_eq!(
            parse_transfer_log(">f+++++++++ dir/with space.tgz\n"),
            vec!["dir/with space.tgz"]
        );
    }

    #[test]
    fn test_scan_transfer_log_counts_malformed() {
        let log = scan_transfer_log(">f+++++++++\n>f+++++++++ ok.tgz\n");
        assert_eq!(log.files, vec!["ok.tgz"]);
        assert_eq!(log.malformed, 1);
    }

    #[test]
    fn test_parse_transfer_log_empty() {
        assert!(parse_transfer_log("").is_empty());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(SyncStatus::Success.code(), 0);
        assert_eq!(SyncStatus::UsageError.code(), 1);
        assert_eq!(SyncStatus::SourceMissing.code(), 100);
        assert_eq!(SyncStatus::DestMissing.code(), 101);
        assert_eq!(SyncStatus::from_rsync_exit(0), SyncStatus::Success);
        assert_eq!(SyncStatus::from_rsync_exit(1), SyncStatus::UsageError);
        assert_eq!(SyncStatus::from_rsync_exit(23), SyncStatus::TransferError(23));
        assert_eq!(SyncStatus::TransferError(23).code(), 23);
        assert_eq!(
            SyncStatus::TransferError(30).to_string(),
            "timeout in data send/receive (30)"
        );
    }

    #[tokio::test]
    async fn test_remote_to_remote_is_usage_error_without_network() {
        let job = SyncJob {
            source: Location::remote("bk", "192.0.2.1", "/a"),
            selection: FileSelection::Matching("*".into()),
            destination: Location::remote("bk", "192.0.2.2", "/b"),
            retention_days: 7,
            dry_run: false,
        };
        // The ssh binary does not exist, so any network attempt would error out.
        let result = engine().sync(&job).await.unwrap();
        assert_eq!(result.status, SyncStatus::UsageError);
        assert!(result.transferred.is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let job = SyncJob {
            source: Location::local(dir.path().join("absent")),
            selection: FileSelection::Matching("*".into()),
            destination: Location::local(dir.path().join("dest")),
            retention_days: 7,
            dry_run: false,
        };
        let result = engine().sync(&job).await.unwrap();
        assert_eq!(result.status, SyncStatus::SourceMissing);
        assert!(!dir.path().join("dest").exists());
    }

    #[tokio::test]
    async fn test_missing_destination_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let job = SyncJob {
            source: Location::local(dir.path().join("src")),
            selection: FileSelection::Matching("*.tgz".into()),
            destination: Location::local(dir.path().join("deep/dest")),
            retention_days: 7,
            dry_run: false,
        };
        let result = engine().sync(&job).await.unwrap();
        assert_eq!(result.status, SyncStatus::Success);
        assert!(result.candidates.is_empty());
        assert!(dir.path().join("deep/dest").is_dir());
    }

    #[test]
    fn test_rsync_args_remote_pull() {
        let job = SyncJob {
            source: Location::remote("bk", "10.0.0.1", "/var/backups"),
            selection: FileSelection::Matching("*.tgz".into()),
            destination: Location::local("/srv/agg/host1"),
            retention_days: 7,
            dry_run: true,
        };
        let args = engine().rsync_args(&job, "/tmp/list");
        assert_eq!(args[0], "-a");
        assert!(args.contains(&"--size-only".to_string()));
        assert!(args.contains(&"--out-format=%i %n".to_string()));
        assert!(args.contains(&"--files-from=/tmp/list".to_string()));
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(args.contains(&"-e".to_string()));
        assert!(!args.iter().any(|a| a == "--delete"));
        assert_eq!(
            args[args.len() - 2..],
            ["bk@10.0.0.1:/var/backups/", "/srv/agg/host1/"]
        );
    }
}
