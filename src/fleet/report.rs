//! Turning a finished run into a log trail, a run record and at most one alert.
//!
//! Failures across the fleet are aggregated: however many hosts failed, the
//! run produces a single alert whose body lists every error.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::coordinator::{HostState, RunOutcome};

/// File name of the JSON run record in the state directory.
pub const RUN_RECORD_FILE: &str = "last_run.json";

/// Ceiling on one alert command invocation.
pub const DEFAULT_ALERT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert command is empty")]
    EmptyCommand,

    #[error("alert command could not be parsed: {0}")]
    BadCommand(String),

    #[error("failed to run alert command: {0}")]
    Io(#[from] std::io::Error),

    #[error("alert command exited with status {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("alert command did not finish within {secs} seconds")]
    Timeout { secs: u64 },
}

/// Delivery of the single end-of-run alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError>;
}

/// Writes the alert to the log only.
#[derive(Debug, Default)]
pub struct LogAlert;

#[async_trait]
impl AlertSink for LogAlert {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        tracing::error!(subject = %subject, "ALERT\n{body}");
        Ok(())
    }
}

/// Pipes the alert body to an external command, e.g.
/// `mail -s "{subject}" backup-ops@example.com`.
///
/// `{subject}` in any argument is replaced with the alert subject. A command
/// that outlives its timeout is killed.
#[derive(Debug, Clone)]
pub struct CommandAlert {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandAlert {
    pub fn parse(command: &str) -> Result<Self, AlertError> {
        let argv =
            shell_words::split(command).map_err(|e| AlertError::BadCommand(e.to_string()))?;
        if argv.is_empty() {
            return Err(AlertError::EmptyCommand);
        }
        Ok(Self {
            argv,
            timeout: DEFAULT_ALERT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolved_argv(&self, subject: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.replace("{subject}", subject))
            .collect()
    }
}

#[async_trait]
impl AlertSink for CommandAlert {
    async fn send(&self, subject: &str, body: &str) -> Result<(), AlertError> {
        let argv = self.resolved_argv(subject);
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while stderr drains, so neither pipe can fill up and
        // wedge the other side.
        let stdin = child.stdin.take();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(body.as_bytes()).await,
                None => Ok(()),
            }
        };
        let delivery = async { tokio::join!(feed, child.wait_with_output()) };
        let Ok((fed, output)) = tokio::time::timeout(self.timeout, delivery).await else {
            return Err(AlertError::Timeout {
                secs: self.timeout.as_secs(),
            });
        };
        let output = output?;

        if !output.status.success() {
            return Err(AlertError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match fed {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Counts shown in the summary line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub hosts: usize,
    pub synced: usize,
    pub unreachable: usize,
    pub failed: usize,
    pub files: usize,
    pub pruned: usize,
}

impl RunTotals {
    pub fn from_outcome(outcome: &RunOutcome) -> Self {
        let mut totals = Self {
            hosts: outcome.per_host().len(),
            ..Self::default()
        };
        for report in outcome.per_host() {
            match report.state {
                HostState::Synced => totals.synced += 1,
                HostState::ProbeFailed => totals.unreachable += 1,
                HostState::SyncFailed => totals.failed += 1,
                _ => {}
            }
            totals.files += report.transferred().len();
            totals.pruned += report.pruned_files;
        }
        totals
    }
}

/// On-disk record of the last run.
#[derive(Debug, Serialize)]
struct RunRecord<'a> {
    verdict: Verdict,
    any_error: bool,
    totals: RunTotals,
    #[serde(flatten)]
    outcome: &'a RunOutcome,
}

pub struct ReportSink {
    alert: Box<dyn AlertSink>,
    record_dir: Option<PathBuf>,
    source_name: String,
}

impl ReportSink {
    /// `source_name` names the collecting machine in alert subjects.
    pub fn new(alert: Box<dyn AlertSink>, source_name: impl Into<String>) -> Self {
        Self {
            alert,
            record_dir: None,
            source_name: source_name.into(),
        }
    }

    /// Also write `last_run.json` into `dir`.
    pub fn with_record_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = Some(dir.into());
        self
    }

    /// Log the outcome, persist the record, and alert once if anything failed.
    pub async fn deliver(&self, outcome: &RunOutcome) -> Verdict {
        self.log_trail(outcome);

        let totals = RunTotals::from_outcome(outcome);
        let verdict = if outcome.any_error() {
            Verdict::Fail
        } else {
            Verdict::Pass
        };

        tracing::info!(
            verdict = ?verdict,
            hosts = totals.hosts,
            synced = totals.synced,
            unreachable = totals.unreachable,
            failed = totals.failed,
            files = totals.files,
            pruned = totals.pruned,
            warnings = outcome.warnings().len(),
            dry_run = outcome.dry_run(),
            "backup run finished"
        );

        if let Some(dir) = &self.record_dir
            && let Err(e) = write_record(dir, verdict, totals, outcome)
        {
            tracing::warn!(dir = %dir.display(), error = %e, "could not write run record");
        }

        if verdict == Verdict::Fail {
            let subject = format!(
                "[fleet-backup] {}: {} error(s) in backup run",
                self.source_name,
                outcome.error_messages().len()
            );
            self.dispatch(&subject, &summarize(outcome, totals)).await;
        }

        verdict
    }

    /// Alert for a run that could not start at all.
    pub async fn deliver_fatal(&self, error: &str) {
        tracing::error!(error = %error, "backup run aborted before any host was processed");
        let subject = format!("[fleet-backup] {}: backup run aborted", self.source_name);
        self.dispatch(&subject, &format!("Backup run aborted during setup:\n\n  {error}\n"))
            .await;
    }

    async fn dispatch(&self, subject: &str, body: &str) {
        match self.alert.send(subject, body).await {
            Ok(()) => tracing::info!(subject = %subject, "alert dispatched"),
            Err(e) => tracing::error!(error = %e, "alert delivery failed"),
        }
    }

    fn log_trail(&self, outcome: &RunOutcome) {
        for report in outcome.per_host() {
            let host = &report.host;
            match report.state {
                HostState::Synced => tracing::info!(
                    host = %host.address,
                    name = %host.short_name,
                    files = report.transferred().len(),
                    pruned = report.pruned_files,
                    elapsed_ms = report.elapsed_ms,
                    "host synced"
                ),
                state => tracing::error!(
                    host = %host.address,
                    name = %host.short_name,
                    state = ?state,
                    error = report.error.as_deref().unwrap_or("unknown"),
                    elapsed_ms = report.elapsed_ms,
                    "host failed"
                ),
            }
        }
        if let Some(forward) = outcome.forward() {
            match &forward.error {
                None => tracing::info!(target = %forward.target, "secondary forward ok"),
                Some(e) => tracing::error!(target = %forward.target, error = %e, "secondary forward failed"),
            }
        }
    }
}

/// Aggregate alert text: totals plus every recorded error.
pub fn summarize(outcome: &RunOutcome, totals: RunTotals) -> String {
    let mut body = format!(
        "Backup run for environment '{}' started {} finished with errors.\n\n\
         hosts: {}  synced: {}  unreachable: {}  failed: {}  files: {}\n",
        outcome.env_tag(),
        outcome.started_at().format("%Y-%m-%d %H:%M:%S UTC"),
        totals.hosts,
        totals.synced,
        totals.unreachable,
        totals.failed,
        totals.files,
    );
    if outcome.dry_run() {
        body.push_str("(dry run)\n");
    }
    body.push_str("\nErrors:\n");
    for message in outcome.error_messages() {
        body.push_str(&format!("  - {message}\n"));
    }
    if !outcome.warnings().is_empty() {
        body.push_str("\nWarnings:\n");
        for warning in outcome.warnings() {
            body.push_str(&format!("  - {warning}\n"));
        }
    }
    body
}

fn write_record(
    dir: &Path,
    verdict: Verdict,
    totals: RunTotals,
    outcome: &RunOutcome,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let record = RunRecord {
        verdict,
        any_error: outcome.any_error(),
        totals,
        outcome,
    };
    let json = serde_json::to_string_pretty(&record)?;
    std::fs::write(dir.join(RUN_RECORD_FILE), json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_alert_parse() {
        let alert = CommandAlert::parse(r#"mail -s "{subject}" ops@example.com"#).unwrap();
        assert_eq!(
            alert.resolved_argv("3 errors"),
            vec!["mail", "-s", "3 errors", "ops@example.com"]
        );
        assert!(matches!(CommandAlert::parse("  "), Err(AlertError::EmptyCommand)));
        assert!(matches!(
            CommandAlert::parse("mail 'unterminated"),
            Err(AlertError::BadCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_command_alert_pipes_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("alert.txt");
        let command = format!("sh -c 'cat > {}'", out.display());
        CommandAlert::parse(&command)
            .unwrap()
            .send("subject", "body text")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap(), "body text");
    }

    #[tokio::test]
    async fn test_command_alert_reports_failure() {
        let err = CommandAlert::parse("false")
            .unwrap()
            .send("s", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_hung_alert_command_is_killed() {
        let alert = CommandAlert::parse("sleep 30")
            .unwrap()
            .with_timeout(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let err = alert.send("s", "b").await.unwrap_err();
        assert!(matches!(err, AlertError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_large_body_with_chatty_stderr_completes() {
        // Neither side reads in lockstep: the command floods stderr before
        // consuming stdin, and the body is far larger than a pipe buffer.
        let command = "sh -c 'head -c 262144 /dev/zero >&2; cat > /dev/null'";
        let body = "x".repeat(1 << 20);
        CommandAlert::parse(command)
            .unwrap()
            .with_timeout(Duration::from_secs(20))
            .send("s", &body)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_outcome_passes_without_alert() {
        struct Panicking;
        #[async_trait]
        impl AlertSink for Panicking {
            async fn send(&self, _: &str, _: &str) -> Result<(), AlertError> {
                panic!("no alert expected");
            }
        }
        let outcome = RunOutcome::new('p', false);
        let verdict = ReportSink::new(Box::new(Panicking), "nycpbkp001")
            .deliver(&outcome)
            .await;
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn test_summarize_lists_errors() {
        let mut outcome = RunOutcome::new('s', true);
        outcome.record_error("lonsspkdb1001 (10.0.0.9): unreachable: connection refused");
        outcome.record_warning("prune failed");
        let text = summarize(&outcome, RunTotals::from_outcome(&outcome));
        assert!(text.contains("environment 's'"));
        assert!(text.contains("(dry run)"));
        assert!(text.contains("lonsspkdb1001 (10.0.0.9): unreachable"));
        assert!(text.contains("Warnings:"));
    }

    #[tokio::test]
    async fn test_record_written() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut outcome = RunOutcome::new('p', false);
        outcome.record_error("boom");
        let verdict = ReportSink::new(Box::new(LogAlert), "x")
            .with_record_dir(dir.path())
            .deliver(&outcome)
            .await;
        assert_eq!(verdict, Verdict::Fail);

        let raw = std::fs::read_to_string(dir.path().join(RUN_RECORD_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["verdict"], "fail");
        assert_eq!(json["any_error"], true);
        assert_eq!(json["error_messages"][0], "boom");
    }
}
