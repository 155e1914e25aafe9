//! Batch coordination across the fleet.
//!
//! Each host moves through a small state machine:
//!
//! ```text
//! Pending ──probe fails──▶ ProbeFailed
//!    │
//!    ▼
//! Probed ──▶ Pruned ──sync ok──▶ Synced
//!    │          │
//!    └──────────┴──sync fails / deadline──▶ SyncFailed
//! ```
//!
//! Hosts are independent: every host is attempted exactly once and a failure
//! on one never stops the others. Work runs on a bounded pool of tasks, each
//! under a hard deadline. The coordinator task is the only writer of the
//! [`RunOutcome`]; task results are folded in host order once they finish,
//! so the outcome is the same whatever the pool size.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::hosts::Host;
use super::location::Location;
use super::ops::FleetOps;
use super::probe::Reachability;
use super::sync::{FileSelection, SyncJob, SyncResult};
use crate::config::RunConfig;

/// Manifest of files staged for the secondary forward.
pub const MANIFEST_FILE: &str = "forward-manifest.txt";

/// Per-host processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Pending,
    Probed,
    Pruned,
    ProbeFailed,
    Synced,
    SyncFailed,
}

impl HostState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ProbeFailed | Self::Synced | Self::SyncFailed)
    }

    pub fn can_advance(self, next: HostState) -> bool {
        use HostState::*;
        matches!(
            (self, next),
            (Pending, Probed)
                | (Pending, ProbeFailed)
                | (Probed, Pruned)
                | (Probed, SyncFailed)
                | (Pruned, Synced)
                | (Pruned, SyncFailed)
        )
    }
}

/// Final record for one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: Host,
    pub state: HostState,
    pub sync: Option<SyncResult>,
    pub pruned_files: usize,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl HostReport {
    fn new(host: Host) -> Self {
        Self {
            host,
            state: HostState::Pending,
            sync: None,
            pruned_files: 0,
            error: None,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// A host that ended in `SyncFailed` without a normal walk through the states.
    fn failed(host: Host, error: String) -> Self {
        let mut report = Self::new(host);
        report.state = HostState::SyncFailed;
        report.error = Some(error);
        report
    }

    fn advance(&mut self, next: HostState) {
        debug_assert!(
            self.state.can_advance(next),
            "invalid host transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(host = %self.host.address, from = ?self.state, to = ?next, "host state");
        self.state = next;
    }

    fn fail(&mut self, next: HostState, error: String) {
        self.advance(next);
        self.error = Some(error);
    }

    /// Files this host actually received.
    pub fn transferred(&self) -> &[String] {
        self.sync.as_ref().map(|s| s.transferred.as_slice()).unwrap_or_default()
    }
}

/// Result of the secondary forward step.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardReport {
    pub target: Location,
    pub sync: Option<SyncResult>,
    pub error: Option<String>,
}

/// Everything a run produced. Built only by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    env_tag: char,
    dry_run: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    per_host: Vec<HostReport>,
    error_messages: Vec<String>,
    warnings: Vec<String>,
    all_transferred: Vec<String>,
    forward: Option<ForwardReport>,
}

impl RunOutcome {
    pub fn new(env_tag: char, dry_run: bool) -> Self {
        Self {
            env_tag,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            per_host: Vec::new(),
            error_messages: Vec::new(),
            warnings: Vec::new(),
            all_transferred: Vec::new(),
            forward: None,
        }
    }

    pub fn env_tag(&self) -> char {
        self.env_tag
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn per_host(&self) -> &[HostReport] {
        &self.per_host
    }

    pub fn host(&self, address: &str) -> Option<&HostReport> {
        self.per_host.iter().find(|r| r.host.address == address)
    }

    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn all_transferred(&self) -> &[String] {
        &self.all_transferred
    }

    pub fn forward(&self) -> Option<&ForwardReport> {
        self.forward.as_ref()
    }

    /// True iff at least one error was recorded.
    pub fn any_error(&self) -> bool {
        !self.error_messages.is_empty()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(error = %message, "run error recorded");
        self.error_messages.push(message);
    }

    pub fn record_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(warning = %message, "run warning recorded");
        self.warnings.push(message);
    }

    /// Fold one host's report in. A host already present is rejected.
    fn record_host(&mut self, report: HostReport, collect_files: bool) -> bool {
        debug_assert!(report.state.is_terminal(), "host recorded in state {:?}", report.state);
        if self.host(&report.host.address).is_some() {
            tracing::warn!(host = %report.host.address, "host already recorded; ignoring duplicate");
            return false;
        }

        let label = report.host.to_string();
        if let Some(error) = &report.error {
            self.record_error(format!("{label}: {error}"));
        }
        for warning in &report.warnings {
            self.record_warning(format!("{label}: {warning}"));
        }
        if collect_files
            && report.state == HostState::Synced
            && let Some(sync) = &report.sync
            && sync.status.is_success()
        {
            self.all_transferred.extend(
                sync.transferred
                    .iter()
                    .map(|f| format!("{}/{f}", report.host.short_name)),
            );
        }
        self.per_host.push(report);
        true
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Drives probe, prune and sync across the host set.
pub struct BatchCoordinator {
    config: Arc<RunConfig>,
    ops: Arc<dyn FleetOps>,
}

impl BatchCoordinator {
    pub fn new(config: Arc<RunConfig>, ops: Arc<dyn FleetOps>) -> Self {
        Self { config, ops }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.config.state_dir.join(MANIFEST_FILE)
    }

    /// Process every host once, then forward the aggregate if enabled.
    pub async fn run(&self, env_tag: char, hosts: Vec<Host>) -> RunOutcome {
        let mut outcome = RunOutcome::new(env_tag, self.config.dry_run);
        let forward_target = self.gate_secondary(&mut outcome).await;

        tracing::info!(
            hosts = hosts.len(),
            workers = self.config.workers.max(1),
            dry_run = self.config.dry_run,
            forward = forward_target.is_some(),
            "starting batch"
        );

        for report in self.process_all(hosts).await {
            outcome.record_host(report, forward_target.is_some());
        }

        if let Some(target) = forward_target {
            self.forward(target, &mut outcome).await;
        }

        outcome.finish();
        outcome
    }

    /// Probe the secondary target once at startup.
    async fn gate_secondary(&self, outcome: &mut RunOutcome) -> Option<Location> {
        let target = self.config.secondary.clone()?;
        let Some(host) = target.host().map(str::to_string) else {
            return Some(target);
        };
        match self.ops.probe(&host).await {
            Reachability::Reachable => {
                tracing::info!(target = %target, "secondary target reachable; forwarding enabled");
                Some(target)
            }
            Reachability::Unreachable(reason) => {
                outcome.record_error(format!(
                    "secondary target {target} unreachable ({reason}); forwarding disabled"
                ));
                None
            }
        }
    }

    async fn process_all(&self, hosts: Vec<Host>) -> Vec<HostReport> {
        let roster = hosts.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::new();
        let mut slots: Vec<Option<HostReport>> = vec![None; roster.len()];

        for (index, host) in hosts.into_iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let ops = Arc::clone(&self.ops);
            let config = Arc::clone(&self.config);
            let handle = tasks.spawn(async move {
                let _permit = permit;
                (index, process_host_with_deadline(ops.as_ref(), &config, host).await)
            });
            task_index.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => {
                    if let Some(&index) = task_index.get(&e.id()) {
                        slots[index] = Some(HostReport::failed(
                            roster[index].clone(),
                            format!("host task aborted: {e}"),
                        ));
                    }
                }
            }
        }

        slots
            .into_iter()
            .zip(roster)
            .map(|(slot, host)| {
                slot.unwrap_or_else(|| HostReport::failed(host, "host was never scheduled".into()))
            })
            .collect()
    }

    async fn forward(&self, target: Location, outcome: &mut RunOutcome) {
        if outcome.all_transferred.is_empty() {
            tracing::info!(target = %target, "no new files; skipping secondary forward");
            return;
        }
        if self.config.dry_run {
            tracing::info!(
                target = %target,
                files = outcome.all_transferred.len(),
                "dry run: would forward aggregate to secondary target"
            );
            return;
        }

        let manifest = self.manifest_path();
        if let Err(e) = write_manifest(&manifest, &outcome.all_transferred) {
            let error = format!("cannot write manifest {}: {e}", manifest.display());
            outcome.record_error(format!("forward: {target}: {error}"));
            outcome.forward = Some(ForwardReport {
                target,
                sync: None,
                error: Some(error),
            });
            return;
        }

        let job = SyncJob {
            source: Location::local(&self.config.dest_root),
            selection: FileSelection::Manifest(manifest.clone()),
            destination: target.clone(),
            retention_days: self.config.retention_days,
            dry_run: false,
        };

        let result =
            match tokio::time::timeout(self.config.host_deadline, self.ops.sync(&job)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "deadline of {}s exceeded",
                    self.config.host_deadline.as_secs()
                )),
            };

        let report = match result {
            Ok(sync) if sync.status.is_success() => {
                if let Err(e) = std::fs::remove_file(&manifest) {
                    tracing::warn!(manifest = %manifest.display(), error = %e, "could not remove manifest");
                }
                tracing::info!(
                    target = %target,
                    transferred = sync.transferred.len(),
                    "secondary forward completed"
                );
                ForwardReport {
                    target,
                    sync: Some(sync),
                    error: None,
                }
            }
            Ok(sync) => {
                let error = sync.status.to_string();
                outcome.record_error(format!("forward: {target}: {error}"));
                ForwardReport {
                    target,
                    sync: Some(sync),
                    error: Some(error),
                }
            }
            Err(error) => {
                outcome.record_error(format!("forward: {target}: {error}"));
                ForwardReport {
                    target,
                    sync: None,
                    error: Some(error),
                }
            }
        };
        outcome.forward = Some(report);
    }
}

fn write_manifest(path: &std::path::Path, files: &[String]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = files.join("\n");
    body.push('\n');
    std::fs::write(path, body)
}

async fn process_host_with_deadline(
    ops: &dyn FleetOps,
    config: &RunConfig,
    host: Host,
) -> HostReport {
    let start = Instant::now();
    let deadline = config.host_deadline;
    let mut report = match tokio::time::timeout(deadline, process_host(ops, config, host.clone()))
        .await
    {
        Ok(report) => report,
        Err(_) => {
            tracing::warn!(host = %host.address, secs = deadline.as_secs(), "host deadline exceeded");
            HostReport::failed(host, format!("deadline of {}s exceeded", deadline.as_secs()))
        }
    };
    report.elapsed_ms = start.elapsed().as_millis() as u64;
    report
}

async fn process_host(ops: &dyn FleetOps, config: &RunConfig, host: Host) -> HostReport {
    let mut report = HostReport::new(host);
    let host = report.host.clone();

    if let Reachability::Unreachable(reason) = ops.probe(&host.address).await {
        tracing::warn!(host = %host.address, name = %host.short_name, reason = %reason, "host unreachable");
        report.fail(HostState::ProbeFailed, format!("unreachable: {reason}"));
        return report;
    }
    report.advance(HostState::Probed);

    let destination = Location::local(&config.dest_root).join(&host.short_name);
    if config.dry_run {
        tracing::info!(host = %host.address, destination = %destination, "dry run: skipping prune");
    } else {
        match ops
            .prune(&destination, &config.file_pattern, config.retention_days)
            .await
        {
            Ok(pruned) => report.pruned_files = pruned.deleted.len(),
            Err(e) => {
                tracing::warn!(host = %host.address, error = %e, "prune failed; continuing with pull");
                report.warnings.push(format!("prune failed: {e}"));
            }
        }
    }
    report.advance(HostState::Pruned);

    let job = SyncJob {
        source: Location::remote(&config.remote_account, &host.address, &config.source_path),
        selection: FileSelection::Matching(config.file_pattern.clone()),
        destination,
        retention_days: config.retention_days,
        dry_run: config.dry_run,
    };

    match ops.sync(&job).await {
        Ok(result) => {
            report.warnings.extend(result.warnings.iter().cloned());
            if result.status.is_success() {
                report.advance(HostState::Synced);
            } else {
                report.fail(HostState::SyncFailed, format!("sync failed: {}", result.status));
            }
            report.sync = Some(result);
        }
        Err(e) => report.fail(HostState::SyncFailed, format!("sync failed: {e}")),
    }
    report
}
