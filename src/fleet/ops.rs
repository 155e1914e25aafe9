//! The per-host operations the coordinator drives.
//!
//! [`FleetOps`] is the seam between the batch state machine and the outside
//! world (TCP, ssh, rsync). [`SystemOps`] is the real implementation; tests
//! substitute scripted ones.

use std::time::Duration;

use async_trait::async_trait;

use super::location::Location;
use super::probe::{self, Reachability};
use super::prune::{PruneError, PruneReport, RetentionPruner};
use super::remote::{RemoteShell, SshOptions};
use super::sync::{FileSync, SyncError, SyncJob, SyncResult};

#[async_trait]
pub trait FleetOps: Send + Sync {
    async fn probe(&self, address: &str) -> Reachability;

    async fn prune(
        &self,
        destination: &Location,
        pattern: &str,
        older_than_days: u32,
    ) -> Result<PruneReport, PruneError>;

    async fn sync(&self, job: &SyncJob) -> Result<SyncResult, SyncError>;
}

/// Probe over TCP, prune and sync through ssh/rsync.
pub struct SystemOps {
    probe_port: u16,
    probe_timeout: Duration,
    pruner: RetentionPruner,
    file_sync: FileSync,
}

impl SystemOps {
    pub fn new(
        ssh: SshOptions,
        rsync_path: impl Into<String>,
        probe_timeout: Duration,
        command_timeout: Duration,
        transfer_timeout_secs: u64,
    ) -> Self {
        let shell = RemoteShell::new(ssh.clone(), command_timeout);
        Self {
            probe_port: ssh.port,
            probe_timeout,
            pruner: RetentionPruner::new(shell.clone()),
            file_sync: FileSync::new(shell, rsync_path).with_transfer_timeout(transfer_timeout_secs),
        }
    }
}

#[async_trait]
impl FleetOps for SystemOps {
    async fn probe(&self, address: &str) -> Reachability {
        probe::probe(address, self.probe_port, self.probe_timeout).await
    }

    async fn prune(
        &self,
        destination: &Location,
        pattern: &str,
        older_than_days: u32,
    ) -> Result<PruneReport, PruneError> {
        self.pruner.prune(destination, pattern, older_than_days).await
    }

    async fn sync(&self, job: &SyncJob) -> Result<SyncResult, SyncError> {
        self.file_sync.sync(job).await
    }
}
