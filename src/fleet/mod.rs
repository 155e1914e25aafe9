//! Fleet backup collection.
//!
//! Pulls backup files from every host of the current environment into a
//! local aggregate, one subtree per host, and optionally relays the freshly
//! pulled files to a secondary target.
//!
//! # Architecture
//!
//! - **hosts**: host discovery from an address table, environment tag resolution
//! - **probe**: bounded TCP reachability check on the SSH port
//! - **location**: local / remote transfer endpoints
//! - **remote**: non-interactive ssh command execution with a hard ceiling
//! - **catalog**: file listings and the name + age selection rule
//! - **prune**: retention pruning of a host's destination subtree
//! - **sync**: filtered rsync transfer and change-log parsing
//! - **ops**: the probe/prune/sync seam used by the coordinator
//! - **coordinator**: per-host state machine, worker pool, secondary forward
//! - **report**: log trail, run record, single aggregate alert
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleet_backup::fleet::{BatchCoordinator, HostDirectory, ReportSink, LogAlert};
//!
//! let hosts = HostDirectory::new(&config.hosts_file).list_hosts('p')?;
//! let coordinator = BatchCoordinator::new(Arc::new(config), ops);
//! let outcome = coordinator.run('p', hosts).await;
//! ReportSink::new(Box::new(LogAlert), "nycpbkp001").deliver(&outcome).await;
//! ```

pub mod catalog;
pub mod coordinator;
pub mod hosts;
pub mod location;
pub mod ops;
pub mod probe;
pub mod prune;
pub mod remote;
pub mod report;
pub mod sync;

pub use catalog::{CatalogError, FileEntry, Selection};
pub use coordinator::{BatchCoordinator, ForwardReport, HostReport, HostState, RunOutcome};
pub use hosts::{EnvironmentError, Host, HostDirectory, HostDirectoryError, resolve_environment};
pub use location::{Location, LocationError};
pub use ops::{FleetOps, SystemOps};
pub use probe::{Reachability, probe};
pub use prune::{PruneError, PruneReport, RetentionPruner};
pub use remote::{RemoteError, RemoteOutput, RemoteShell, SshOptions};
pub use report::{AlertError, AlertSink, CommandAlert, LogAlert, ReportSink, RunTotals, Verdict};
pub use sync::{FileSelection, FileSync, SyncError, SyncJob, SyncResult, SyncStatus, parse_transfer_log};
