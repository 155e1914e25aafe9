//! Retention pruning of a host's destination subtree.
//!
//! Runs before each pull so destination usage stays bounded by one retention
//! window plus one incoming batch. Only regular files whose name matches the
//! collection pattern are considered; anything else under the subtree is left
//! alone.

use std::path::{Path, PathBuf};

use thiserror::Error;

use super::catalog::{self, CatalogError, FileEntry, Selection};
use super::location::Location;
use super::remote::{RemoteError, RemoteShell};

/// Files per `rm` invocation on remote destinations.
const REMOTE_RM_BATCH: usize = 200;

#[derive(Error, Debug)]
pub enum PruneError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("listing {location} failed: {detail}")]
    ListFailed { location: String, detail: String },

    #[error("failed to delete {path}: {source}")]
    Delete {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote delete under {location} failed: {detail}")]
    RemoteDeleteFailed { location: String, detail: String },

    #[error("local prune task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Deleted paths, relative to the pruned root.
    pub deleted: Vec<String>,
    pub bytes_freed: u64,
}

pub struct RetentionPruner {
    shell: RemoteShell,
}

impl RetentionPruner {
    pub fn new(shell: RemoteShell) -> Self {
        Self { shell }
    }

    /// Delete files under `destination` matching `pattern` older than
    /// `older_than_days`. A destination that does not exist yet has nothing
    /// to prune.
    pub async fn prune(
        &self,
        destination: &Location,
        pattern: &str,
        older_than_days: u32,
    ) -> Result<PruneReport, PruneError> {
        let selection = Selection::new(pattern, older_than_days, catalog::unix_now())?;
        let report = match destination {
            Location::Local { path } => prune_local_blocking(path.clone(), selection).await?,
            Location::Remote {
                account,
                host,
                path,
            } => {
                self.prune_remote(account, host, path, destination, &selection)
                    .await?
            }
        };

        tracing::info!(
            destination = %destination,
            deleted = report.deleted.len(),
            bytes = report.bytes_freed,
            days = older_than_days,
            "retention prune finished"
        );
        Ok(report)
    }

    async fn prune_remote(
        &self,
        account: &str,
        host: &str,
        root: &str,
        destination: &Location,
        selection: &Selection,
    ) -> Result<PruneReport, PruneError> {
        let listing = self
            .shell
            .run(account, host, &catalog::find_command(root))
            .await?;
        if !listing.success() {
            if listing.stdout.is_empty() && listing.stderr.contains("No such file") {
                return Ok(PruneReport::default());
            }
            return Err(PruneError::ListFailed {
                location: destination.to_string(),
                detail: listing.stderr,
            });
        }

        let (entries, malformed) = catalog::parse_find_output(&listing.stdout);
        if malformed > 0 {
            tracing::warn!(destination = %destination, malformed, "skipped unparseable listing records");
        }
        let expired: Vec<&FileEntry> = selection.expired(&entries);

        let mut report = PruneReport::default();
        let root = root.trim_end_matches('/');
        for batch in expired.chunks(REMOTE_RM_BATCH) {
            let paths: Vec<String> = batch
                .iter()
                .map(|e| format!("{root}/{}", e.rel_path))
                .collect();
            let mut argv = vec!["rm", "-f", "--"];
            argv.extend(paths.iter().map(String::as_str));

            let out = self.shell.run(account, host, &argv).await?;
            if !out.success() {
                return Err(PruneError::RemoteDeleteFailed {
                    location: destination.to_string(),
                    detail: out.stderr,
                });
            }
            for e in batch {
                report.deleted.push(e.rel_path.clone());
                report.bytes_freed += e.size;
            }
        }
        Ok(report)
    }
}

async fn prune_local_blocking(
    root: PathBuf,
    selection: Selection,
) -> Result<PruneReport, PruneError> {
    tokio::task::spawn_blocking(move || prune_local(&root, &selection)).await?
}

fn prune_local(root: &Path, selection: &Selection) -> Result<PruneReport, PruneError> {
    if !root.exists() {
        return Ok(PruneReport::default());
    }
    let entries = catalog::list_local(root)?;
    let mut report = PruneReport::default();

    for e in selection.expired(&entries) {
        let path = root.join(&e.rel_path);
        std::fs::remove_file(&path).map_err(|source| PruneError::Delete {
            path: path.display().to_string(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "pruned");
        report.deleted.push(e.rel_path.clone());
        report.bytes_freed += e.size;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::catalog::SECS_PER_DAY;
    use crate::fleet::remote::SshOptions;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn age(path: &Path, days: u64) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(days * SECS_PER_DAY as u64))
            .unwrap();
    }

    fn pruner() -> RetentionPruner {
        RetentionPruner::new(RemoteShell::new(
            SshOptions::default(),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_prune_local_deletes_only_expired_matches() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("nested")).unwrap();
        for name in ["old.tgz", "fresh.tgz", "old.log", "nested/older.tgz"] {
            std::fs::write(root.join(name), b"payload").unwrap();
        }
        age(&root.join("old.tgz"), 10);
        age(&root.join("old.log"), 10);
        age(&root.join("nested/older.tgz"), 30);
        age(&root.join("fresh.tgz"), 1);

        let report = pruner()
            .prune(&Location::local(root), "*.tgz", 7)
            .await
            .unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["nested/older.tgz", "old.tgz"]);
        assert_eq!(report.bytes_freed, 14);
        assert!(!root.join("old.tgz").exists());
        assert!(root.join("fresh.tgz").exists());
        assert!(root.join("old.log").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_local_prune_leaves_runtime_free_for_timers() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..200 {
            let path = dir.path().join(format!("f{i:03}.tgz"));
            std::fs::write(&path, b"payload").unwrap();
            age(&path, 9);
        }

        // A single-threaded runtime can only drive the timer while the walk
        // and deletes run elsewhere.
        let ticker = tokio::spawn(async {
            let mut ticks = 0u32;
            let mut interval = tokio::time::interval(Duration::from_millis(1));
            while ticks < 3 {
                interval.tick().await;
                ticks += 1;
            }
            ticks
        });
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            pruner().prune(&Location::local(dir.path()), "*.tgz", 7),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.deleted.len(), 200);
        assert_eq!(ticker.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_prune_missing_local_destination_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let report = pruner()
            .prune(&Location::local(dir.path().join("absent")), "*", 1)
            .await
            .unwrap();
        assert_eq!(report, PruneReport::default());
    }

    #[tokio::test]
    async fn test_prune_rejects_bad_pattern() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = pruner()
            .prune(&Location::local(dir.path()), "[", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PruneError::Catalog(_)));
    }
}
