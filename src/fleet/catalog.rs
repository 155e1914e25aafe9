//! File listings and the name/age selection rule.
//!
//! Both FileSync (what to pull) and the retention pruner (what to delete)
//! work from the same listing and the same age arithmetic, so a file is
//! never both "too old to pull" and "too young to prune".

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use glob::Pattern;
use thiserror::Error;
use walkdir::WalkDir;

pub const SECS_PER_DAY: i64 = 86_400;

/// `find` output format: mtime, size and path relative to the start point,
/// NUL-terminated so any file name survives the trip.
pub const FIND_PRINTF: &str = "%T@ %s %P\\0";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("invalid file pattern `{pattern}`: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to list {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("directory walk task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// One regular file found under a listing root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the listing root, `/`-separated.
    pub rel_path: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
}

impl FileEntry {
    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }

    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.mtime
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Name pattern plus retention window, evaluated against a fixed `now`.
#[derive(Debug, Clone)]
pub struct Selection {
    pattern: Pattern,
    retention_days: u32,
    now: i64,
}

impl Selection {
    pub fn new(pattern: &str, retention_days: u32, now: i64) -> Result<Self, CatalogError> {
        let pattern = Pattern::new(pattern).map_err(|source| CatalogError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern,
            retention_days,
            now,
        })
    }

    fn window_secs(&self) -> i64 {
        i64::from(self.retention_days) * SECS_PER_DAY
    }

    pub fn name_matches(&self, entry: &FileEntry) -> bool {
        self.pattern.matches(entry.file_name())
    }

    /// Candidate for transfer: name matches and age is within the window.
    pub fn is_candidate(&self, entry: &FileEntry) -> bool {
        self.name_matches(entry) && entry.age_secs(self.now) <= self.window_secs()
    }

    /// Candidate for pruning: name matches and age exceeds the window.
    pub fn is_expired(&self, entry: &FileEntry) -> bool {
        self.name_matches(entry) && entry.age_secs(self.now) > self.window_secs()
    }

    pub fn candidates<'a>(&self, entries: &'a [FileEntry]) -> Vec<&'a FileEntry> {
        entries.iter().filter(|e| self.is_candidate(e)).collect()
    }

    pub fn expired<'a>(&self, entries: &'a [FileEntry]) -> Vec<&'a FileEntry> {
        entries.iter().filter(|e| self.is_expired(e)).collect()
    }
}

/// [`list_local`] on the blocking pool, so a slow filesystem cannot stall the
/// runtime or outlive a caller's timeout unnoticed.
pub async fn scan_local(root: &Path) -> Result<Vec<FileEntry>, CatalogError> {
    tokio::task::spawn_blocking({
        let root = root.to_path_buf();
        move || list_local(&root)
    })
    .await?
}

/// Walk `root` recursively and return every regular file.
pub fn list_local(root: &Path) -> Result<Vec<FileEntry>, CatalogError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|source| CatalogError::Walk {
            path: root.display().to_string(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(|source| CatalogError::Walk {
            path: entry.path().display().to_string(),
            source,
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(parts) = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
        else {
            tracing::warn!(path = %entry.path().display(), "skipping file with a non-UTF-8 name");
            continue;
        };
        let rel_path = parts.join("/");
        entries.push(FileEntry {
            rel_path,
            size: metadata.len(),
            mtime,
        });
    }
    Ok(entries)
}

/// Arguments for the remote listing command.
pub fn find_command(root: &str) -> Vec<&str> {
    vec!["find", root, "-type", "f", "-printf", FIND_PRINTF]
}

/// Parse NUL-terminated `find -printf '%T@ %s %P\0'` output.
///
/// Records that do not parse are skipped and counted so callers can warn.
/// That includes names that are not valid UTF-8: a lossy rendering would
/// name a file that does not exist on the remote side.
pub fn parse_find_output(raw: &[u8]) -> (Vec<FileEntry>, usize) {
    let mut entries = Vec::new();
    let mut malformed = 0;

    for record in raw.split(|b| *b == b'\0') {
        let Ok(record) = std::str::from_utf8(record) else {
            malformed += 1;
            continue;
        };
        let record = record.trim_start_matches('\n');
        if record.is_empty() {
            continue;
        }
        let mut parts = record.splitn(3, ' ');
        let (Some(mtime), Some(size), Some(rel_path)) = (parts.next(), parts.next(), parts.next())
        else {
            malformed += 1;
            continue;
        };
        let mtime = mtime.split('.').next().and_then(|s| s.parse::<i64>().ok());
        let size = size.parse::<u64>().ok();
        match (mtime, size) {
            (Some(mtime), Some(size)) if !rel_path.is_empty() => entries.push(FileEntry {
                rel_path: rel_path.to_string(),
                size,
                mtime,
            }),
            _ => malformed += 1,
        }
    }

    (entries, malformed)
}

/// Read an explicit file manifest: one relative path per line.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use std::time::Duration;

    fn entry(name: &str, age_days: i64, now: i64) -> FileEntry {
        FileEntry {
            rel_path: name.to_string(),
            size: 10,
            mtime: now - age_days * SECS_PER_DAY,
        }
    }

    #[test]
    fn test_selection_pattern_and_age() {
        let now = 1_700_000_000;
        let sel = Selection::new("*.tgz", 7, now).unwrap();

        assert!(sel.is_candidate(&entry("db/nightly.tgz", 1, now)));
        assert!(sel.is_candidate(&entry("exact.tgz", 7, now)));
        assert!(!sel.is_candidate(&entry("old.tgz", 8, now)));
        assert!(!sel.is_candidate(&entry("notes.txt", 0, now)));

        assert!(sel.is_expired(&entry("old.tgz", 10, now)));
        assert!(!sel.is_expired(&entry("exact.tgz", 7, now)));
        assert!(!sel.is_expired(&entry("old.txt", 10, now)));
    }

    #[test]
    fn test_pattern_matches_file_name_not_directory() {
        let now = 1_700_000_000;
        let sel = Selection::new("app*", 7, now).unwrap();
        assert!(!sel.is_candidate(&entry("app/data.bin", 0, now)));
        assert!(sel.is_candidate(&entry("var/app.tgz", 0, now)));
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            Selection::new("[", 1, 0),
            Err(CatalogError::BadPattern { .. })
        ));
    }

    #[test]
    fn test_parse_find_output() {
        let raw = "1700000000.5000000000 1024 a/b.tgz\0\
                   1699990000.0 0 c d.tgz\0\
                   garbage\0\
                   x 10 e.tgz\0";
        let (entries, malformed) = parse_find_output(raw.as_bytes());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rel_path, "a/b.tgz");
        assert_eq!(entries[0].mtime, 1_700_000_000);
        assert_eq!(entries[0].size, 1024);
        assert_eq!(entries[1].rel_path, "c d.tgz");
        assert_eq!(malformed, 2);
    }

    #[test]
    fn test_parse_find_output_counts_non_utf8_names() {
        let raw = b"1700000000.0 3 bad\xff.tgz\0\
                    1700000000.0 5 caf\xc3\xa9.tgz\0";
        let (entries, malformed) = parse_find_output(raw);
        assert_eq!(malformed, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel_path, "caf\u{e9}.tgz");
        assert!(entries.iter().all(|e| !e.rel_path.contains('\u{fffd}')));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_local_skips_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("good.tgz"), b"ok").unwrap();
        let bad = std::ffi::OsStr::from_bytes(b"bad\xff.tgz");
        if std::fs::write(dir.path().join(bad), b"no").is_err() {
            // Filesystems that insist on UTF-8 names cannot hold the case.
            return;
        }

        let entries = list_local(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(names, vec!["good.tgz"]);
    }

    #[test]
    fn test_list_local_recurses() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("top.tgz"), b"abc").unwrap();
        std::fs::write(dir.path().join("sub/deeper/inner.tgz"), b"abcdef").unwrap();

        let old = File::options()
            .write(true)
            .open(dir.path().join("top.tgz"))
            .unwrap();
        old.set_modified(SystemTime::now() - Duration::from_secs(3 * SECS_PER_DAY as u64))
            .unwrap();

        let entries = list_local(dir.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.rel_path.as_str()).collect();
        assert_eq!(names, vec!["sub/deeper/inner.tgz", "top.tgz"]);
        assert_eq!(entries[0].size, 6);

        let sel = Selection::new("*.tgz", 2, unix_now()).unwrap();
        let picked: Vec<_> = sel
            .candidates(&entries)
            .iter()
            .map(|e| e.rel_path.clone())
            .collect();
        assert_eq!(picked, vec!["sub/deeper/inner.tgz"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_scan_local_matches_blocking_walk() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        for i in 0..50 {
            std::fs::write(dir.path().join(format!("a/b/f{i:02}.tgz")), b"x").unwrap();
        }

        let scanned = scan_local(dir.path()).await.unwrap();
        assert_eq!(scanned, list_local(dir.path()).unwrap());
        assert_eq!(scanned.len(), 50);
    }

    #[tokio::test]
    async fn test_scan_local_reports_missing_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = scan_local(&dir.path().join("gone")).await.unwrap_err();
        assert!(matches!(err, CatalogError::Walk { .. }));
    }

    #[test]
    fn test_read_manifest_skips_blank_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest");
        std::fs::write(&path, "h1/a.tgz\n\n  h2/b.tgz  \n").unwrap();
        assert_eq!(read_manifest(&path).unwrap(), vec!["h1/a.tgz", "h2/b.tgz"]);
    }

    proptest! {
        #[test]
        fn prop_candidates_respect_pattern_and_age(
            ages in proptest::collection::vec(0i64..40 * SECS_PER_DAY, 1..30),
            retention in 0u32..30,
            tgz in proptest::collection::vec(any::<bool>(), 30),
        ) {
            let now = 1_800_000_000;
            let entries: Vec<FileEntry> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| FileEntry {
                    rel_path: if tgz[i] { format!("f{i}.tgz") } else { format!("f{i}.log") },
                    size: 1,
                    mtime: now - age,
                })
                .collect();
            let sel = Selection::new("*.tgz", retention, now).unwrap();
            for e in sel.candidates(&entries) {
                prop_assert!(e.rel_path.ends_with(".tgz"));
                prop_assert!(e.age_secs(now) <= i64::from(retention) * SECS_PER_DAY);
            }
            for e in &entries {
                prop_assert!(!(sel.is_candidate(e) && sel.is_expired(e)));
            }
        }
    }
}
