//! Source and destination endpoints.
//!
//! A [`Location`] is either a local filesystem path or a remote
//! `(account, host, path)` triple reached over SSH. The textual form mirrors
//! what rsync accepts: `account@host:/path` for remote, anything else is local.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LocationError {
    #[error("empty location")]
    Empty,

    #[error("remote location `{0}` must have the form account@host:/path")]
    MalformedRemote(String),
}

/// An endpoint of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Location {
    Local {
        path: PathBuf,
    },
    Remote {
        account: String,
        host: String,
        path: String,
    },
}

impl Location {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    pub fn remote(
        account: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::Remote {
            account: account.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// Parse `account@host:/path` as remote, anything else as a local path.
    ///
    /// A string containing `:` but no `@` before it is treated as local, so
    /// odd local names like `./a:b` still work.
    pub fn parse(raw: &str) -> Result<Self, LocationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LocationError::Empty);
        }

        if let Some((target, path)) = raw.split_once(':')
            && let Some((account, host)) = target.split_once('@')
        {
            if account.is_empty() || host.is_empty() || path.is_empty() || host.contains('/') {
                return Err(LocationError::MalformedRemote(raw.to_string()));
            }
            return Ok(Self::remote(account, host, path));
        }

        Ok(Self::local(raw))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Remote host, if any.
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Remote { host, .. } => Some(host),
            Self::Local { .. } => None,
        }
    }

    /// Path component as a string (remote paths are never touched locally).
    pub fn path_str(&self) -> String {
        match self {
            Self::Local { path } => path.display().to_string(),
            Self::Remote { path, .. } => path.clone(),
        }
    }

    /// Same endpoint, one directory deeper.
    pub fn join(&self, segment: &str) -> Self {
        match self {
            Self::Local { path } => Self::local(path.join(segment)),
            Self::Remote {
                account,
                host,
                path,
            } => Self::remote(
                account.clone(),
                host.clone(),
                format!("{}/{}", path.trim_end_matches('/'), segment),
            ),
        }
    }

    /// Directory argument for rsync.
    ///
    /// Always ends in `/` so rsync copies the directory's contents rather than
    /// nesting the directory itself under the destination.
    pub fn rsync_dir_arg(&self) -> String {
        let base = match self {
            Self::Local { path } => path.display().to_string(),
            Self::Remote {
                account,
                host,
                path,
            } => format!("{account}@{host}:{path}"),
        };
        if base.ends_with('/') {
            base
        } else {
            format!("{base}/")
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path } => write!(f, "{}", path.display()),
            Self::Remote {
                account,
                host,
                path,
            } => write!(f, "{account}@{host}:{path}"),
        }
    }
}

impl std::str::FromStr for Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        let loc = Location::parse("backup@10.0.0.5:/srv/backups").unwrap();
        assert_eq!(loc, Location::remote("backup", "10.0.0.5", "/srv/backups"));
        assert!(loc.is_remote());
        assert_eq!(loc.host(), Some("10.0.0.5"));
    }

    #[test]
    fn test_parse_local() {
        let loc = Location::parse("/var/lib/backups").unwrap();
        assert_eq!(loc, Location::local("/var/lib/backups"));
        assert!(!loc.is_remote());

        // colon without an account is still local
        let odd = Location::parse("./weird:name").unwrap();
        assert!(!odd.is_remote());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Location::parse("  "), Err(LocationError::Empty));
        assert!(matches!(
            Location::parse("@host:/x"),
            Err(LocationError::MalformedRemote(_))
        ));
        assert!(matches!(
            Location::parse("user@host:"),
            Err(LocationError::MalformedRemote(_))
        ));
    }

    #[test]
    fn test_join_and_rsync_arg() {
        let remote = Location::remote("bk", "h1", "/data/").join("abcpspkweb001");
        assert_eq!(remote.path_str(), "/data/abcpspkweb001");
        assert_eq!(remote.rsync_dir_arg(), "bk@h1:/data/abcpspkweb001/");

        let local = Location::local("/tmp/agg").join("host");
        assert_eq!(local.rsync_dir_arg(), "/tmp/agg/host/");
    }

    #[test]
    fn test_display_roundtrip_remote() {
        let loc = Location::remote("bk", "h1", "/p");
        assert_eq!(loc.to_string(), "bk@h1:/p");
        assert_eq!(loc.to_string().parse::<Location>().unwrap(), loc);
    }
}
