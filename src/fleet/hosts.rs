//! Host discovery for the current environment.
//!
//! Hosts come from a line-oriented address table (an `/etc/hosts`-style
//! file). A line qualifies when it starts with an IPv4-looking address and
//! carries a short name of the form `xxx{env}spkxxx###`, where `{env}` is the
//! single-letter environment tag of the machine running the collection.
//!
//! The environment tag itself is derived from the local machine's short name
//! using the same convention (the character at offset 3).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Offset of the environment tag inside a short name.
pub const ENV_TAG_OFFSET: usize = 3;

/// Environment tags accepted when none are configured.
pub const DEFAULT_ENV_TAGS: &[char] = &['p', 's', 'd'];

#[derive(Error, Debug)]
pub enum HostDirectoryError {
    #[error("host source {path} is unavailable: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("environment tag `{0}` is not a single lowercase letter")]
    InvalidTag(char),

    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("could not determine the local host name")]
    NoHostName,

    #[error("local host name `{0}` is too short to carry an environment tag")]
    NameTooShort(String),

    #[error("local host name `{name}` has environment tag `{tag}`, expected one of [{allowed}]")]
    UnknownTag {
        name: String,
        tag: char,
        allowed: String,
    },

    #[error("configured environment tag `{tag}` is not one of [{allowed}]")]
    TagNotAllowed { tag: char, allowed: String },
}

fn join_tags(allowed: &[char]) -> String {
    allowed
        .iter()
        .map(char::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A remote machine to collect from. Identity is the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    pub short_name: String,
}

impl Host {
    pub fn new(address: impl Into<String>, short_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            short_name: short_name.into(),
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.short_name, self.address)
    }
}

/// Static name source for the fleet.
#[derive(Debug, Clone)]
pub struct HostDirectory {
    source: PathBuf,
}

impl HostDirectory {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Read the name source and return the hosts tagged with `env_tag`.
    pub fn list_hosts(&self, env_tag: char) -> Result<Vec<Host>, HostDirectoryError> {
        let content = std::fs::read_to_string(&self.source).map_err(|source| {
            HostDirectoryError::SourceUnavailable {
                path: self.source.clone(),
                source,
            }
        })?;
        let hosts = parse_host_table(&content, env_tag)?;
        tracing::debug!(
            source = %self.source.display(),
            env = %env_tag,
            count = hosts.len(),
            "resolved host set"
        );
        Ok(hosts)
    }
}

fn short_name_regex(env_tag: char) -> Result<Regex, HostDirectoryError> {
    if !env_tag.is_ascii_lowercase() {
        return Err(HostDirectoryError::InvalidTag(env_tag));
    }
    let pattern = format!(r"^[A-Za-z0-9]{{3}}{env_tag}spk[A-Za-z0-9]{{3}}[0-9]{{3}}$");
    Ok(Regex::new(&pattern)?)
}

fn looks_like_ipv4(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse an address table, keeping lines whose short name carries `env_tag`.
///
/// Order follows the table; an address that appears twice is kept once. A
/// short name already claimed by an earlier address is skipped, since both
/// hosts would share one destination subtree.
pub fn parse_host_table(content: &str, env_tag: char) -> Result<Vec<Host>, HostDirectoryError> {
    let short_name = short_name_regex(env_tag)?;
    let mut seen = HashSet::new();
    let mut claimed: HashMap<&str, &str> = HashMap::new();
    let mut hosts = Vec::new();

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut tokens = line.split_whitespace();
        let Some(address) = tokens.next() else {
            continue;
        };
        if !looks_like_ipv4(address) {
            continue;
        }
        let Some(name) = tokens.find(|t| short_name.is_match(t)) else {
            continue;
        };
        if seen.contains(address) {
            continue;
        }
        if let Some(first) = claimed.get(name) {
            tracing::warn!(
                name,
                address,
                kept = *first,
                "short name listed under two addresses; keeping the first"
            );
            continue;
        }
        seen.insert(address.to_string());
        claimed.insert(name, address);
        hosts.push(Host::new(address, name));
    }

    Ok(hosts)
}

/// Derive the environment tag from the local machine's short name.
pub fn resolve_environment(local_name: &str, allowed: &[char]) -> Result<char, EnvironmentError> {
    let short = local_name.split('.').next().unwrap_or_default().trim();
    if short.is_empty() {
        return Err(EnvironmentError::NoHostName);
    }
    let Some(tag) = short.chars().nth(ENV_TAG_OFFSET) else {
        return Err(EnvironmentError::NameTooShort(short.to_string()));
    };
    if allowed.contains(&tag) {
        Ok(tag)
    } else {
        Err(EnvironmentError::UnknownTag {
            name: short.to_string(),
            tag,
            allowed: join_tags(allowed),
        })
    }
}

/// Accept an explicitly configured tag only if it is in the allowed set.
pub fn check_configured_tag(tag: char, allowed: &[char]) -> Result<char, EnvironmentError> {
    if allowed.contains(&tag) {
        Ok(tag)
    } else {
        Err(EnvironmentError::TagNotAllowed {
            tag,
            allowed: join_tags(allowed),
        })
    }
}

/// Best-effort lookup of the local machine's name.
///
/// Checks `HOSTNAME`, then `/etc/hostname`, then the `hostname` command.
pub fn local_host_name() -> Option<String> {
    if let Ok(name) = dotenvy::var("HOSTNAME")
        && !name.trim().is_empty()
    {
        return Some(name.trim().to_string());
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname")
        && !name.trim().is_empty()
    {
        return Some(name.trim().to_string());
    }
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|n| !n.is_empty())
}
