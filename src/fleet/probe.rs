//! Reachability probing.
//!
//! A probe is a TCP connect-and-close against the host's SSH control port.
//! No bytes are exchanged; the only question answered is whether something
//! accepts connections there within the timeout.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

/// SSH control port.
pub const DEFAULT_PROBE_PORT: u16 = 22;

/// Default connect timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Outcome of probing a single address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Reachability {
    Reachable,
    Unreachable(String),
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}

/// Probe `address:port`, giving up after `timeout`.
pub async fn probe(address: &str, port: u16, timeout: Duration) -> Reachability {
    let start = Instant::now();
    let target = if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    };

    let result = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Reachability::Reachable
        }
        Ok(Err(e)) => Reachability::Unreachable(describe_connect_error(&e)),
        Err(_) => Reachability::Unreachable(format!(
            "connect timed out after {}s",
            timeout.as_secs()
        )),
    };

    tracing::debug!(
        target = %target,
        reachable = result.is_reachable(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "probe finished"
    );
    result
}

fn describe_connect_error(e: &std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
        std::io::ErrorKind::TimedOut => "connection timed out".to_string(),
        _ => e.to_string(),
    }
}
