//! Non-interactive remote command execution over SSH.
//!
//! Commands run with `BatchMode=yes` so ssh never prompts, stdin is closed,
//! and stderr is captured separately from stdout so diagnostic noise never
//! reaches the output the caller parses. Every call has a hard ceiling; a
//! command that outlives it is killed.

use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to execute ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("SSH connection to {host} failed: {detail}")]
    Connection { host: String, detail: String },

    #[error("remote command on {host} timed out after {secs} seconds")]
    Timeout { host: String, secs: u64 },
}

/// Captured result of a remote command that ran to completion.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    /// Exit code of the remote command (`-1` if killed by a signal).
    pub code: i32,
    /// Raw bytes; remote file names need not be valid UTF-8.
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// SSH connection settings shared by remote commands and rsync.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub ssh_path: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            port: 22,
            connect_timeout_secs: 10,
        }
    }
}

impl SshOptions {
    /// ssh argument tokens placed before the destination.
    pub fn cli_tokens(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ]
    }

    /// Single shell fragment for rsync's `-e`.
    pub fn rsync_shell(&self) -> String {
        let mut parts = vec![self.ssh_path.clone()];
        parts.extend(self.cli_tokens());
        shell_words::join(parts)
    }
}

/// Runs commands on remote hosts.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    options: SshOptions,
    command_timeout: Duration,
}

impl RemoteShell {
    pub fn new(options: SshOptions, command_timeout: Duration) -> Self {
        Self {
            options,
            command_timeout,
        }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    /// Run `argv` as `account@host`. Arguments are shell-quoted before they
    /// cross the wire, since sshd hands the joined string to the login shell.
    ///
    /// A non-zero exit of the remote command is not an error here; callers
    /// inspect [`RemoteOutput::code`]. Exit 255 is ssh's own failure code and
    /// is reported as [`RemoteError::Connection`].
    pub async fn run(
        &self,
        account: &str,
        host: &str,
        argv: &[&str],
    ) -> Result<RemoteOutput, RemoteError> {
        let start = Instant::now();
        let remote_command = shell_words::join(argv);

        let mut cmd = Command::new(&self.options.ssh_path);
        cmd.args(self.options.cli_tokens())
            .arg("--")
            .arg(format!("{account}@{host}"))
            .arg(&remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(host = %host, command = %remote_command, "running remote command");

        let child = cmd.spawn().map_err(RemoteError::Spawn)?;
        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await
        {
            Ok(result) => result.map_err(RemoteError::Spawn)?,
            Err(_) => {
                return Err(RemoteError::Timeout {
                    host: host.to_string(),
                    secs: self.command_timeout.as_secs(),
                });
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if code == 255 {
            return Err(RemoteError::Connection {
                host: host.to_string(),
                detail: classify_ssh_failure(&stderr),
            });
        }

        tracing::debug!(
            host = %host,
            code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "remote command finished"
        );

        Ok(RemoteOutput {
            code,
            stdout: output.stdout,
            stderr,
        })
    }
}

/// Turn ssh's stderr into a short operator-facing reason.
pub fn classify_ssh_failure(stderr: &str) -> String {
    if stderr.contains("Connection refused") {
        "connection refused".to_string()
    } else if stderr.contains("Connection timed out") || stderr.contains("timed out") {
        "connection timed out".to_string()
    } else if stderr.contains("Permission denied") {
        "permission denied (key not authorized?)".to_string()
    } else if stderr.contains("Host key verification failed") {
        "host key verification failed".to_string()
    } else if stderr.contains("No route to host") {
        "no route to host".to_string()
    } else if stderr.is_empty() {
        "ssh exited with status 255".to_string()
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_tokens_are_non_interactive() {
        let opts = SshOptions {
            port: 2222,
            connect_timeout_secs: 7,
            ..Default::default()
        };
        let tokens = opts.cli_tokens();
        assert!(tokens.contains(&"BatchMode=yes".to_string()));
        assert!(tokens.contains(&"ConnectTimeout=7".to_string()));
        assert!(tokens.contains(&"LogLevel=ERROR".to_string()));
        assert_eq!(tokens[tokens.len() - 2..], ["-p", "2222"]);
    }

    #[test]
    fn test_rsync_shell_fragment() {
        let shell = SshOptions::default().rsync_shell();
        assert!(shell.starts_with("ssh -o BatchMode=yes"));
        assert!(shell.ends_with("-p 22"));
    }

    #[test]
    fn test_classify_ssh_failure() {
        assert_eq!(
            classify_ssh_failure("ssh: connect to host x port 22: Connection refused"),
            "connection refused"
        );
        assert_eq!(
            classify_ssh_failure("user@x: Permission denied (publickey)."),
            "permission denied (key not authorized?)"
        );
        assert_eq!(classify_ssh_failure(""), "ssh exited with status 255");
        assert_eq!(classify_ssh_failure("weird"), "weird");
    }

    #[tokio::test]
    async fn test_missing_ssh_binary_is_spawn_error() {
        let shell = RemoteShell::new(
            SshOptions {
                ssh_path: "/nonexistent/ssh-binary".into(),
                ..Default::default()
            },
            Duration::from_secs(1),
        );
        let err = shell.run("bk", "127.0.0.1", &["true"]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Spawn(_)));
    }
}
