//! Remote script execution.
//!
//! Bootstrap only needs "run this script on that host and tell me how it
//! went", so the transport sits behind [`RemoteExecutor`]. [`SshExecutor`]
//! shells out to the system `ssh` client; tests inject their own executor.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// `ssh` reserves exit status 255 for its own failures.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Errors from the remote transport itself.
///
/// A script that runs and exits non-zero is *not* an error here; see
/// [`RemoteOutput::exit_code`].
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Could not establish a session with the host.
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    /// The session failed while streaming the script or its output.
    #[error("remote I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The operation context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation context's deadline passed.
    #[error("operation timed out")]
    Timeout,
}

/// Result of running a script to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell scripts on a remote host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` with bash on `host` and wait for it to finish.
    async fn run(&self, host: &str, script: &str) -> Result<RemoteOutput, RemoteError>;
}

/// [`RemoteExecutor`] backed by the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    /// Extra `-o` options passed to ssh.
    options: Vec<String>,
    /// Private key passed with `-i`.
    identity: Option<String>,
    /// Run the script through `sudo`.
    sudo: bool,
    connect_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            options: vec![
                "StrictHostKeyChecking=no".to_string(),
                "PasswordAuthentication=no".to_string(),
            ],
            identity: None,
            sudo: true,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SshExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_identity(mut self, path: impl Into<String>) -> Self {
        self.identity = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    #[must_use]
    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn args(&self, host: &str) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        // A host like `-oProxyCommand=...` must not be read as an option.
        args.push("--".to_string());
        args.push(host.to_string());
        if self.sudo {
            args.push("sudo -n /bin/bash -s".to_string());
        } else {
            args.push("/bin/bash -s".to_string());
        }
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, script: &str) -> Result<RemoteOutput, RemoteError> {
        debug!(host = %host, bytes = script.len(), "Running remote script");

        let mut child = Command::new("ssh")
            .args(self.args(host))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Connect {
                host: host.to_string(),
                message: format!("failed to spawn ssh: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // A signal-terminated ssh has no code; treat it like a dropped session.
        let Some(exit_code) = output.status.code() else {
            return Err(RemoteError::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "ssh terminated by signal",
            )));
        };

        if exit_code == SSH_CONNECT_FAILURE {
            return Err(RemoteError::Connect {
                host: host.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(RemoteOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let args = SshExecutor::new()
            .with_identity("/home/ops/.ssh/id_ed25519")
            .args("ubuntu@node1");
        assert_eq!(args[0], "-T");
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"/home/ops/.ssh/id_ed25519".to_string()));
        let n = args.len();
        assert_eq!(args[n - 3], "--");
        assert_eq!(args[n - 2], "ubuntu@node1");
        assert_eq!(args[n - 1], "sudo -n /bin/bash -s");
    }

    #[test]
    fn test_ssh_args_host_after_option_terminator() {
        let args = SshExecutor::new().args("-oProxyCommand=touch /tmp/pwned");
        let terminator = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[terminator + 1], "-oProxyCommand=touch /tmp/pwned");
        assert!(!args[..terminator].iter().any(|a| a.starts_with("ProxyCommand")));
    }

    #[test]
    fn test_ssh_args_extra_options_and_connect_timeout() {
        let args = SshExecutor::new()
            .with_option("Port=2222")
            .with_connect_timeout(Duration::from_secs(5))
            .args("node1");
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(!args.contains(&"ConnectTimeout=30".to_string()));
        let port = args.iter().position(|a| a == "Port=2222").unwrap();
        assert_eq!(args[port - 1], "-o");
        assert!(port < args.iter().position(|a| a == "--").unwrap());
    }

    #[test]
    fn test_ssh_args_without_sudo() {
        let args = SshExecutor::new().with_sudo(false).args("node1");
        assert_eq!(args.last().map(String::as_str), Some("/bin/bash -s"));
    }

    #[test]
    fn test_remote_output_success() {
        assert!(RemoteOutput::default().success());
        let failed = RemoteOutput {
            exit_code: 1,
            ..RemoteOutput::default()
        };
        assert!(!failed.success());
    }
}
