//! Remote command execution through the system `ssh` client.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hainst_core::config::SshConfig;
use hainst_core::util::{log_snippet, program_in_path};
use hainst_core::{ExecOutput, HostTarget, RemoteCommand, RemoteExecutor, TransportError};
use tokio::process::Command;
use tracing::debug;

/// Exit status ssh reserves for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

pub(crate) struct SshExecutor {
    settings: SshConfig,
}

impl SshExecutor {
    pub(crate) fn new(settings: SshConfig) -> Result<Self> {
        if !program_in_path(&settings.binary) {
            return Err(anyhow!(
                "ssh client '{}' not found; install OpenSSH or set [ssh] binary",
                settings.binary
            ));
        }
        Ok(Self { settings })
    }

    fn command(&self, host: &HostTarget, remote: &str) -> Command {
        let mut command = Command::new(&self.settings.binary);
        command
            .arg("-p")
            .arg(host.port.to_string())
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.connect_timeout_s));
        if self.settings.batch_mode {
            command.arg("-o").arg("BatchMode=yes");
        }
        command
            .arg(format!("{}@{}", host.user, host.address))
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(
        &self,
        host: &HostTarget,
        remote: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        let child = self.command(host, remote).spawn().map_err(|err| {
            TransportError::Spawn(format!("{}: {err}", self.settings.binary))
        })?;
        // Dropping the wait on timeout kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(TransportError::Spawn(err.to_string())),
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        match output.status.code() {
            Some(SSH_ERROR_STATUS) => Err(TransportError::ConnectionLost(
                stderr.trim().to_string(),
            )),
            Some(code) => {
                debug!(
                    host = %host.name,
                    code,
                    stderr = %log_snippet(&stderr),
                    "ssh command exited"
                );
                Ok(ExecOutput::new(join_streams(&stdout, &stderr), code))
            }
            None => Err(TransportError::ConnectionLost(
                "ssh terminated by signal".to_string(),
            )),
        }
    }
}

fn join_streams(stdout: &str, stderr: &str) -> String {
    if stderr.trim().is_empty() {
        return stdout.to_string();
    }
    let mut joined = stdout.to_string();
    if !joined.is_empty() && !joined.ends_with('\n') {
        joined.push('\n');
    }
    joined.push_str(stderr);
    joined
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn connect(&self, host: &HostTarget, timeout: Duration) -> Result<(), TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            host: host.address.clone(),
            reason,
        };
        match self.run(host, "true", timeout).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(connect_error(format!(
                "exit status {}: {}",
                output.exit_code,
                output.output.trim()
            ))),
            Err(TransportError::ConnectionLost(reason)) => Err(connect_error(reason)),
            Err(err) => Err(err),
        }
    }

    async fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        self.run(host, &command.command, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hainst_core::HostId;

    fn target() -> HostTarget {
        HostTarget {
            id: HostId(1),
            name: "node-a".to_string(),
            address: "10.0.0.1".to_string(),
            user: "root".to_string(),
            port: 2222,
        }
    }

    fn args(executor: &SshExecutor, remote: &str) -> Vec<String> {
        executor
            .command(&target(), remote)
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_carries_port_user_and_options() {
        let executor = SshExecutor {
            settings: SshConfig::default(),
        };
        assert_eq!(
            args(&executor, "uname -r"),
            vec![
                "-p",
                "2222",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "BatchMode=yes",
                "root@10.0.0.1",
                "uname -r",
            ]
        );

        let interactive = SshExecutor {
            settings: SshConfig {
                batch_mode: false,
                ..SshConfig::default()
            },
        };
        assert!(!args(&interactive, "true").contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn stderr_is_appended_after_stdout() {
        assert_eq!(join_streams("8.4.1\n", ""), "8.4.1\n");
        assert_eq!(join_streams("out", "err\n"), "out\nerr\n");
        assert_eq!(join_streams("", "err"), "err");
    }

    #[test]
    fn missing_binary_is_rejected() {
        let settings = SshConfig {
            binary: "/nonexistent/hainst-ssh".to_string(),
            ..SshConfig::default()
        };
        assert!(SshExecutor::new(settings).is_err());
    }
}
