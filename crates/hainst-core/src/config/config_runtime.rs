//! Runtime adjustments for configuration defaults.
//!
//! Replaces values that cannot work at runtime with the builtin defaults.

use tracing::warn;

use super::{Config, SshConfig, TimeoutConfig};

pub(super) fn apply_runtime_defaults(config: &mut Config) {
    apply_timeouts(&mut config.timeouts);
    apply_ssh(&mut config.ssh);
}

fn apply_timeouts(timeouts: &mut TimeoutConfig) {
    // A zero timeout would fail every command immediately.
    if timeouts.command_ms == 0 {
        warn!("timeouts.command_ms is 0; using default");
        timeouts.command_ms = TimeoutConfig::DEFAULT_COMMAND_MS;
    }
    if timeouts.install_ms == 0 {
        warn!("timeouts.install_ms is 0; using default");
        timeouts.install_ms = TimeoutConfig::DEFAULT_INSTALL_MS;
    }
    if timeouts.connect_ms == 0 {
        warn!("timeouts.connect_ms is 0; using default");
        timeouts.connect_ms = TimeoutConfig::DEFAULT_CONNECT_MS;
    }
    if timeouts.install_ms < timeouts.command_ms {
        timeouts.install_ms = timeouts.command_ms;
    }
}

fn apply_ssh(ssh: &mut SshConfig) {
    if ssh.binary.trim().is_empty() {
        ssh.binary = SshConfig::DEFAULT_BINARY.to_string();
    }
    if ssh.connect_timeout_s == 0 {
        ssh.connect_timeout_s = SshConfig::default().connect_timeout_s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let mut config = Config::default();
        config.timeouts.command_ms = 0;
        config.timeouts.install_ms = 10;
        config.ssh.binary = "  ".to_string();
        config.ssh.connect_timeout_s = 0;

        apply_runtime_defaults(&mut config);

        assert_eq!(config.timeouts.command_ms, TimeoutConfig::DEFAULT_COMMAND_MS);
        assert_eq!(config.timeouts.install_ms, TimeoutConfig::DEFAULT_COMMAND_MS);
        assert_eq!(config.ssh.binary, "ssh");
        assert_eq!(config.ssh.connect_timeout_s, 10);
    }
}
