//! Configuration types and defaults for hainst.
//!
//! Keeps schema definitions in one place for easier auditing.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::Timeouts;
use crate::model::Component;

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub staging: StagingConfig,
    pub timeouts: TimeoutConfig,
    pub automation: AutomationConfig,
    pub remembered: RememberedConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: Option<String>,
}

/// Offer install methods marked as staging.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StagingConfig {
    pub drbd: bool,
    /// Applies to both cluster stacks.
    pub pacemaker: bool,
}

impl StagingConfig {
    pub fn enabled_for(&self, component: Component) -> bool {
        match component {
            Component::Drbd => self.drbd,
            Component::HbPm | Component::Pm => self.pacemaker,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_ms: u64,
    pub install_ms: u64,
    pub connect_ms: u64,
}

impl TimeoutConfig {
    pub const DEFAULT_COMMAND_MS: u64 = 60_000;
    pub const DEFAULT_INSTALL_MS: u64 = 30 * 60_000;
    pub const DEFAULT_CONNECT_MS: u64 = 30_000;

    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_ms),
            command: Duration::from_millis(self.command_ms),
            install: Duration::from_millis(self.install_ms),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: Self::DEFAULT_COMMAND_MS,
            install_ms: Self::DEFAULT_INSTALL_MS,
            connect_ms: Self::DEFAULT_CONNECT_MS,
        }
    }
}

/// Unattended behavior; everything is off by default.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub auto_next: bool,
    pub drbd_install: bool,
    pub heartbeat_install: bool,
    pub pacemaker_install: bool,
    pub delay_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            auto_next: false,
            drbd_install: false,
            heartbeat_install: false,
            pacemaker_install: false,
            delay_ms: 1000,
        }
    }
}

/// Install method indexes used when a host has none remembered.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RememberedConfig {
    pub drbd: Option<usize>,
    pub heartbeat: Option<usize>,
    pub pacemaker: Option<usize>,
}

impl RememberedConfig {
    pub fn get(&self, component: Component) -> Option<usize> {
        match component {
            Component::Drbd => self.drbd,
            Component::HbPm => self.heartbeat,
            Component::Pm => self.pacemaker,
        }
    }

    pub fn to_map(&self) -> BTreeMap<Component, usize> {
        Component::ALL
            .iter()
            .filter_map(|component| self.get(*component).map(|index| (*component, index)))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub connect_timeout_s: u64,
    /// Never prompt for passwords; rely on keys or an agent.
    pub batch_mode: bool,
}

impl SshConfig {
    pub const DEFAULT_BINARY: &'static str = "ssh";
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: Self::DEFAULT_BINARY.to_string(),
            connect_timeout_s: 10,
            batch_mode: true,
        }
    }
}
