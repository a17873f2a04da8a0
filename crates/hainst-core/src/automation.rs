//! Unattended wizard behavior, consulted by [`Session::run`](crate::Session::run).

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::AutomationConfig;
use crate::model::Component;
use crate::session::OutcomeFlags;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationPolicy {
    /// Advance to the next step after a step succeeded.
    pub auto_next: bool,
    /// Components to install with their default method when missing.
    pub auto_install: BTreeSet<Component>,
    /// Pause before each automatic action.
    pub delay: Duration,
    /// Automatic installs per component before giving up.
    pub max_install_attempts: u32,
}

impl Default for AutomationPolicy {
    fn default() -> Self {
        Self::manual()
    }
}

impl AutomationPolicy {
    pub const DEFAULT_MAX_INSTALL_ATTEMPTS: u32 = 2;

    /// Every transition waits for the caller.
    pub fn manual() -> Self {
        Self {
            auto_next: false,
            auto_install: BTreeSet::new(),
            delay: Duration::ZERO,
            max_install_attempts: Self::DEFAULT_MAX_INSTALL_ATTEMPTS,
        }
    }

    /// Advance and install everything that is missing.
    pub fn unattended() -> Self {
        Self {
            auto_next: true,
            auto_install: Component::ALL.into_iter().collect(),
            ..Self::manual()
        }
    }

    pub fn from_config(config: &AutomationConfig) -> Self {
        let mut auto_install = BTreeSet::new();
        if config.drbd_install {
            auto_install.insert(Component::Drbd);
        }
        if config.heartbeat_install {
            auto_install.insert(Component::HbPm);
        }
        if config.pacemaker_install {
            auto_install.insert(Component::Pm);
        }
        Self {
            auto_next: config.auto_next,
            auto_install,
            delay: Duration::from_millis(config.delay_ms),
            max_install_attempts: Self::DEFAULT_MAX_INSTALL_ATTEMPTS,
        }
    }

    pub fn with_auto_next(mut self, auto_next: bool) -> Self {
        self.auto_next = auto_next;
        self
    }

    pub fn with_install(mut self, component: Component) -> Self {
        self.auto_install.insert(component);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn installs(&self, component: Component) -> bool {
        self.auto_install.contains(&component)
    }

    /// First component to install automatically, in storage, heartbeat,
    /// pacemaker order, among those a step offers.
    pub fn next_install(
        &self,
        flags: &OutcomeFlags,
        offered: impl Fn(Component) -> bool,
        attempts: impl Fn(Component) -> u32,
    ) -> Option<Component> {
        Component::ALL.into_iter().find(|component| {
            !flags.get(*component)
                && self.installs(*component)
                && offered(*component)
                && attempts(*component) < self.max_install_attempts
        })
    }
}
