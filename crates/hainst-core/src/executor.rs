//! Remote command execution seam and per-component execution guards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::error::WizardError;
use crate::model::{Component, HostId, HostTarget};

/// A resolved command ready to be sent to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Logical resource key the command was resolved from.
    pub key: String,
    pub command: String,
}

impl RemoteCommand {
    pub fn new(key: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            command: command.into(),
        }
    }
}

/// Captured output of a finished remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn new(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to start command: {0}")]
    Spawn(String),
}

/// Timeouts applied by the session to executor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
    /// Installs may download or compile.
    pub install: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(60),
            install: Duration::from_secs(30 * 60),
        }
    }
}

/// Executes commands on remote hosts over an authenticated channel.
///
/// Implementations enforce the timeout; an expired command yields
/// [`TransportError::Timeout`].
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(&self, host: &HostTarget, timeout: Duration) -> Result<(), TransportError>;

    async fn execute(
        &self,
        host: &HostTarget,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError>;
}

type GuardSlot = Arc<tokio::sync::Mutex<()>>;

/// Registry handing out one exclusive guard per (host, component) pair.
///
/// Clones share the same registry, so sessions for one host can share it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuards {
    slots: Arc<Mutex<HashMap<(HostId, Component), GuardSlot>>>,
}

impl ExecutionGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for a pair, failing if an action already holds it.
    pub fn try_acquire(
        &self,
        host: HostId,
        component: Component,
    ) -> Result<ComponentGuard, WizardError> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.entry((host, component)).or_default().clone()
        };
        slot.try_lock_owned()
            .map(|guard| ComponentGuard { _guard: guard })
            .map_err(|_| WizardError::ComponentBusy { host, component })
    }

    /// Take every guard or none of them.
    pub fn try_acquire_all(
        &self,
        host: HostId,
        components: &[Component],
    ) -> Result<Vec<ComponentGuard>, WizardError> {
        // Dropping the partial vector on error releases what was taken.
        components
            .iter()
            .map(|component| self.try_acquire(host, *component))
            .collect()
    }

    pub fn is_busy(&self, host: HostId, component: Component) -> bool {
        let slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .get(&(host, component))
            .is_some_and(|slot| slot.try_lock().is_err())
    }
}

/// Held while an action for a (host, component) pair is outstanding.
#[derive(Debug)]
pub struct ComponentGuard {
    _guard: OwnedMutexGuard<()>,
}
