//! Step kinds, states, and per-component results held by wizard steps.

use std::fmt;

use serde::Serialize;

use crate::model::Component;

/// Index of a step in the session's step arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StepId(pub(crate) usize);

impl StepId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step-{}", self.0)
    }
}

/// Which probes a probe step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeScope {
    /// Storage and cluster stack, concurrently.
    All,
    Storage,
    ClusterStack,
}

impl ProbeScope {
    pub fn targets(self) -> &'static [ProbeTarget] {
        match self {
            ProbeScope::All => &[ProbeTarget::Storage, ProbeTarget::ClusterStack],
            ProbeScope::Storage => &[ProbeTarget::Storage],
            ProbeScope::ClusterStack => &[ProbeTarget::ClusterStack],
        }
    }

    /// Components this scope reports on and may offer to install.
    pub fn components(self) -> &'static [Component] {
        match self {
            ProbeScope::All => &Component::ALL,
            ProbeScope::Storage => &[Component::Drbd],
            ProbeScope::ClusterStack => &[Component::HbPm, Component::Pm],
        }
    }
}

/// One remote probe; the cluster stack is probed with a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeTarget {
    Storage,
    ClusterStack,
}

impl ProbeTarget {
    pub fn guarded_components(self) -> &'static [Component] {
        match self {
            ProbeTarget::Storage => &[Component::Drbd],
            ProbeTarget::ClusterStack => &[Component::HbPm, Component::Pm],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case", tag = "step")]
pub enum StepKind {
    Connect,
    Probe { scope: ProbeScope },
    Install { component: Component, method: usize },
    Confirm,
}

impl StepKind {
    pub fn probe(scope: ProbeScope) -> Self {
        StepKind::Probe { scope }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Connect => f.write_str("connect"),
            StepKind::Probe { scope } => match scope {
                ProbeScope::All => f.write_str("check installation"),
                ProbeScope::Storage => f.write_str("check storage"),
                ProbeScope::ClusterStack => f.write_str("check cluster stack"),
            },
            StepKind::Install { component, method } => {
                write!(f, "install {component} (method {method})")
            }
            StepKind::Confirm => f.write_str("confirm"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepState {
    Init,
    Connecting,
    Connected,
    ConnectFailed,
    Probing,
    NeedsInstall,
    UpToDate,
    UpgradeAvailable,
    InstallMethodChosen,
    Installing,
    InstallOk,
    InstallFailed,
    Proceeding,
    Cancelled,
    Finished,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepState::Init => "not started",
            StepState::Connecting => "connecting",
            StepState::Connected => "connected",
            StepState::ConnectFailed => "connection failed",
            StepState::Probing => "checking",
            StepState::NeedsInstall => "not installed",
            StepState::UpToDate => "up to date",
            StepState::UpgradeAvailable => "upgrade available",
            StepState::InstallMethodChosen => "install method chosen",
            StepState::Installing => "installing",
            StepState::InstallOk => "installed",
            StepState::InstallFailed => "install failed",
            StepState::Proceeding => "done",
            StepState::Cancelled => "canceled",
            StepState::Finished => "finished",
        };
        f.write_str(label)
    }
}

/// Identifies one outstanding action of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKey {
    Connect,
    Probe(ProbeTarget),
    Install(Component),
}

/// Probe verdict for a single component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentStatus {
    pub component: Component,
    pub label: String,
    /// `NeedsInstall`, `UpToDate` or `UpgradeAvailable`.
    pub state: StepState,
    pub display: Option<String>,
    pub latest: Option<String>,
}

impl ComponentStatus {
    pub fn missing(component: Component) -> Self {
        Self {
            component,
            label: component.label().to_string(),
            state: StepState::NeedsInstall,
            display: None,
            latest: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.state != StepState::NeedsInstall
    }
}

/// Failure of a remote or local action, kept on the step for display and retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionFailure {
    pub reason: String,
    pub output: String,
    pub exit_code: Option<i32>,
}

impl ActionFailure {
    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            output: String::new(),
            exit_code: None,
        }
    }

    pub fn exit(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            reason: format!("command exited with code {exit_code}"),
            output: output.into(),
            exit_code: Some(exit_code),
        }
    }
}
