//! Errors reported by the wizard navigation surface.
//!
//! Remote failures never show up here; they settle on the step that ran them.

use thiserror::Error;

use crate::model::{Component, HostId, MembershipError};
use crate::wizard::StepId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WizardError {
    #[error("next step of {0} read before its action completed")]
    NextBeforeComplete(StepId),
    #[error("{0} still has an action outstanding")]
    ActionOutstanding(StepId),
    #[error("{component} on {host} is busy with another action")]
    ComponentBusy { host: HostId, component: Component },
    #[error("{0} was canceled")]
    StepCanceled(StepId),
    #[error("session was canceled")]
    SessionCanceled,
    #[error("session already finished")]
    SessionFinished,
    #[error("{0} has no next step")]
    NoNextStep(StepId),
    #[error("install method {index} is not available for {component}")]
    MethodUnavailable { component: Component, index: usize },
    #[error("no install method available for {0}")]
    NoInstallMethod(Component),
    #[error("{0} does not offer an install")]
    InstallNotOffered(StepId),
    #[error("{0} cannot be retried in its current state")]
    NotRetryable(StepId),
    #[error("unknown step {0}")]
    UnknownStep(StepId),
    #[error(transparent)]
    Membership(#[from] MembershipError),
}
