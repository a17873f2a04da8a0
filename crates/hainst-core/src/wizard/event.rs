//! Progress events published by a session to whoever drives it.

use serde::Serialize;

use super::step::{StepId, StepKind, StepState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum SessionEvent {
    StepStarted { step: StepId, kind: StepKind },
    StepCompleted { step: StepId, state: StepState },
    StepFailed { step: StepId, reason: String },
    LogLine { step: StepId, line: String },
    Finished { success: bool },
    Canceled,
}
