//! Remote install and upgrade sessions for DRBD and the Heartbeat or
//! Corosync/OpenAIS Pacemaker cluster stacks.

pub mod automation;
pub mod config;
pub mod dist;
pub mod error;
pub mod executor;
pub mod install_method;
pub mod model;
pub mod session;
pub mod util;
pub mod version;
pub mod wizard;

#[cfg(test)]
mod testing;

pub use automation::AutomationPolicy;
pub use config::{Config, ConfigError};
pub use dist::{DistResourceTable, StaticResources};
pub use error::WizardError;
pub use executor::{
    ComponentGuard, ExecOutput, ExecutionGuards, RemoteCommand, RemoteExecutor, Timeouts,
    TransportError,
};
pub use install_method::{select_methods, InstallMethod, MethodChoice, MethodKind, MethodQuery};
pub use model::*;
pub use session::{
    OutcomeFlags, RunStop, Session, SessionOptions, SessionOutcome, SessionReport, StepSummary,
};
pub use util::program_in_path;
pub use wizard::{
    ActionFailure, ComponentStatus, EnterOutcome, ProbeScope, SessionEvent, StepId, StepKind,
    StepState, VendorCredentials, WizardStep,
};
