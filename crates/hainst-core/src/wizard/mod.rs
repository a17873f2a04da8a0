//! Wizard step state machine.
//!
//! Steps live in an arena owned by the session and link to each other by
//! [`StepId`]. A step starts its actions in [`WizardStep::enter`], which only
//! spawns tasks; results come back as [`ActionMessage`]s that the session
//! applies through [`WizardStep::on_action_complete`].

mod action;
mod event;
mod probe;
mod step;

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{debug, info};

use crate::dist::{DRBD_CHECK_VERSION, HB_CHECK_VERSION};
use crate::error::WizardError;
use crate::executor::{ExecOutput, RemoteCommand};
use crate::install_method::{select_methods, InstallMethod, MethodQuery};
use crate::model::{Component, Connectivity};

pub use action::{
    render_install_command, ActionContext, ActionMessage, ActionOutcome, InstallSecrets,
    VendorCredentials,
};
pub use event::SessionEvent;
pub use step::{
    ActionFailure, ActionKey, ComponentStatus, ProbeScope, ProbeTarget, StepId, StepKind,
    StepState,
};

pub(crate) use probe::CompletionEnv;

use action::{spawn_command, spawn_connect, ActionTicket};

/// What [`WizardStep::enter`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// Actions were spawned; results arrive through the session queue.
    Started,
    /// The step settled without remote work.
    Completed,
    /// A vendor repository install is waiting for download credentials.
    AwaitingCredentials,
}

#[derive(Debug, Clone)]
pub struct WizardStep {
    id: StepId,
    kind: StepKind,
    state: StepState,
    previous: Option<StepId>,
    next: Option<StepId>,
    next_kind: Option<StepKind>,
    entered: bool,
    completed: bool,
    canceled: bool,
    generation: u64,
    pending: BTreeSet<ActionKey>,
    components: BTreeMap<Component, ComponentStatus>,
    failure: Option<ActionFailure>,
    policy_failure: Option<String>,
    output: Option<String>,
}

impl WizardStep {
    pub(crate) fn new(id: StepId, kind: StepKind, previous: Option<StepId>) -> Self {
        Self {
            id,
            kind,
            state: StepState::Init,
            previous,
            next: None,
            next_kind: None,
            entered: false,
            completed: false,
            canceled: false,
            generation: 0,
            pending: BTreeSet::new(),
            components: BTreeMap::new(),
            failure: None,
            policy_failure: None,
            output: None,
        }
    }

    pub fn id(&self) -> StepId {
        self.id
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn previous(&self) -> Option<StepId> {
        self.previous
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_entered(&self) -> bool {
        self.entered
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn components(&self) -> &BTreeMap<Component, ComponentStatus> {
        &self.components
    }

    pub fn component(&self, component: Component) -> Option<&ComponentStatus> {
        self.components.get(&component)
    }

    pub fn failure(&self) -> Option<&ActionFailure> {
        self.failure.as_ref()
    }

    pub fn policy_failure(&self) -> Option<&str> {
        self.policy_failure.as_deref()
    }

    /// Raw output of a successful install.
    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Kind of the step that follows, once decided.
    pub fn next_kind(&self) -> Option<StepKind> {
        self.next_kind
    }

    /// The step decided on completion. Reading it earlier is an error.
    pub fn next(&self) -> Result<Option<StepId>, WizardError> {
        if !self.completed {
            return Err(WizardError::NextBeforeComplete(self.id));
        }
        Ok(self.next)
    }

    pub fn is_cancelable(&self) -> bool {
        !self.canceled && self.state != StepState::Finished
    }

    pub fn can_retry(&self) -> bool {
        !self.canceled
            && self.completed
            && self.pending.is_empty()
            && matches!(self.kind, StepKind::Connect | StepKind::Probe { .. } | StepKind::Install { .. })
    }

    /// Install offered for a component by this probe step, if any.
    pub fn offers_install(&self, component: Component) -> bool {
        let StepKind::Probe { scope } = self.kind else {
            return false;
        };
        self.completed
            && scope.components().contains(&component)
            && self.component(component).is_some_and(|status| {
                matches!(
                    status.state,
                    StepState::NeedsInstall | StepState::UpgradeAvailable
                )
            })
    }

    pub(crate) fn link_next(&mut self, next: StepId) {
        self.next = Some(next);
    }

    pub(crate) fn needs_link(&self) -> bool {
        self.completed && self.next.is_none() && self.next_kind.is_some()
    }

    /// Start the step's actions. Never blocks; results arrive on the queue.
    pub fn enter(&mut self, ctx: &ActionContext<'_>) -> Result<EnterOutcome, WizardError> {
        if self.canceled {
            return Err(WizardError::StepCanceled(self.id));
        }
        if !self.pending.is_empty() {
            return Err(WizardError::ActionOutstanding(self.id));
        }

        match self.kind {
            StepKind::Connect => {
                self.reset();
                self.state = StepState::Connecting;
                self.start(ctx, ActionKey::Connect, |ctx, ticket| spawn_connect(ctx, ticket));
                Ok(EnterOutcome::Started)
            }
            StepKind::Probe { scope } => {
                let mut acquired = Vec::new();
                for target in scope.targets() {
                    acquired.push((
                        *target,
                        ctx.guards
                            .try_acquire_all(ctx.host.id, target.guarded_components())?,
                    ));
                }
                self.reset();
                self.state = StepState::Probing;
                for (target, guards) in acquired {
                    let key = match target {
                        ProbeTarget::Storage => DRBD_CHECK_VERSION,
                        ProbeTarget::ClusterStack => HB_CHECK_VERSION,
                    };
                    let command = ctx
                        .resources
                        .resolve_for(&ctx.host.dist, key)
                        .map(|command| RemoteCommand::new(key, command));
                    let timeout = ctx.timeouts.command;
                    self.start(ctx, ActionKey::Probe(target), |ctx, ticket| {
                        spawn_command(ctx, ticket, command, timeout, guards)
                    });
                }
                Ok(EnterOutcome::Started)
            }
            StepKind::Install { component, method } => self.enter_install(ctx, component, method),
            StepKind::Confirm => {
                self.reset();
                self.state = StepState::Finished;
                self.completed = true;
                Ok(EnterOutcome::Completed)
            }
        }
    }

    fn enter_install(
        &mut self,
        ctx: &ActionContext<'_>,
        component: Component,
        method: usize,
    ) -> Result<EnterOutcome, WizardError> {
        let choice = select_methods(
            ctx.resources,
            &MethodQuery {
                component,
                dist: &ctx.host.dist,
                staging: true,
                remembered: None,
            },
        );
        let chosen = choice.find(method);
        let vendor = chosen.is_some_and(InstallMethod::uses_vendor_repository);
        if vendor && ctx.credentials.is_none() {
            self.reset();
            self.state = StepState::InstallMethodChosen;
            info!(step = %self.id, %component, method, "waiting for vendor credentials");
            return Ok(EnterOutcome::AwaitingCredentials);
        }

        let Some(command) = chosen.and_then(|chosen| {
            render_install_command(ctx.resources, ctx.host, component, chosen, ctx.secrets())
        }) else {
            self.reset();
            self.fail(ActionFailure::local(format!(
                "{component} install method {method} is unsupported on this distribution"
            )));
            return Ok(EnterOutcome::Completed);
        };

        let guard = ctx.guards.try_acquire(ctx.host.id, component)?;
        self.reset();
        self.state = StepState::Installing;
        info!(step = %self.id, %component, key = %command.key, "starting install");
        let timeout = ctx.timeouts.install;
        self.start(ctx, ActionKey::Install(component), |ctx, ticket| {
            spawn_command(ctx, ticket, Some(command), timeout, vec![guard])
        });
        Ok(EnterOutcome::Started)
    }

    fn start(
        &mut self,
        ctx: &ActionContext<'_>,
        key: ActionKey,
        spawn: impl FnOnce(&ActionContext<'_>, ActionTicket),
    ) {
        self.pending.insert(key);
        spawn(
            ctx,
            ActionTicket {
                step: self.id,
                generation: self.generation,
                key,
            },
        );
    }

    /// Clear results of a previous run and invalidate its late messages.
    fn reset(&mut self) {
        self.generation += 1;
        self.entered = true;
        self.completed = false;
        self.next = None;
        self.next_kind = None;
        self.pending.clear();
        self.components.clear();
        self.failure = None;
        self.policy_failure = None;
        self.output = None;
    }

    fn fail(&mut self, failure: ActionFailure) {
        self.state = match self.kind {
            StepKind::Connect => StepState::ConnectFailed,
            _ => StepState::InstallFailed,
        };
        self.failure = Some(failure);
        self.completed = true;
        self.next_kind = None;
    }

    /// Apply one action result. Returns true when the step just completed.
    pub(crate) fn on_action_complete(
        &mut self,
        key: ActionKey,
        outcome: ActionOutcome,
        env: &mut CompletionEnv<'_>,
    ) -> bool {
        if !self.pending.remove(&key) {
            debug!(step = %self.id, ?key, "ignoring result for an action that is not pending");
            return false;
        }

        match (self.kind, key) {
            (StepKind::Connect, ActionKey::Connect) => match outcome {
                ActionOutcome::Connected { addresses, dist } => {
                    env.host.connectivity = Connectivity::Connected;
                    env.host.record_resolved(addresses);
                    env.host.dist.merge_missing(dist);
                    self.state = StepState::Connected;
                    self.completed = true;
                    self.next_kind = Some(StepKind::probe(ProbeScope::All));
                }
                ActionOutcome::Failed(failure) | ActionOutcome::Command(Err(failure)) => {
                    env.host.connectivity = Connectivity::Failed;
                    self.fail(failure);
                }
                ActionOutcome::Command(Ok(output)) => {
                    env.host.connectivity = Connectivity::Failed;
                    self.fail(ActionFailure::exit(output.output, output.exit_code));
                }
            },
            (StepKind::Probe { scope }, ActionKey::Probe(target)) => {
                // Probe failures read as "not installed".
                let answer = match outcome {
                    ActionOutcome::Command(Ok(ExecOutput { output, exit_code: 0 })) => output,
                    _ => String::new(),
                };
                match target {
                    ProbeTarget::Storage => {
                        let status = probe::apply_storage_probe(&answer, env);
                        self.components.insert(status.component, status);
                    }
                    ProbeTarget::ClusterStack => {
                        for status in probe::apply_cluster_probe(&answer, env) {
                            self.components.insert(status.component, status);
                        }
                    }
                }
                if self.pending.is_empty() {
                    let verdict = probe::evaluate(scope, &self.components, env.flags);
                    self.state = verdict.state;
                    self.policy_failure = verdict.policy_failure;
                    self.next_kind = verdict.next;
                    self.completed = true;
                    env.host.last_probe = Some(Utc::now());
                }
            }
            (StepKind::Install { component, method }, ActionKey::Install(_)) => match outcome {
                ActionOutcome::Command(Ok(output)) if output.success() => {
                    env.flags.set(component, true);
                    env.host.install_methods.insert(component, method);
                    self.state = StepState::InstallOk;
                    self.output = Some(output.output);
                    self.completed = true;
                    self.next_kind = Some(StepKind::probe(ProbeScope::ClusterStack));
                }
                ActionOutcome::Command(Ok(output)) => {
                    self.fail(ActionFailure::exit(output.output, output.exit_code));
                }
                ActionOutcome::Command(Err(failure)) | ActionOutcome::Failed(failure) => {
                    self.fail(failure);
                }
                ActionOutcome::Connected { .. } => {
                    self.fail(ActionFailure::local("unexpected connect result"));
                }
            },
            (kind, key) => {
                debug!(step = %self.id, %kind, ?key, "result does not belong to this step kind");
            }
        }
        self.completed
    }

    /// Record the user's install choice on a settled probe step.
    pub(crate) fn choose_install(
        &mut self,
        component: Component,
        method: usize,
    ) -> Result<(), WizardError> {
        if self.canceled {
            return Err(WizardError::StepCanceled(self.id));
        }
        if !self.offers_install(component) {
            return Err(WizardError::InstallNotOffered(self.id));
        }
        self.state = StepState::InstallMethodChosen;
        self.next = None;
        self.next_kind = Some(StepKind::Install { component, method });
        Ok(())
    }

    /// A finished install moves on once the session advances past it.
    pub(crate) fn proceed(&mut self) {
        if self.state == StepState::InstallOk {
            self.state = StepState::Proceeding;
        }
    }

    /// Stop acting on this step. Outstanding results will be discarded.
    pub fn cancel(&mut self) {
        if self.canceled {
            return;
        }
        self.canceled = true;
        self.state = StepState::Cancelled;
        info!(step = %self.id, kind = %self.kind, pending = self.pending.len(), "step canceled");
    }
}
