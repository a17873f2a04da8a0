//! Orchestration session: one host's traversal through the wizard.
//!
//! The session owns the step arena and is the single consumer of action
//! results. Workers send [`ActionMessage`]s over an async channel; results of
//! canceled steps, stale generations, or a canceled session are dropped
//! without touching host or flag state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::automation::AutomationPolicy;
use crate::config::Config;
use crate::dist::DistResourceTable;
use crate::error::WizardError;
use crate::executor::{ExecutionGuards, RemoteExecutor, Timeouts};
use crate::install_method::{select_methods, MethodChoice, MethodQuery};
use crate::model::{Cluster, Component, Host, MembershipError};
use crate::util::log_snippet;
use crate::wizard::{
    ActionContext, ActionFailure, ActionMessage, CompletionEnv, ComponentStatus, EnterOutcome,
    ProbeScope, SessionEvent, StepId, StepKind, StepState, VendorCredentials, WizardStep,
};

/// Per-component outcome of the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeFlags {
    pub drbd_ok: bool,
    pub hb_pm_ok: bool,
    pub pm_ok: bool,
}

impl OutcomeFlags {
    /// Storage plus at least one cluster stack.
    pub fn success(&self) -> bool {
        self.drbd_ok && (self.hb_pm_ok || self.pm_ok)
    }

    pub fn get(&self, component: Component) -> bool {
        match component {
            Component::Drbd => self.drbd_ok,
            Component::HbPm => self.hb_pm_ok,
            Component::Pm => self.pm_ok,
        }
    }

    pub fn set(&mut self, component: Component, ok: bool) {
        match component {
            Component::Drbd => self.drbd_ok = ok,
            Component::HbPm => self.hb_pm_ok = ok,
            Component::Pm => self.pm_ok = ok,
        }
    }
}

/// Settings a session takes from configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub timeouts: Timeouts,
    /// Components whose staging install methods are offered.
    pub staging: BTreeSet<Component>,
    /// Method defaults for hosts that remember none.
    pub remembered: BTreeMap<Component, usize>,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeouts: config.timeouts.to_timeouts(),
            staging: Component::ALL
                .into_iter()
                .filter(|component| config.staging.enabled_for(*component))
                .collect(),
            remembered: config.remembered.to_map(),
        }
    }
}

/// Why [`Session::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    Finished,
    Canceled,
    /// The step needs a decision: advance, choose an install, or retry.
    AwaitingUser(StepId),
    NeedsCredentials(StepId),
    Blocked(WizardError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    Succeeded,
    Incomplete,
    Canceled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub id: StepId,
    pub kind: StepKind,
    pub state: StepState,
    pub components: Vec<ComponentStatus>,
    pub failure: Option<ActionFailure>,
    pub policy_failure: Option<String>,
}

impl From<&WizardStep> for StepSummary {
    fn from(step: &WizardStep) -> Self {
        Self {
            id: step.id(),
            kind: step.kind(),
            state: step.state(),
            components: step.components().values().cloned().collect(),
            failure: step.failure().cloned(),
            policy_failure: step.policy_failure().map(str::to_string),
        }
    }
}

/// What a session hands back when it ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub flags: OutcomeFlags,
    pub host: Host,
    #[serde(skip)]
    pub cluster: Option<Cluster>,
    pub steps: Vec<StepSummary>,
}

pub struct Session {
    host: Host,
    cluster: Option<Cluster>,
    joined_cluster: bool,
    executor: Arc<dyn RemoteExecutor>,
    resources: Arc<dyn DistResourceTable>,
    guards: ExecutionGuards,
    policy: AutomationPolicy,
    options: SessionOptions,
    credentials: Option<VendorCredentials>,
    steps: Vec<WizardStep>,
    current: StepId,
    flags: OutcomeFlags,
    results_tx: Sender<ActionMessage>,
    results_rx: Receiver<ActionMessage>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    in_flight: usize,
    canceled: bool,
    finished: bool,
    auto_installs: BTreeMap<Component, u32>,
}

impl Session {
    /// Start a session; connected hosts skip the connect step.
    pub fn new(
        host: Host,
        executor: Arc<dyn RemoteExecutor>,
        resources: Arc<dyn DistResourceTable>,
    ) -> Self {
        let first = if host.is_connected() {
            StepKind::probe(ProbeScope::All)
        } else {
            StepKind::Connect
        };
        let current = StepId(0);
        let (results_tx, results_rx) = async_channel::unbounded();
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            host,
            cluster: None,
            joined_cluster: false,
            executor,
            resources,
            guards: ExecutionGuards::new(),
            policy: AutomationPolicy::manual(),
            options: SessionOptions::default(),
            credentials: None,
            steps: vec![WizardStep::new(current, first, None)],
            current,
            flags: OutcomeFlags::default(),
            results_tx,
            results_rx,
            events_tx,
            events_rx,
            in_flight: 0,
            canceled: false,
            finished: false,
            auto_installs: BTreeMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: AutomationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Share guards with other sessions driving the same hosts.
    pub fn with_guards(mut self, guards: ExecutionGuards) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_credentials(mut self, credentials: VendorCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    pub fn flags(&self) -> OutcomeFlags {
        self.flags
    }

    pub fn policy(&self) -> &AutomationPolicy {
        &self.policy
    }

    pub fn current_id(&self) -> StepId {
        self.current
    }

    pub fn current_step(&self) -> &WizardStep {
        self.step_ref(self.current)
    }

    pub fn step(&self, id: StepId) -> Option<&WizardStep> {
        self.steps.get(id.0)
    }

    /// Every step created so far, in creation order.
    pub fn steps(&self) -> &[WizardStep] {
        &self.steps
    }

    /// Subscribe to progress events.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn is_success(&self) -> bool {
        self.finished && self.flags.success()
    }

    pub fn is_cancelable(&self) -> bool {
        !self.canceled && !self.finished && self.current_step().is_cancelable()
    }

    /// Install methods offered for a component on this host.
    pub fn methods(&self, component: Component) -> MethodChoice {
        let remembered = self
            .host
            .remembered_method(component)
            .or_else(|| self.options.remembered.get(&component).copied());
        select_methods(
            self.resources.as_ref(),
            &MethodQuery {
                component,
                dist: &self.host.dist,
                staging: self.options.staging.contains(&component),
                remembered,
            },
        )
    }

    /// Add the host to a cluster for the length of the session.
    ///
    /// Returns false when the host was already a member; such a membership
    /// survives a cancel unless this session made it. A session holds one
    /// cluster; joining another one fails and changes nothing.
    pub fn join_cluster(&mut self, mut cluster: Cluster) -> Result<bool, WizardError> {
        self.ensure_active()?;
        if let Some(held) = self.cluster.as_ref() {
            if held.name() != cluster.name() {
                return Err(MembershipError::AlreadyMember {
                    host: self.host.id,
                    cluster: held.name().to_string(),
                }
                .into());
            }
        }
        let added = cluster.add_host(&mut self.host)?;
        self.cluster = Some(cluster);
        self.joined_cluster |= added;
        if added {
            info!(host = %self.host.name, cluster = ?self.host.cluster, "host joined cluster");
        }
        Ok(added)
    }

    /// Start the current step's action.
    pub fn enter(&mut self) -> Result<EnterOutcome, WizardError> {
        self.ensure_active()?;
        let id = self.current;
        let outcome = self.enter_step(id)?;
        if outcome == EnterOutcome::Completed {
            self.on_step_completed(id);
        }
        Ok(outcome)
    }

    fn enter_step(&mut self, id: StepId) -> Result<EnterOutcome, WizardError> {
        let Session {
            steps,
            host,
            executor,
            resources,
            guards,
            options,
            credentials,
            cluster,
            results_tx,
            ..
        } = self;
        let step = steps.get_mut(id.0).ok_or(WizardError::UnknownStep(id))?;
        let ctx = ActionContext {
            host,
            executor,
            resources: resources.as_ref(),
            guards,
            timeouts: options.timeouts,
            credentials: credentials.as_ref(),
            hb_passwd: cluster.as_ref().map(Cluster::hb_passwd),
            results: results_tx,
        };
        let outcome = step.enter(&ctx)?;
        let kind = step.kind();
        self.in_flight += step.pending_count();
        debug!(step = %id, %kind, ?outcome, in_flight = self.in_flight, "entered step");
        self.emit(SessionEvent::StepStarted { step: id, kind });
        Ok(outcome)
    }

    /// Apply the next action result. Returns the step it was applied to, or
    /// `None` when nothing was outstanding or the result was discarded.
    pub async fn wait_for_result(&mut self) -> Option<StepId> {
        if self.in_flight == 0 {
            return None;
        }
        let message = self.results_rx.recv().await.ok()?;
        self.apply(message)
    }

    /// Wait until the current step has no outstanding action.
    pub async fn settle(&mut self) {
        while !self.canceled && self.current_step().has_pending() {
            if self.wait_for_result().await.is_none() && self.in_flight == 0 {
                break;
            }
        }
    }

    fn apply(&mut self, message: ActionMessage) -> Option<StepId> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let ActionMessage {
            step: id,
            generation,
            key,
            outcome,
            guards,
        } = message;
        if self.canceled {
            debug!(step = %id, ?key, "session canceled; discarding late result");
            return None;
        }
        let step = self.steps.get_mut(id.0)?;
        if step.is_canceled() || step.generation() != generation {
            debug!(step = %id, ?key, generation, "discarding stale result");
            return None;
        }
        let mut env = CompletionEnv {
            host: &mut self.host,
            flags: &mut self.flags,
            resources: self.resources.as_ref(),
        };
        let completed = step.on_action_complete(key, outcome, &mut env);
        drop(guards);
        if completed {
            self.on_step_completed(id);
        }
        Some(id)
    }

    fn on_step_completed(&mut self, id: StepId) {
        self.link_next(id);
        let step = self.step_ref(id);
        let state = step.state();
        let mut events = Vec::new();
        if let Some(output) = step.output() {
            events.extend(output.lines().map(|line| SessionEvent::LogLine {
                step: id,
                line: line.to_string(),
            }));
        }
        if let Some(failure) = step.failure() {
            warn!(
                step = %id,
                kind = %step.kind(),
                reason = %failure.reason,
                output = %log_snippet(&failure.output),
                "step failed"
            );
            events.extend(failure.output.lines().map(|line| SessionEvent::LogLine {
                step: id,
                line: line.to_string(),
            }));
            events.push(SessionEvent::StepFailed {
                step: id,
                reason: failure.reason.clone(),
            });
        } else if let Some(reason) = step.policy_failure() {
            info!(step = %id, flags = ?self.flags, reason, "check found missing components");
            events.push(SessionEvent::StepFailed {
                step: id,
                reason: reason.to_string(),
            });
        } else {
            info!(step = %id, kind = %step.kind(), ?state, "step completed");
            events.push(SessionEvent::StepCompleted { step: id, state });
        }
        if state == StepState::Finished {
            self.finished = true;
            info!(host = %self.host.name, success = self.flags.success(), "session finished");
            events.push(SessionEvent::Finished {
                success: self.flags.success(),
            });
        }
        for event in events {
            self.emit(event);
        }
    }

    fn link_next(&mut self, id: StepId) {
        let Some(step) = self.steps.get(id.0) else {
            return;
        };
        let (true, Some(kind)) = (step.needs_link(), step.next_kind()) else {
            return;
        };
        let next = StepId(self.steps.len());
        self.steps.push(WizardStep::new(next, kind, Some(id)));
        self.steps[id.0].link_next(next);
    }

    /// Move to the step the current one decided on.
    pub fn next(&mut self) -> Result<StepId, WizardError> {
        self.ensure_active()?;
        let current = self.current;
        let next = self
            .current_step()
            .next()?
            .ok_or(WizardError::NoNextStep(current))?;
        self.steps[current.0].proceed();
        self.current = next;
        Ok(next)
    }

    /// Go back along the path actually taken.
    pub fn previous(&mut self) -> Result<Option<StepId>, WizardError> {
        self.ensure_active()?;
        let step = self.current_step();
        if step.has_pending() {
            return Err(WizardError::ActionOutstanding(step.id()));
        }
        let Some(previous) = step.previous() else {
            return Ok(None);
        };
        self.current = previous;
        Ok(Some(previous))
    }

    /// Pick an install for a component offered by the current probe step and
    /// start it. On error the session is left as it was.
    pub fn choose_install(
        &mut self,
        component: Component,
        method: usize,
    ) -> Result<StepId, WizardError> {
        self.ensure_active()?;
        let current = self.current;
        let snapshot = self.step_ref(current).clone();
        let arena_len = self.steps.len();
        let started = self.start_install(current, component, method);
        if started.is_err() {
            self.steps.truncate(arena_len);
            self.steps[current.0] = snapshot;
            self.current = current;
        }
        started
    }

    fn start_install(
        &mut self,
        current: StepId,
        component: Component,
        method: usize,
    ) -> Result<StepId, WizardError> {
        let choice = self.methods(component);
        if choice.is_empty() {
            return Err(WizardError::NoInstallMethod(component));
        }
        if choice.find(method).is_none() {
            return Err(WizardError::MethodUnavailable {
                component,
                index: method,
            });
        }
        self.steps
            .get_mut(current.0)
            .ok_or(WizardError::UnknownStep(current))?
            .choose_install(component, method)?;
        self.link_next(current);
        let install = self.next()?;
        self.enter()?;
        Ok(install)
    }

    /// Provide vendor repository credentials, resuming a waiting install.
    pub fn set_vendor_credentials(
        &mut self,
        credentials: VendorCredentials,
    ) -> Result<Option<EnterOutcome>, WizardError> {
        self.credentials = Some(credentials);
        let step = self.current_step();
        let waiting = matches!(step.kind(), StepKind::Install { .. })
            && step.is_entered()
            && !step.has_pending()
            && step.state() == StepState::InstallMethodChosen;
        if waiting && !self.canceled {
            return self.enter().map(Some);
        }
        Ok(None)
    }

    /// Re-run the current step after a failure or to refresh a probe.
    pub fn retry(&mut self) -> Result<EnterOutcome, WizardError> {
        self.ensure_active()?;
        let step = self.current_step();
        if step.has_pending() {
            return Err(WizardError::ActionOutstanding(step.id()));
        }
        if !step.can_retry() {
            return Err(WizardError::NotRetryable(step.id()));
        }
        info!(step = %step.id(), kind = %step.kind(), "retrying step");
        self.enter()
    }

    /// Cancel the session. Late results are dropped and a cluster joined
    /// during the session is left again; probed versions stay.
    pub fn cancel(&mut self) {
        if self.canceled || self.finished {
            return;
        }
        self.canceled = true;
        let current = self.current;
        for step in &mut self.steps {
            if step.has_pending() || step.id() == current {
                step.cancel();
            }
        }
        if self.joined_cluster {
            if let Some(cluster) = self.cluster.as_mut() {
                cluster.remove_host(&mut self.host);
                info!(host = %self.host.name, cluster = cluster.name(), "host detached from cluster");
            }
            self.joined_cluster = false;
        }
        info!(host = %self.host.name, in_flight = self.in_flight, "session canceled");
        self.emit(SessionEvent::Canceled);
    }

    /// Drive the wizard as far as the automation policy allows.
    pub async fn run(&mut self) -> RunStop {
        loop {
            if self.canceled {
                return RunStop::Canceled;
            }
            if self.finished {
                return RunStop::Finished;
            }
            let id = self.current;
            let step = self.current_step();
            if !step.is_entered() {
                match self.enter() {
                    Ok(EnterOutcome::AwaitingCredentials) => return RunStop::NeedsCredentials(id),
                    Ok(_) => continue,
                    Err(err) => return RunStop::Blocked(err),
                }
            }
            if step.has_pending() {
                self.settle().await;
                continue;
            }
            if !step.is_completed() {
                return RunStop::NeedsCredentials(id);
            }

            if matches!(step.next(), Ok(Some(_))) {
                if !self.policy.auto_next {
                    return RunStop::AwaitingUser(id);
                }
                self.pause().await;
                if let Err(err) = self.next() {
                    return RunStop::Blocked(err);
                }
                continue;
            }

            let component = self.policy.next_install(
                &self.flags,
                |component| step.offers_install(component),
                |component| self.auto_installs.get(&component).copied().unwrap_or(0),
            );
            let Some(component) = component else {
                return RunStop::AwaitingUser(id);
            };
            let Some(method) = self
                .methods(component)
                .default_method()
                .map(|method| method.index())
            else {
                warn!(%component, "no install method for automatic install");
                return RunStop::AwaitingUser(id);
            };
            *self.auto_installs.entry(component).or_default() += 1;
            info!(%component, method, "installing automatically");
            self.pause().await;
            if let Err(err) = self.choose_install(component, method) {
                return RunStop::Blocked(err);
            }
        }
    }

    /// End the session and hand back the host and cluster.
    pub fn finish(self) -> SessionReport {
        let outcome = if self.canceled {
            SessionOutcome::Canceled
        } else if self.is_success() {
            SessionOutcome::Succeeded
        } else {
            SessionOutcome::Incomplete
        };
        SessionReport {
            outcome,
            flags: self.flags,
            steps: self.steps.iter().map(StepSummary::from).collect(),
            host: self.host,
            cluster: self.cluster,
        }
    }

    async fn pause(&self) {
        if !self.policy.delay.is_zero() {
            tokio::time::sleep(self.policy.delay).await;
        }
    }

    fn ensure_active(&self) -> Result<(), WizardError> {
        if self.canceled {
            return Err(WizardError::SessionCanceled);
        }
        if self.finished {
            return Err(WizardError::SessionFinished);
        }
        Ok(())
    }

    fn step_ref(&self, id: StepId) -> &WizardStep {
        &self.steps[id.0]
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.try_send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{StaticResources, DIST_DETECT_INFO, DRBD_CHECK_VERSION, HB_CHECK_VERSION};
    use crate::executor::TransportError;
    use crate::install_method::MethodKind;
    use crate::model::{Connectivity, DistInfo, HostId};
    use crate::testing::ScriptedExecutor;

    const HOST: HostId = HostId(7);

    fn connected_host(dist: DistInfo) -> Host {
        let mut host = Host::new(HOST, "node-a", "10.0.0.7");
        host.dist = dist;
        host.connectivity = Connectivity::Connected;
        host
    }

    fn session_for(host: Host, executor: &Arc<ScriptedExecutor>) -> Session {
        Session::new(host, executor.clone(), Arc::new(StaticResources::builtin()))
    }

    fn fedora() -> DistInfo {
        DistInfo::new("fedora", "13")
    }

    fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[test]
    fn success_predicate_matches_all_combinations() {
        for drbd_ok in [false, true] {
            for hb_pm_ok in [false, true] {
                for pm_ok in [false, true] {
                    let flags = OutcomeFlags {
                        drbd_ok,
                        hb_pm_ok,
                        pm_ok,
                    };
                    assert_eq!(flags.success(), drbd_ok && (hb_pm_ok || pm_ok), "{flags:?}");
                }
            }
        }
    }

    #[tokio::test]
    async fn empty_probe_output_needs_install() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "   \n\t", 0);
        let mut session = session_for(connected_host(fedora()), &executor);

        assert_eq!(
            session.current_step().kind(),
            StepKind::probe(ProbeScope::All)
        );
        assert_eq!(session.current_step().previous(), None);
        assert_eq!(session.enter(), Ok(EnterOutcome::Started));
        session.settle().await;

        let step = session.current_step();
        assert_eq!(step.state(), StepState::NeedsInstall);
        for component in Component::ALL {
            assert_eq!(
                step.component(component).map(|status| status.state),
                Some(StepState::NeedsInstall)
            );
            assert!(step.offers_install(component));
        }
        assert_eq!(session.flags(), OutcomeFlags::default());
        assert_eq!(step.next(), Ok(None));
        assert!(step.policy_failure().is_some());
        assert!(step.can_retry());
        assert!(session.host().last_probe.is_some());
    }

    #[tokio::test]
    async fn probe_failures_read_as_not_installed() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "drbdadm: command not found", 127);
        executor.fail(HB_CHECK_VERSION, TransportError::Timeout(Default::default()));
        let mut session = session_for(connected_host(fedora()), &executor);

        session.enter().expect("enter probe");
        session.settle().await;

        assert_eq!(session.current_step().state(), StepState::NeedsInstall);
        assert_eq!(session.flags(), OutcomeFlags::default());
        assert!(!session.is_canceled());
        assert_eq!(session.retry(), Ok(EnterOutcome::Started));
        session.settle().await;
        assert_eq!(executor.call_count(DRBD_CHECK_VERSION), 2);
    }

    #[tokio::test]
    async fn sles10_heartbeat_counts_as_current() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "8.4.1\n", 0);
        executor.respond(HB_CHECK_VERSION, "hb:2.1.3\n", 0);
        let mut session = session_for(connected_host(DistInfo::new("suse", "sles10")), &executor);
        let events = session.events();

        session.enter().expect("enter probe");
        session.settle().await;

        let flags = session.flags();
        assert!(flags.drbd_ok && flags.hb_pm_ok && !flags.pm_ok);
        let step = session.current_step();
        assert_eq!(step.state(), StepState::UpToDate);
        assert_eq!(
            step.component(Component::HbPm)
                .and_then(|status| status.display.as_deref()),
            Some("2.1.3 (2.1.4)")
        );

        let confirm = session.next().expect("confirm step");
        assert_eq!(session.current_step().kind(), StepKind::Confirm);
        assert_eq!(session.current_step().previous(), Some(StepId(0)));
        assert_eq!(session.enter(), Ok(EnterOutcome::Completed));
        assert!(session.is_finished());
        assert!(session.is_success());
        assert!(!session.is_cancelable());
        assert_eq!(session.step(confirm).map(WizardStep::state), Some(StepState::Finished));

        let events = drain(&events);
        assert!(events.contains(&SessionEvent::Finished { success: true }));
        assert_eq!(session.finish().outcome, SessionOutcome::Succeeded);
    }

    #[tokio::test]
    async fn reentering_probe_with_same_output_is_idempotent() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "version: 8.3.11 (api:88/proto:86-96)", 0);
        executor.respond(HB_CHECK_VERSION, "pm:1.1.6\ncs:1.4.1\n", 0);
        let mut session = session_for(connected_host(fedora()), &executor);

        session.enter().expect("enter probe");
        session.settle().await;
        let first_state = session.current_step().state();
        let first_components = session.current_step().components().clone();
        let first_flags = session.flags();

        session.retry().expect("retry probe");
        session.settle().await;

        // An older but present installation still counts as ok.
        assert_eq!(first_state, StepState::UpgradeAvailable);
        assert!(first_flags.success());
        assert_eq!(session.current_step().state(), first_state);
        assert_eq!(session.current_step().components(), &first_components);
        assert_eq!(session.flags(), first_flags);
        assert_eq!(executor.call_count(HB_CHECK_VERSION), 2);
    }

    #[tokio::test]
    async fn probes_join_before_the_step_completes() {
        let executor = ScriptedExecutor::new();
        let gate = executor.gate(DRBD_CHECK_VERSION);
        executor.respond(DRBD_CHECK_VERSION, "8.4.1", 0);
        executor.respond(HB_CHECK_VERSION, "pm:1.1.6\nais:0.80.5", 0);
        let mut session = session_for(connected_host(fedora()), &executor);
        let probe = session.current_id();

        session.enter().expect("enter probe");
        assert_eq!(session.wait_for_result().await, Some(probe));

        let step = session.current_step();
        assert_eq!(step.state(), StepState::Probing);
        assert!(step.has_pending());
        assert_eq!(step.next(), Err(WizardError::NextBeforeComplete(probe)));
        assert_eq!(session.next(), Err(WizardError::NextBeforeComplete(probe)));
        assert_eq!(session.enter(), Err(WizardError::ActionOutstanding(probe)));
        assert!(session.flags().pm_ok);

        gate.notify_one();
        session.settle().await;
        assert!(session.current_step().is_completed());
        assert!(session.flags().success());
    }

    #[tokio::test]
    async fn late_result_after_cancel_is_discarded() {
        let executor = ScriptedExecutor::new();
        let gate = executor.gate(DRBD_CHECK_VERSION);
        executor.respond(DRBD_CHECK_VERSION, "8.4.1", 0);
        executor.respond(HB_CHECK_VERSION, "hb:3.0.5", 0);
        let guards = ExecutionGuards::new();
        let mut session =
            session_for(connected_host(fedora()), &executor).with_guards(guards.clone());
        let probe = session.current_id();

        session.enter().expect("enter probe");
        assert_eq!(session.wait_for_result().await, Some(probe));
        let flags_before = session.flags();
        let versions_before = session.host().versions.clone();
        assert!(guards.is_busy(HOST, Component::Drbd));

        session.cancel();
        gate.notify_one();
        assert_eq!(session.wait_for_result().await, None);

        assert_eq!(session.flags(), flags_before);
        assert!(!session.flags().drbd_ok);
        assert_eq!(session.host().versions, versions_before);
        assert_eq!(session.current_step().state(), StepState::Cancelled);
        assert!(session.is_canceled());
        assert!(!session.is_finished());
        assert!(!guards.is_busy(HOST, Component::Drbd));
        assert_eq!(session.enter(), Err(WizardError::SessionCanceled));
    }

    #[tokio::test]
    async fn busy_component_blocks_enter_without_side_effects() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "8.4.1", 0);
        executor.respond(HB_CHECK_VERSION, "hb:3.0.5", 0);
        let guards = ExecutionGuards::new();
        let held = guards.try_acquire(HOST, Component::Pm).expect("take guard");
        let mut session =
            session_for(connected_host(fedora()), &executor).with_guards(guards.clone());

        assert_eq!(
            session.enter(),
            Err(WizardError::ComponentBusy {
                host: HOST,
                component: Component::Pm,
            })
        );
        assert_eq!(session.current_step().state(), StepState::Init);
        assert!(!session.current_step().is_entered());
        assert!(!guards.is_busy(HOST, Component::Drbd));
        assert!(executor.calls().is_empty());

        drop(held);
        assert_eq!(session.enter(), Ok(EnterOutcome::Started));
        session.settle().await;
        assert!(session.flags().success());
    }

    #[tokio::test]
    async fn storage_install_proceeds_to_cluster_probe() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "pm:1.1.6\ncs:1.4.1\n", 0);
        executor.respond("DrbdInst.install.3", "Complete!\n", 0);
        let mut session = session_for(connected_host(fedora()), &executor);
        let probe = session.current_id();

        session.enter().expect("enter probe");
        session.settle().await;
        assert_eq!(session.current_step().state(), StepState::NeedsInstall);
        let methods = session.methods(Component::Drbd);
        assert_eq!(
            methods.find(3).map(|method| method.kind()),
            Some(MethodKind::PackageManager)
        );

        let install = session
            .choose_install(Component::Drbd, 3)
            .expect("choose install");
        assert_eq!(
            session.step(probe).map(WizardStep::state),
            Some(StepState::InstallMethodChosen)
        );
        assert_eq!(session.current_id(), install);
        assert_eq!(session.current_step().previous(), Some(probe));
        assert_eq!(session.current_step().state(), StepState::Installing);

        session.settle().await;
        let step = session.current_step();
        assert_eq!(step.state(), StepState::InstallOk);
        assert!(session.flags().drbd_ok);
        assert_eq!(session.host().remembered_method(Component::Drbd), Some(3));
        let next = step.next().expect("install completed").expect("next step");
        assert_eq!(
            session.step(next).map(WizardStep::kind),
            Some(StepKind::probe(ProbeScope::ClusterStack))
        );

        assert_eq!(session.next(), Ok(next));
        assert_eq!(
            session.step(install).map(WizardStep::state),
            Some(StepState::Proceeding)
        );
        session.enter().expect("enter cluster probe");
        session.settle().await;
        assert_eq!(session.current_step().state(), StepState::UpToDate);
        assert!(session.flags().success());
        assert_eq!(executor.call_count(DRBD_CHECK_VERSION), 1);
    }

    #[tokio::test]
    async fn failed_install_stays_put_and_can_retry() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "hb:3.0.5", 0);
        executor.respond("DrbdInst.install.3", "No package drbd-km available.", 1);
        executor.respond("DrbdInst.install.3", "Complete!", 0);
        let mut session = session_for(connected_host(fedora()), &executor);
        let events = session.events();

        session.enter().expect("enter probe");
        session.settle().await;
        let install = session
            .choose_install(Component::Drbd, 3)
            .expect("choose install");
        session.settle().await;

        let step = session.current_step();
        assert_eq!(session.current_id(), install);
        assert_eq!(step.state(), StepState::InstallFailed);
        let failure = step.failure().expect("failure kept");
        assert_eq!(failure.exit_code, Some(1));
        assert!(failure.output.contains("No package"));
        assert!(!session.flags().drbd_ok);
        assert!(step.can_retry());
        assert_eq!(step.next(), Ok(None));
        assert_eq!(session.next(), Err(WizardError::NoNextStep(install)));
        assert!(drain(&events)
            .iter()
            .any(|event| matches!(event, SessionEvent::StepFailed { step, .. } if *step == install)));

        assert_eq!(session.retry(), Ok(EnterOutcome::Started));
        session.settle().await;
        assert_eq!(session.current_step().state(), StepState::InstallOk);
        assert!(session.flags().drbd_ok);
        assert_eq!(session.current_step().failure(), None);
    }

    #[tokio::test]
    async fn busy_install_choice_leaves_session_unchanged() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "hb:3.0.5", 0);
        executor.respond("DrbdInst.install.3", "Complete!", 0);
        let guards = ExecutionGuards::new();
        let mut session =
            session_for(connected_host(fedora()), &executor).with_guards(guards.clone());

        session.enter().expect("enter probe");
        session.settle().await;
        let probe = session.current_id();
        let state = session.current_step().state();

        let held = guards.try_acquire(HOST, Component::Drbd).expect("take guard");
        assert_eq!(
            session.choose_install(Component::Drbd, 3),
            Err(WizardError::ComponentBusy {
                host: HOST,
                component: Component::Drbd,
            })
        );
        assert_eq!(session.current_id(), probe);
        assert_eq!(session.current_step().state(), state);
        assert_eq!(session.current_step().next(), Ok(None));
        assert!(session.current_step().offers_install(Component::Drbd));
        assert_eq!(session.steps().len(), 1);

        drop(held);
        let install = session
            .choose_install(Component::Drbd, 3)
            .expect("choose install");
        assert_eq!(session.current_step().previous(), Some(probe));
        session.settle().await;
        assert_eq!(session.step(install).map(WizardStep::state), Some(StepState::InstallOk));
    }

    #[tokio::test]
    async fn install_choice_is_validated() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "8.4.1", 0);
        executor.respond(HB_CHECK_VERSION, "", 0);
        let resources = StaticResources::builtin().with("", "PmInst.install.text.3", "manual");
        let mut session = Session::new(
            connected_host(fedora()),
            executor.clone(),
            Arc::new(resources),
        );

        session.enter().expect("enter probe");
        session.settle().await;
        let probe = session.current_id();

        assert_eq!(
            session.choose_install(Component::Pm, 2),
            Err(WizardError::MethodUnavailable {
                component: Component::Pm,
                index: 2,
            })
        );
        assert_eq!(
            session.choose_install(Component::Drbd, 3),
            Err(WizardError::InstallNotOffered(probe))
        );

        let install = session
            .choose_install(Component::Pm, 3)
            .expect("choose install");
        let step = session.current_step();
        assert_eq!(step.id(), install);
        assert_eq!(step.state(), StepState::InstallFailed);
        assert!(step
            .failure()
            .is_some_and(|failure| failure.reason.contains("unsupported")));
        assert_eq!(executor.call_count("PmInst.install.3"), 0);
    }

    #[tokio::test]
    async fn vendor_install_waits_for_credentials() {
        let executor = ScriptedExecutor::new();
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "hb:3.0.5", 0);
        executor.respond("DrbdInst.install.1", "ok", 0);
        let mut session = session_for(connected_host(fedora()), &executor);

        session.enter().expect("enter probe");
        session.settle().await;
        let install = session
            .choose_install(Component::Drbd, 1)
            .expect("choose install");
        assert_eq!(session.current_step().state(), StepState::InstallMethodChosen);
        assert_eq!(executor.call_count("DrbdInst.install.1"), 0);
        assert_eq!(session.run().await, RunStop::NeedsCredentials(install));

        let resumed = session.set_vendor_credentials(VendorCredentials::new("alice", "pw"));
        assert_eq!(resumed, Ok(Some(EnterOutcome::Started)));
        session.settle().await;

        assert_eq!(session.current_step().state(), StepState::InstallOk);
        assert!(executor.calls().iter().any(|command| {
            command.key == "DrbdInst.install.1" && command.command.contains("--http-user='alice'")
        }));
    }

    #[tokio::test]
    async fn cancel_detaches_cluster_joined_during_session() {
        let executor = ScriptedExecutor::new();
        let mut session = session_for(connected_host(fedora()), &executor);

        assert_eq!(session.join_cluster(Cluster::new("ha")), Ok(true));
        assert_eq!(session.host().cluster.as_deref(), Some("ha"));
        assert!(session.is_cancelable());

        session.cancel();
        assert_eq!(session.host().cluster, None);
        assert!(session.cluster().is_some_and(|cluster| !cluster.contains(HOST)));
        assert!(!session.is_cancelable());
        assert_eq!(session.finish().outcome, SessionOutcome::Canceled);

        let mut cluster = Cluster::new("ha");
        let mut member = connected_host(fedora());
        assert_eq!(cluster.add_host(&mut member), Ok(true));
        let mut session = session_for(member, &executor);
        assert_eq!(session.join_cluster(cluster), Ok(false));
        session.cancel();
        assert_eq!(session.host().cluster.as_deref(), Some("ha"));
    }

    #[tokio::test]
    async fn rejoining_keeps_membership_made_by_the_session() {
        let executor = ScriptedExecutor::new();
        let mut session = session_for(connected_host(fedora()), &executor);

        assert_eq!(session.join_cluster(Cluster::new("ha")), Ok(true));
        let held = session.cluster().cloned().expect("cluster held");
        assert_eq!(session.join_cluster(held), Ok(false));
        assert_eq!(
            session.join_cluster(Cluster::new("beta")),
            Err(WizardError::Membership(MembershipError::AlreadyMember {
                host: HOST,
                cluster: "ha".to_string(),
            }))
        );
        assert_eq!(session.cluster().map(Cluster::name), Some("ha"));

        session.cancel();
        assert_eq!(session.host().cluster, None);
        assert!(session.cluster().is_some_and(|cluster| cluster.is_empty()));
    }

    #[tokio::test]
    async fn rejected_join_leaves_outside_membership_alone() {
        let executor = ScriptedExecutor::new();
        let mut alpha = Cluster::new("alpha");
        let mut member = connected_host(fedora());
        assert_eq!(alpha.add_host(&mut member), Ok(true));
        let mut session = session_for(member, &executor);

        assert_eq!(
            session.join_cluster(Cluster::new("beta")),
            Err(WizardError::Membership(MembershipError::AlreadyMember {
                host: HOST,
                cluster: "alpha".to_string(),
            }))
        );
        assert!(session.cluster().is_none());

        session.cancel();
        assert_eq!(session.host().cluster.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn unattended_run_installs_missing_storage() {
        let executor = ScriptedExecutor::new();
        executor.respond(
            DIST_DETECT_INFO,
            "dist:fedora\nversion:13\narch:i686\nkernel:2.6.33.3\n",
            0,
        );
        executor.respond(DRBD_CHECK_VERSION, "", 0);
        executor.respond(HB_CHECK_VERSION, "pm:1.1.6\ncs:1.4.1\n", 0);
        executor.respond("DrbdInst.install.3", "Complete!", 0);
        let mut host = Host::new(HostId(3), "node-c", "10.0.0.3");
        host.install_methods.insert(Component::Drbd, 3);
        let mut session =
            session_for(host, &executor).with_policy(AutomationPolicy::unattended());

        assert_eq!(session.current_step().kind(), StepKind::Connect);
        assert_eq!(session.run().await, RunStop::Finished);
        assert!(session.is_success());

        let kinds: Vec<StepKind> = session.steps().iter().map(WizardStep::kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Connect,
                StepKind::probe(ProbeScope::All),
                StepKind::Install {
                    component: Component::Drbd,
                    method: 3,
                },
                StepKind::probe(ProbeScope::ClusterStack),
                StepKind::Confirm,
            ]
        );
        assert!(executor
            .calls()
            .iter()
            .any(|command| command.command.contains("drbd-km-2.6.33.3")));

        let report = session.finish();
        assert_eq!(report.outcome, SessionOutcome::Succeeded);
        assert_eq!(report.host.connectivity, Connectivity::Connected);
        assert_eq!(report.host.dist.arch.as_deref(), Some("i686"));
    }

    #[tokio::test]
    async fn manual_run_stops_after_each_step() {
        let executor = ScriptedExecutor::new();
        let mut session = session_for(Host::new(HOST, "node-a", "10.0.0.7"), &executor);
        let connect = session.current_id();

        assert_eq!(session.run().await, RunStop::AwaitingUser(connect));
        assert_eq!(session.current_step().state(), StepState::Connected);
        assert_eq!(session.host().connectivity, Connectivity::Connected);
        assert_eq!(session.host().addresses, vec!["10.0.0.7"]);
        assert!(session.next().is_ok());
        assert_eq!(session.previous(), Ok(Some(connect)));
        assert_eq!(session.previous(), Ok(None));
    }

    #[tokio::test]
    async fn connect_failure_is_retryable() {
        let executor = ScriptedExecutor::new();
        executor.fail_connect(TransportError::Connect {
            host: "10.0.0.7".to_string(),
            reason: "Connection refused".to_string(),
        });
        let mut session = session_for(Host::new(HOST, "node-a", "10.0.0.7"), &executor);
        let connect = session.current_id();

        assert_eq!(session.run().await, RunStop::AwaitingUser(connect));
        let step = session.current_step();
        assert_eq!(step.state(), StepState::ConnectFailed);
        assert!(step
            .failure()
            .is_some_and(|failure| failure.reason.contains("Connection refused")));
        assert_eq!(session.host().connectivity, Connectivity::Failed);
        assert!(step.can_retry());
    }

    #[tokio::test]
    async fn unresolvable_address_fails_connect() {
        let executor = ScriptedExecutor::new();
        let mut session = session_for(Host::new(HOST, "node-a", "node\0a"), &executor);
        let connect = session.current_id();

        assert_eq!(session.run().await, RunStop::AwaitingUser(connect));
        let step = session.current_step();
        assert_eq!(step.state(), StepState::ConnectFailed);
        assert!(step
            .failure()
            .is_some_and(|failure| failure.reason.starts_with("cannot resolve")));
        assert_eq!(session.host().connectivity, Connectivity::Failed);
        assert!(executor.calls().is_empty());
        assert!(step.can_retry());
    }
}
