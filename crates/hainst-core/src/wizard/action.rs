//! Background actions: connect, probe and install tasks and their results.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use tracing::{debug, info, warn};

use crate::dist::{DistResourceTable, DIST_DETECT_INFO};
use crate::executor::{
    ComponentGuard, ExecOutput, ExecutionGuards, RemoteCommand, RemoteExecutor, Timeouts,
};
use crate::install_method::InstallMethod;
use crate::model::{Cluster, Component, DistInfo, Host, HostTarget};
use crate::util::log_snippet;
use crate::version::parse_dist_info;

use super::step::{ActionFailure, ActionKey, StepId};

/// Download credentials for vendor package repositories.
#[derive(Clone, PartialEq, Eq)]
pub struct VendorCredentials {
    pub user: String,
    pub password: String,
}

impl VendorCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for VendorCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VendorCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Secrets filled into install command templates.
#[derive(Clone, Copy, Default)]
pub struct InstallSecrets<'a> {
    pub vendor: Option<&'a VendorCredentials>,
    /// Password for the `hacluster` account; the cluster default when unset.
    pub hb_passwd: Option<&'a str>,
}

#[derive(Debug)]
pub enum ActionOutcome {
    /// Connection established; carries the resolved addresses and whatever
    /// distribution data was detected.
    Connected {
        addresses: Vec<String>,
        dist: DistInfo,
    },
    Command(Result<ExecOutput, ActionFailure>),
    Failed(ActionFailure),
}

/// Result of a background action, applied by the session consumer.
#[derive(Debug)]
pub struct ActionMessage {
    pub step: StepId,
    pub generation: u64,
    pub key: ActionKey,
    pub outcome: ActionOutcome,
    /// Released when the message is applied or discarded.
    pub guards: Vec<ComponentGuard>,
}

/// Everything a step needs to start its actions.
pub struct ActionContext<'a> {
    pub host: &'a Host,
    pub executor: &'a Arc<dyn RemoteExecutor>,
    pub resources: &'a dyn DistResourceTable,
    pub guards: &'a ExecutionGuards,
    pub timeouts: Timeouts,
    pub credentials: Option<&'a VendorCredentials>,
    pub hb_passwd: Option<&'a str>,
    pub results: &'a Sender<ActionMessage>,
}

impl ActionContext<'_> {
    pub(crate) fn secrets(&self) -> InstallSecrets<'_> {
        InstallSecrets {
            vendor: self.credentials,
            hb_passwd: self.hb_passwd,
        }
    }
}

/// Identity of a spawned action, echoed back in its message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActionTicket {
    pub step: StepId,
    pub generation: u64,
    pub key: ActionKey,
}

pub(crate) fn spawn_connect(ctx: &ActionContext<'_>, ticket: ActionTicket) {
    let executor = Arc::clone(ctx.executor);
    let target = ctx.host.target();
    let detect = ctx
        .resources
        .resolve_for(&ctx.host.dist, DIST_DETECT_INFO)
        .map(|command| RemoteCommand::new(DIST_DETECT_INFO, command));
    let timeouts = ctx.timeouts;
    let results = ctx.results.clone();
    tokio::spawn(async move {
        let outcome = connect_and_detect(executor.as_ref(), &target, detect, timeouts).await;
        deliver(&results, ticket, outcome, Vec::new()).await;
    });
}

async fn connect_and_detect(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    detect: Option<RemoteCommand>,
    timeouts: Timeouts,
) -> ActionOutcome {
    let addresses = match resolve_addresses(target, timeouts.connect).await {
        Ok(addresses) => addresses,
        Err(failure) => {
            warn!(host = %target.name, address = %target.address, reason = %failure.reason, "address lookup failed");
            return ActionOutcome::Failed(failure);
        }
    };
    info!(host = %target.name, address = %target.address, resolved = ?addresses, "connecting");
    if let Err(err) = executor.connect(target, timeouts.connect).await {
        warn!(host = %target.name, %err, "connect failed");
        return ActionOutcome::Failed(ActionFailure::local(err.to_string()));
    }
    let dist = match detect {
        None => DistInfo::default(),
        Some(detect) => match executor.execute(target, &detect, timeouts.command).await {
            Ok(output) if output.success() => parse_dist_info(&output.output),
            Ok(output) => {
                debug!(host = %target.name, exit_code = output.exit_code, "distribution detection failed");
                DistInfo::default()
            }
            Err(err) => {
                debug!(host = %target.name, %err, "distribution detection failed");
                DistInfo::default()
            }
        },
    };
    ActionOutcome::Connected { addresses, dist }
}

/// Resolve the entered host name to its addresses, in resolver order.
async fn resolve_addresses(
    target: &HostTarget,
    timeout: Duration,
) -> Result<Vec<String>, ActionFailure> {
    let lookup = tokio::net::lookup_host((target.address.as_str(), target.port));
    let resolved = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(resolved)) => resolved,
        Ok(Err(err)) => {
            return Err(ActionFailure::local(format!(
                "cannot resolve {}: {err}",
                target.address
            )))
        }
        Err(_) => {
            return Err(ActionFailure::local(format!(
                "resolving {} timed out",
                target.address
            )))
        }
    };
    let mut addresses: Vec<String> = Vec::new();
    for address in resolved {
        let ip = address.ip().to_string();
        if !addresses.contains(&ip) {
            addresses.push(ip);
        }
    }
    if addresses.is_empty() {
        return Err(ActionFailure::local(format!(
            "{} resolved to no addresses",
            target.address
        )));
    }
    Ok(addresses)
}

/// Run one command; a missing command fails locally without touching the host.
pub(crate) fn spawn_command(
    ctx: &ActionContext<'_>,
    ticket: ActionTicket,
    command: Option<RemoteCommand>,
    timeout: Duration,
    guards: Vec<ComponentGuard>,
) {
    let executor = Arc::clone(ctx.executor);
    let target = ctx.host.target();
    let results = ctx.results.clone();
    tokio::spawn(async move {
        let outcome = match command {
            Some(command) => ActionOutcome::Command(run_command(executor.as_ref(), &target, &command, timeout).await),
            None => ActionOutcome::Failed(ActionFailure::local("unsupported on this distribution")),
        };
        deliver(&results, ticket, outcome, guards).await;
    });
}

async fn run_command(
    executor: &dyn RemoteExecutor,
    target: &HostTarget,
    command: &RemoteCommand,
    timeout: Duration,
) -> Result<ExecOutput, ActionFailure> {
    debug!(host = %target.name, key = %command.key, "executing");
    match executor.execute(target, command, timeout).await {
        Ok(output) => {
            debug!(
                host = %target.name,
                key = %command.key,
                exit_code = output.exit_code,
                output = %log_snippet(&output.output),
                "command finished"
            );
            Ok(output)
        }
        Err(err) => {
            warn!(host = %target.name, key = %command.key, %err, "command failed");
            Err(ActionFailure::local(err.to_string()))
        }
    }
}

async fn deliver(
    results: &Sender<ActionMessage>,
    ticket: ActionTicket,
    outcome: ActionOutcome,
    guards: Vec<ComponentGuard>,
) {
    let message = ActionMessage {
        step: ticket.step,
        generation: ticket.generation,
        key: ticket.key,
        outcome,
        guards,
    };
    if results.send(message).await.is_err() {
        debug!(step = %ticket.step, "session gone; dropping action result");
    }
}

/// Resolve and fill in the install command for a component and method.
///
/// Returns `None` when the distribution defines no such command.
pub fn render_install_command(
    resources: &dyn DistResourceTable,
    host: &Host,
    component: Component,
    method: &InstallMethod,
    secrets: InstallSecrets<'_>,
) -> Option<RemoteCommand> {
    let key = method.command_key(component);
    let template = resources.resolve_for(&host.dist, &key)?;

    let prefix = component.resource_prefix();
    let arch = host.dist.arch.as_deref().map(|arch| {
        resources
            .resolve_for(&host.dist, &format!("{prefix}.arch.{arch}"))
            .unwrap_or_else(|| arch.to_string())
            .replace("i686", "i386")
    });
    let vendor = secrets.vendor;
    let command = template
        .replace("@ARCH@", arch.as_deref().unwrap_or_default())
        .replace("@DISTVERSION@", host.dist.version.as_deref().unwrap_or_default())
        .replace("@KERNELVERSION@", host.dist.kernel.as_deref().unwrap_or_default())
        .replace("@USER@", vendor.map(|c| c.user.as_str()).unwrap_or_default())
        .replace(
            "@PASSWORD@",
            vendor.map(|c| c.password.as_str()).unwrap_or_default(),
        )
        .replace(
            "@HBPASSWD@",
            secrets.hb_passwd.unwrap_or(Cluster::DEFAULT_HB_PASSWD),
        );
    Some(RemoteCommand::new(key, command))
}
