//! Probe result evaluation: parsed versions to component verdicts and flags.

use std::collections::BTreeMap;

use crate::dist::{latest_version_key, DistResourceTable};
use crate::model::{Component, Host};
use crate::session::OutcomeFlags;
use crate::version::{is_upgrade_available, normalize_heartbeat, parse_installation_info};

use super::step::{ComponentStatus, ProbeScope, StepKind, StepState};

/// Mutable state a completing action may touch.
pub(crate) struct CompletionEnv<'a> {
    pub host: &'a mut Host,
    pub flags: &'a mut OutcomeFlags,
    pub resources: &'a dyn DistResourceTable,
}

/// Aggregate verdict of a probe step once all of its probes joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProbeVerdict {
    pub state: StepState,
    pub policy_failure: Option<String>,
    pub next: Option<StepKind>,
}

fn version_state(version: &str, latest: Option<&str>) -> StepState {
    match latest {
        Some(latest) if is_upgrade_available(version, latest) => StepState::UpgradeAvailable,
        _ => StepState::UpToDate,
    }
}

fn latest_for(env: &CompletionEnv<'_>, component: Component) -> Option<String> {
    env.resources
        .resolve_for(&env.host.dist, &latest_version_key(component))
}

pub(crate) fn apply_storage_probe(output: &str, env: &mut CompletionEnv<'_>) -> ComponentStatus {
    let parsed = if output.trim().is_empty() {
        Default::default()
    } else {
        parse_installation_info(output)
    };
    env.host.versions.drbd = parsed.drbd.clone();
    env.host.versions.drbd_utils = parsed.drbd_utils;

    let Some(version) = parsed.drbd else {
        env.flags.set(Component::Drbd, false);
        return ComponentStatus::missing(Component::Drbd);
    };
    env.flags.set(Component::Drbd, true);
    let latest = latest_for(env, Component::Drbd);
    ComponentStatus {
        component: Component::Drbd,
        label: Component::Drbd.label().to_string(),
        state: version_state(&version, latest.as_deref()),
        display: Some(version),
        latest,
    }
}

pub(crate) fn apply_cluster_probe(
    output: &str,
    env: &mut CompletionEnv<'_>,
) -> [ComponentStatus; 2] {
    env.host.versions.clear_cluster_stack();
    if output.trim().is_empty() {
        env.flags.set(Component::HbPm, false);
        env.flags.set(Component::Pm, false);
        return [
            ComponentStatus::missing(Component::HbPm),
            ComponentStatus::missing(Component::Pm),
        ];
    }
    let parsed = parse_installation_info(output);
    env.host.versions.heartbeat = parsed.heartbeat.clone();
    env.host.versions.pacemaker = parsed.pacemaker.clone();
    env.host.versions.corosync = parsed.corosync.clone();
    env.host.versions.openais = parsed.openais.clone();

    let heartbeat = match parsed.heartbeat.as_deref() {
        None => ComponentStatus::missing(Component::HbPm),
        Some(heartbeat) => {
            let normalized = normalize_heartbeat(heartbeat, env.host.dist_version());
            let latest = latest_for(env, Component::HbPm);
            let (label, display) = match parsed.pacemaker.as_deref() {
                Some(pacemaker) if pacemaker != normalized.compare => (
                    Component::HbPm.label(),
                    format!("{pacemaker}/{}", normalized.display),
                ),
                _ => ("Heartbeat", normalized.display.clone()),
            };
            ComponentStatus {
                component: Component::HbPm,
                label: label.to_string(),
                state: version_state(&normalized.compare, latest.as_deref()),
                display: Some(display),
                latest,
            }
        }
    };

    let messaging = parsed
        .corosync
        .as_deref()
        .map(|version| ("Pcmk/Corosync", version))
        .or_else(|| parsed.openais.as_deref().map(|version| ("Pcmk/AIS", version)));
    let pacemaker = match (parsed.pacemaker.as_deref(), messaging) {
        (Some(pacemaker), Some((label, messaging))) => {
            let latest = latest_for(env, Component::Pm);
            ComponentStatus {
                component: Component::Pm,
                label: label.to_string(),
                state: version_state(pacemaker, latest.as_deref()),
                display: Some(format!("{pacemaker}/{messaging}")),
                latest,
            }
        }
        _ => ComponentStatus::missing(Component::Pm),
    };

    env.flags.set(Component::HbPm, heartbeat.is_present());
    env.flags.set(Component::Pm, pacemaker.is_present());
    [heartbeat, pacemaker]
}

pub(crate) fn evaluate(
    scope: ProbeScope,
    components: &BTreeMap<Component, ComponentStatus>,
    flags: &OutcomeFlags,
) -> ProbeVerdict {
    let cluster_ok = flags.hb_pm_ok || flags.pm_ok;
    let scope_ok = match scope {
        ProbeScope::All => flags.success(),
        ProbeScope::Storage => flags.drbd_ok,
        ProbeScope::ClusterStack => cluster_ok,
    };
    if !scope_ok {
        let mut missing = Vec::new();
        if !flags.drbd_ok && scope != ProbeScope::ClusterStack {
            missing.push(Component::Drbd.label().to_string());
        }
        if !cluster_ok && scope != ProbeScope::Storage {
            missing.push(format!(
                "{} or {}",
                Component::HbPm.label(),
                Component::Pm.label()
            ));
        }
        return ProbeVerdict {
            state: StepState::NeedsInstall,
            policy_failure: Some(format!("not installed: {}", missing.join(", "))),
            next: None,
        };
    }

    let state = if components
        .values()
        .any(|status| status.state == StepState::UpgradeAvailable)
    {
        StepState::UpgradeAvailable
    } else {
        StepState::UpToDate
    };
    let next = if flags.success() {
        Some(StepKind::Confirm)
    } else {
        match scope {
            ProbeScope::Storage => Some(StepKind::probe(ProbeScope::ClusterStack)),
            ProbeScope::ClusterStack => Some(StepKind::probe(ProbeScope::Storage)),
            ProbeScope::All => None,
        }
    };
    ProbeVerdict {
        state,
        policy_failure: None,
        next,
    }
}
