//! Formatting helpers for session progress and summaries.

use std::collections::BTreeMap;

use hainst_core::util::tail_lines;
use hainst_core::{
    Component, ComponentStatus, InstallMethod, MethodChoice, SessionEvent, SessionOutcome,
    SessionReport, StepKind, StepSummary,
};

const FAILURE_TAIL_LINES: usize = 5;

/// One progress line per event; remote output is indented under its step.
pub fn format_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StepStarted { step, kind } => format!("==> [{step}] {kind}"),
        SessionEvent::StepCompleted { step, state } => format!("    [{step}] {state}"),
        SessionEvent::StepFailed { step, reason } => format!("!!  [{step}] {reason}"),
        SessionEvent::LogLine { line, .. } => format!("    | {line}"),
        SessionEvent::Finished { success: true } => "==> finished".to_string(),
        SessionEvent::Finished { success: false } => {
            "==> finished with missing components".to_string()
        }
        SessionEvent::Canceled => "==> canceled".to_string(),
    }
}

pub fn format_outcome(outcome: SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Succeeded => "ready",
        SessionOutcome::Incomplete => "incomplete",
        SessionOutcome::Canceled => "canceled",
    }
}

fn format_dist(report: &SessionReport) -> String {
    let dist = &report.host.dist;
    let parts: Vec<&str> = [&dist.dist, &dist.version, &dist.arch, &dist.kernel]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .collect();
    if parts.is_empty() {
        "unknown".to_string()
    } else {
        parts.join(" ")
    }
}

fn probe_steps(report: &SessionReport) -> impl Iterator<Item = &StepSummary> {
    report
        .steps
        .iter()
        .rev()
        .filter(|step| matches!(step.kind, StepKind::Probe { .. }) && !step.components.is_empty())
}

/// Latest known status per component; a narrower re-check keeps the
/// components it did not cover from earlier checks.
fn component_statuses(report: &SessionReport) -> BTreeMap<Component, &ComponentStatus> {
    let mut statuses = BTreeMap::new();
    for step in probe_steps(report) {
        for status in &step.components {
            statuses.entry(status.component).or_insert(status);
        }
    }
    statuses
}

/// Plain-text summary printed when a session ends.
pub fn render_summary(report: &SessionReport) -> String {
    let mut lines = vec![
        format!(
            "host {} ({}): {}",
            report.host.name,
            report.host.primary_address().unwrap_or("no address"),
            format_outcome(report.outcome)
        ),
        format!("  distribution: {}", format_dist(report)),
    ];
    if let Some(cluster) = report.host.cluster.as_deref() {
        lines.push(format!("  cluster: {cluster}"));
    }

    for status in component_statuses(report).into_values() {
        let mut line = format!(
            "  {:<16} {}",
            status.label,
            status.display.as_deref().unwrap_or("-")
        );
        line.push_str(&format!("  {}", status.state));
        if let Some(latest) = status.latest.as_deref() {
            line.push_str(&format!(" (latest {latest})"));
        }
        lines.push(line);
    }

    let failures = report
        .steps
        .iter()
        .filter_map(|step| step.failure.as_ref().map(|failure| (step.kind, failure)));
    for (kind, failure) in failures {
        lines.push(format!("  {kind} failed: {}", failure.reason));
        for line in tail_lines(&failure.output, FAILURE_TAIL_LINES) {
            lines.push(format!("    | {line}"));
        }
    }
    if let Some(reason) = probe_steps(report).next().and_then(|step| step.policy_failure.as_deref()) {
        lines.push(format!("  {reason}"));
    }
    lines.join("\n")
}

fn format_method(method: &InstallMethod, default: Option<usize>) -> String {
    let mut line = format!("  [{}] {} ({})", method.index(), method.label(), method.kind().tag());
    if method.is_staging() {
        line.push_str(" staging");
    }
    if default == Some(method.index()) {
        line.push_str(" *default");
    }
    line
}

/// Listing for `hainst methods`.
pub fn render_methods(component: Component, choice: &MethodChoice) -> String {
    if choice.is_empty() {
        return format!("{component}: no install methods for this distribution");
    }
    let default = choice.default_method().map(InstallMethod::index);
    let mut lines = vec![format!("{component}:")];
    lines.extend(
        choice
            .methods
            .iter()
            .map(|method| format_method(method, default)),
    );
    lines.join("\n")
}
