//! Command-line entrypoint: check or install the HA stack on one host over ssh.

use std::path::PathBuf;
use std::pin::pin;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use hainst_core::{
    select_methods, AutomationPolicy, Cluster, Component, Config, DistInfo, Host, HostId,
    InstallMethod, MethodQuery, RunStop, Session, SessionOptions, SessionOutcome,
    StaticResources, VendorCredentials,
};
use tracing::{info, warn};

mod report;
mod runtime_config;
mod shutdown_signal;
mod ssh_exec;

use crate::runtime_config::{init_tracing, load_config};
use crate::shutdown_signal::shutdown_signal;
use crate::ssh_exec::SshExecutor;

const VENDOR_USER_ENV: &str = "HAINST_VENDOR_USER";
const VENDOR_PASSWORD_ENV: &str = "HAINST_VENDOR_PASSWORD";
const CLUSTER_PASSWORD_ENV: &str = "HAINST_CLUSTER_PASSWORD";
const EXIT_INCOMPLETE: u8 = 2;
const EXIT_CANCELED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remote login user
    #[arg(long, global = true, default_value = Host::DEFAULT_USER)]
    user: String,

    /// Remote ssh port
    #[arg(long, global = true, default_value_t = Host::DEFAULT_PORT)]
    port: u16,

    /// Distribution family; detected on connect when omitted
    #[arg(long, global = true)]
    dist: Option<String>,

    /// Distribution release, e.g. sles10 or 13
    #[arg(long = "dist-version", global = true)]
    dist_version: Option<String>,

    /// Machine architecture, e.g. x86_64
    #[arg(long, global = true)]
    arch: Option<String>,

    /// Add the host to this cluster for the length of the session
    #[arg(long, global = true)]
    cluster: Option<String>,

    /// Offer staging install methods
    #[arg(long, global = true)]
    staging: bool,

    /// Install every missing component with its default method
    #[arg(long, global = true)]
    yes: bool,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report installed versions without changing the host
    Check {
        address: String,
        /// Display name for the host
        #[arg(long)]
        name: Option<String>,
    },
    /// Check the host and install what is missing
    Install {
        address: String,
        /// Display name for the host
        #[arg(long)]
        name: Option<String>,
    },
    /// List install methods offered for a distribution
    Methods {
        /// Distribution release; overrides --dist-version
        #[arg(long = "version")]
        release: Option<String>,
        #[arg(value_enum)]
        component: ComponentArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ComponentArg {
    Drbd,
    Heartbeat,
    Pacemaker,
}

impl From<ComponentArg> for Component {
    fn from(arg: ComponentArg) -> Self {
        match arg {
            ComponentArg::Drbd => Component::Drbd,
            ComponentArg::Heartbeat => Component::HbPm,
            ComponentArg::Pacemaker => Component::Pm,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let mut config = load_config(&args).context("load config")?;
    init_tracing(&config);
    if args.staging {
        config.staging.drbd = true;
        config.staging.pacemaker = true;
    }
    if hainst_core::util::diagnostic_mode() {
        info!("diagnostic logging enabled");
    }

    match &args.command {
        Command::Methods { release, component } => {
            list_methods(&args, &config, release.as_deref(), (*component).into())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { address, name } => {
            run_session(&args, &config, build_host(&args, address, name.as_deref()), false).await
        }
        Command::Install { address, name } => {
            run_session(&args, &config, build_host(&args, address, name.as_deref()), true).await
        }
    }
}

fn build_host(args: &Args, address: &str, name: Option<&str>) -> Host {
    let mut host = Host::new(HostId(1), name.unwrap_or(address), address);
    host.user = args.user.clone();
    host.port = args.port;
    host.dist.dist = args.dist.clone();
    host.dist.version = args.dist_version.clone();
    host.dist.arch = args.arch.clone();
    host
}

fn policy_for(args: &Args, config: &Config, install: bool) -> AutomationPolicy {
    if !install {
        return AutomationPolicy::manual().with_auto_next(true);
    }
    if args.yes {
        return AutomationPolicy::unattended()
            .with_delay(Duration::from_millis(config.automation.delay_ms));
    }
    AutomationPolicy::from_config(&config.automation).with_auto_next(true)
}

fn vendor_credentials() -> Option<VendorCredentials> {
    let user = std::env::var(VENDOR_USER_ENV).ok()?;
    let password = std::env::var(VENDOR_PASSWORD_ENV).unwrap_or_default();
    Some(VendorCredentials::new(user, password))
}

async fn run_session(args: &Args, config: &Config, host: Host, install: bool) -> Result<ExitCode> {
    let executor = SshExecutor::new(config.ssh.clone())?;
    let mut session = Session::new(
        host,
        Arc::new(executor),
        Arc::new(StaticResources::builtin()),
    )
    .with_options(SessionOptions::from_config(config))
    .with_policy(policy_for(args, config, install));
    if let Some(credentials) = vendor_credentials() {
        session = session.with_credentials(credentials);
    }
    if let Some(name) = args.cluster.as_deref() {
        let mut cluster = Cluster::new(name);
        if let Ok(passwd) = std::env::var(CLUSTER_PASSWORD_ENV) {
            cluster = cluster.with_hb_passwd(passwd);
        }
        session.join_cluster(cluster).context("join cluster")?;
    }

    let printer = (!args.json).then(|| {
        let events = session.events();
        tokio::spawn(async move {
            let mut events = pin!(events);
            while let Some(event) = events.next().await {
                println!("{}", report::format_event(&event));
            }
        })
    });

    let stop = tokio::select! {
        stop = session.run() => Some(stop),
        _ = shutdown_signal() => None,
    };
    let stop = match stop {
        Some(stop) => stop,
        None => {
            warn!("interrupted; canceling session");
            session.cancel();
            RunStop::Canceled
        }
    };
    match &stop {
        RunStop::NeedsCredentials(step) => {
            warn!(%step, "vendor repository credentials missing");
            eprintln!(
                "the chosen install method needs vendor credentials; set {VENDOR_USER_ENV} and {VENDOR_PASSWORD_ENV}"
            );
        }
        RunStop::Blocked(err) => warn!(%err, "session blocked"),
        RunStop::AwaitingUser(step) => info!(%step, "session stopped for a decision"),
        RunStop::Finished | RunStop::Canceled => {}
    }

    let report = session.finish();
    if let Some(printer) = printer {
        if let Err(err) = printer.await {
            warn!(%err, "event printer stopped");
        }
    }
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("{}", report::render_summary(&report));
    }

    Ok(match report.outcome {
        SessionOutcome::Succeeded => ExitCode::SUCCESS,
        SessionOutcome::Incomplete => ExitCode::from(EXIT_INCOMPLETE),
        SessionOutcome::Canceled => ExitCode::from(EXIT_CANCELED),
    })
}

fn list_methods(
    args: &Args,
    config: &Config,
    release: Option<&str>,
    component: Component,
) -> Result<()> {
    let dist = args
        .dist
        .clone()
        .ok_or_else(|| anyhow!("--dist is required to list install methods"))?;
    let info = DistInfo {
        dist: Some(dist),
        version: release.map(str::to_string).or_else(|| args.dist_version.clone()),
        arch: args.arch.clone(),
        kernel: None,
    };
    let choice = select_methods(
        &StaticResources::builtin(),
        &MethodQuery {
            component,
            dist: &info,
            staging: config.staging.enabled_for(component),
            remembered: config.remembered.get(component),
        },
    );

    if args.json {
        let default = choice.default_method().map(InstallMethod::index);
        let value = serde_json::json!({
            "component": component,
            "methods": choice.methods,
            "default": default,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&value).context("serialize methods")?
        );
    } else {
        println!("{}", report::render_methods(component, &choice));
    }
    Ok(())
}
