//! warden-agent: fleet-managed endpoint agent supervisor.
//!
//! `run` starts the managed control loop; `watch` is the internal
//! watchdog spawned around upgrades.

mod acker;
mod agent_info;
mod application;
mod backoff;
mod config;
mod dispatcher;
mod emitter;
mod errors;
mod fleet_client;
mod gateway;
mod handlers;
mod lock;
mod logging;
mod paths;
mod queue;
mod reexec;
mod release;
mod router;
mod state_store;
mod status;
#[cfg(test)]
mod test_support;
mod upgrade;
mod util;

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use warden_events::Bus;

use crate::agent_info::AgentInfo;
use crate::application::Managed;
use crate::config::FleetConfig;
use crate::handlers::NoopAppBridge;
use crate::lock::AppLocker;
use crate::reexec::ReexecManager;
use crate::router::LoggingSupervisor;
use crate::status::StatusController;

const TROUBLESHOOT_URL: &str = "https://docs.warden.sh/agent/troubleshooting";

#[derive(Parser)]
#[command(name = "warden-agent", version, about = "Fleet-managed endpoint agent")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent supervisor.
    Run,
    /// Internal: watch a freshly upgraded agent and roll back if it
    /// fails to stabilize.
    #[command(hide = true)]
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run => cmd_run().await,
        Commands::Watch => cmd_watch().await,
    };
    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        eprintln!("For help, see {TROUBLESHOOT_URL}");
        std::process::exit(1);
    }
}

async fn cmd_run() -> anyhow::Result<()> {
    // One supervisor per data directory; losing this race is fatal.
    let mut locker = AppLocker::new(paths::lock_file());
    locker.try_lock().context("acquiring the data directory lock")?;

    let agent_info = AgentInfo::load_or_create(paths::agent_info_file(), "info")
        .context("loading agent info")?;
    logging::init(&agent_info.log_level());
    info!(
        version = release::version(),
        commit = %release::short_commit(),
        agent_id = %agent_info.agent_id(),
        "warden-agent starting"
    );

    // Workers drain their logs here; make sure it exists before any
    // route comes up.
    if let Err(err) = std::fs::create_dir_all(paths::logs()) {
        warn!(path = %paths::logs().display(), %err, "could not create log directory");
    }

    let (allow_unverified, _) = release::allow_unverified();
    if allow_unverified {
        warn!("this build accepts unsigned upgrade artifacts; do not use in production");
    }

    // Re-arm the upgrade watchdog on every boot so a freshly swapped
    // binary is monitored even after a crash-restart cycle.
    if let Err(err) = upgrade::watcher::invoke_watcher() {
        error!(%err, "failed to start the upgrade watcher");
    }

    let bus = Bus::new(256);
    let status = StatusController::new(bus.clone());
    let reexec = Arc::new(ReexecManager::new(reexec::reexec_path()));
    let mut restart_trigger = reexec.take_trigger();

    let cfg = FleetConfig::load(&paths::fleet_config_file()).context("loading fleet config")?;
    let mut app = Managed::new(
        &cfg,
        agent_info,
        reexec.clone(),
        bus,
        status,
        Arc::new(LoggingSupervisor),
        Arc::new(NoopAppBridge),
    )
    .context("assembling managed application")?;
    app.start().await.context("starting managed application")?;

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    let mut reexecing = false;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = sigquit.recv() => {
                info!("SIGQUIT received; shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received; triggering agent restart");
                reexec.trigger();
            }
            _ = restart_trigger.recv() => {
                info!("re-exec requested; restarting agent");
                reexecing = true;
                break;
            }
        }
    }

    if reexecing {
        info!("draining before restart");
    } else {
        info!("shutting down and sending last events");
    }
    app.stop().await;

    if reexecing {
        // The lock must be free for the next image to take it.
        locker.unlock();
        let err = reexec.exec();
        return Err(err).context("re-exec failed");
    }
    info!("shutdown complete");
    Ok(())
}

async fn cmd_watch() -> anyhow::Result<()> {
    logging::init("info");
    upgrade::watcher::run_watch(Bus::new(16))
        .await
        .context("upgrade watch failed")?;
    Ok(())
}
