//! agent-supervisor: keeps monitoring agents running.
//!
//! Loads the supervisor configuration and the desired agents, applies them,
//! and stops every agent on Ctrl-C or SIGTERM.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agent_supervisor::config::{load_config, load_desired_state};
use agent_supervisor::watch::spawn_state_watcher;
use agent_supervisor::{Config, StateChange, Supervisor};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "agent-supervisor",
    version,
    about = "Runs and supervises monitoring agent processes",
    styles = help_styles()
)]
struct Cli {
    /// Path to the supervisor configuration file; defaults are used without it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path to the desired-state file.
    #[arg(long)]
    state: PathBuf,
    /// Re-apply the desired state whenever the file changes.
    #[arg(long)]
    watch: bool,
    /// Quiet period before a state file change is applied.
    #[arg(long, default_value_t = 500)]
    watch_debounce_ms: u64,
    /// Interval between status reports (0 disables them).
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,
    /// Log filter, overrides RUST_LOG (e.g. "debug").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let desired = load_desired_state(&cli.state)?;

    let supervisor = Arc::new(Supervisor::new(&config));
    spawn_change_logger(supervisor.subscribe());
    let plan = supervisor.set_state(desired).await;
    info!(
        started = plan.to_start.len(),
        "Applied desired state from {}.",
        cli.state.display()
    );

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let mut reload_rx = Some(reload_rx);
    let mut watching = cli.watch;
    if watching {
        spawn_state_watcher(
            cli.state.clone(),
            Duration::from_millis(cli.watch_debounce_ms),
            reload_tx,
        );
    } else {
        drop(reload_tx);
    }

    let report_status = cli.status_interval_secs > 0;
    let mut status_ticker =
        tokio::time::interval(Duration::from_secs(cli.status_interval_secs.max(1)));
    // the first tick completes immediately
    status_ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!("Got {}, stopping agents.", signal);
                break;
            }
            reload = next_reload(&mut reload_rx), if watching => match reload {
                Some(()) => reload_state(&supervisor, &cli.state).await,
                None => {
                    warn!("State file watcher stopped.");
                    watching = false;
                }
            },
            _ = status_ticker.tick(), if report_status => log_status(&supervisor).await,
        }
    }

    supervisor.stop_all().await;
    Ok(())
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {:?}", level))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn spawn_change_logger(mut changes: broadcast::Receiver<StateChange>) {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(
                    agent_id = %change.agent_id,
                    listen_port = ?change.listen_port,
                    version = ?change.version,
                    "Agent {} is {}.",
                    change.process_exec_path.display(),
                    change.status
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} state changes.", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn next_reload(rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// A broken state file keeps the agents as they are.
async fn reload_state(supervisor: &Supervisor, path: &Path) {
    let desired = match load_desired_state(path) {
        Ok(desired) => desired,
        Err(err) => {
            error!("Failed to reload desired state: {:#}.", err);
            return;
        }
    };
    let plan = supervisor.set_state(desired).await;
    if !plan.is_empty() {
        info!(
            started = plan.to_start.len(),
            restarted = plan.to_restart.len(),
            stopped = plan.to_stop.len(),
            "Reloaded desired state."
        );
    }
}

async fn log_status(supervisor: &Supervisor) {
    let status: BTreeMap<String, String> = supervisor.status().await.into_iter().collect();
    match serde_json::to_string(&status) {
        Ok(json) => info!(status = %json, "Status."),
        Err(err) => warn!("Failed to encode status: {}.", err),
    }
}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}.", err);
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli() {
        let cli = Cli::try_parse_from([
            "agent-supervisor",
            "--config",
            "/etc/agent-supervisor.toml",
            "--state",
            "state.toml",
            "--watch",
            "--status-interval-secs",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/agent-supervisor.toml")));
        assert_eq!(cli.state, PathBuf::from("state.toml"));
        assert!(cli.watch);
        assert_eq!(cli.watch_debounce_ms, 500);
        assert_eq!(cli.status_interval_secs, 0);
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn state_is_required() {
        assert!(Cli::try_parse_from(["agent-supervisor"]).is_err());
    }
}
