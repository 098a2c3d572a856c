//! CLI host for the Alex worker bridge.
//!
//! Runs the supervisor headless: the assistant surface is a logging stub and
//! host services answer that their capabilities are unavailable. Desktop
//! shells embed the library instead and supply real implementations.

use alex::control::{LoggingSurface, NoopHostServices, UiLoop};
use alex::worker::{DependencyProvisioner, discover_python};
use alex::{BridgeConfig, LoggingObserver, ShutdownOutcome, Supervisor};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Alex: supervise the assistant's Python worker.
#[derive(Parser)]
#[command(name = "alex-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the worker backend directory.
    #[arg(long)]
    backend_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker and serve until Ctrl-C.
    Run,

    /// Install the worker's packages and exit.
    Provision,

    /// Print the effective configuration as TOML.
    PrintConfig,
}

fn load_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let path = cli.config.clone().unwrap_or_else(BridgeConfig::default_config_path);
    let mut config = BridgeConfig::load_or_default(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    if let Some(dir) = &cli.backend_dir {
        config.worker.backend_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if matches!(cli.command, Some(Command::PrintConfig)) {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    alex::alex_dirs::ensure_dirs().context("creating data directories")?;
    let _log_guard = alex::logging::init(&config.logging)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Provision => provision(config).await,
        Command::PrintConfig => Ok(()),
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let (ui, ui_task) = UiLoop::spawn(LoggingSurface);
    let supervisor = Supervisor::new(config, Arc::new(NoopHostServices), ui)?;

    tracing::info!("alex-host starting");
    let started = tokio::select! {
        result = supervisor.start(&LoggingObserver) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let exit = match started {
        Some(Ok(report)) => {
            tracing::info!(worker_pid = ?report.worker_pid, "serving, press Ctrl-C to stop");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C, shutting down");
            }
            Ok(())
        }
        Some(Err(e)) => Err(anyhow::anyhow!("startup failed: {e}")),
        None => {
            tracing::info!("interrupted during startup");
            Ok(())
        }
    };

    if let ShutdownOutcome::Completed(report) = supervisor.shutdown().await {
        for failure in report.failures() {
            tracing::warn!(step = %failure.step, outcome = ?failure.outcome, "shutdown step did not complete");
        }
    }
    drop(supervisor);
    ui_task.abort();
    tracing::info!("alex-host shut down");
    exit
}

async fn provision(config: BridgeConfig) -> anyhow::Result<()> {
    let worker = &config.worker;
    let python = discover_python(worker.python.as_deref(), &worker.backend_dir)?;
    let provisioner = DependencyProvisioner::new(python, worker.backend_dir.clone(), config.provisioning.clone());
    let manifest = worker.backend_dir.join(&config.provisioning.manifest);
    let report = provisioner
        .ensure_installed(&manifest, &worker.site_packages_dir())
        .await?;
    for warning in report.warnings() {
        tracing::warn!("{warning}");
    }
    if report.already_installed() {
        println!("dependencies already installed");
    } else {
        println!("dependencies installed");
    }
    Ok(())
}
