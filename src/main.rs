mod config;
mod disk;
mod ledger;
mod orchestrator;
mod pm2;
mod process;
mod retry;
mod signals;
mod supervisor;
#[cfg(test)]
mod testing;
mod watcher;

use anyhow::Context;
use clap::Parser;
use config::HealthConfig;
use ledger::subtensor::SubtensorConnector;
use pm2::Pm2Cli;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;

/// Liveness monitor for pm2 processes: restarts a process when its log goes
/// quiet or, for subnet participants, when its on-chain updates stall.
#[derive(Parser, Debug)]
#[command(name = "pm2-healthcheck", version, about)]
pub struct Cli {
    /// Only monitor these pm2 process names (default: all)
    #[arg(long = "pm2", value_name = "NAME", num_args = 1..)]
    pm2: Vec<String>,

    /// Warn about partitions fuller than this percentage
    #[arg(long = "disk_limit", value_name = "INT")]
    disk_limit: Option<u8>,

    /// Config file path
    #[arg(short, long, default_value = "healthcheck.toml")]
    config: PathBuf,

    /// Debug logging (watcher reads, ledger queries)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut HealthConfig) {
        if !self.pm2.is_empty() {
            config.monitor.processes = self.pm2.clone();
        }
        if let Some(limit) = self.disk_limit {
            config.disk.limit_percent = limit;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "pm2_healthcheck=debug"
    } else {
        "pm2_healthcheck=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::info!("pm2-healthcheck v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = HealthConfig::load(&cli.config)?;
    cli.apply(&mut config);
    tracing::debug!(?config, "resolved configuration");

    let directory = Arc::new(Pm2Cli::new(config.pm2.command.clone()));
    let connector = Arc::new(SubtensorConnector::new(config.chain.request_timeout()));
    let mut supervisor = Supervisor::start(&config, directory, connector)
        .await
        .context("failed to start monitor")?;
    tracing::info!(
        monitored = ?supervisor.monitored(),
        disk_warnings = supervisor.disk_warnings().len(),
        "monitor running"
    );

    let exited = tokio::select! {
        signal = signals::wait_for_shutdown() => {
            signal.context("failed to install signal handlers")?;
            None
        }
        exited = supervisor.task_exited() => Some(exited),
    };
    supervisor.stop().await;

    if let Some(exited) = exited {
        exited.context("monitor task failed")?;
        anyhow::bail!("monitor task exited unexpectedly");
    }
    Ok(())
}
