/// Startup and shutdown of the monitoring session.
///
/// Startup: disk snapshot, process discovery, one log watcher per process,
/// then the orchestrator. Shutdown cancels every task and joins them.
use crate::config::HealthConfig;
use crate::disk::check_disk_space;
use crate::ledger::{AccountId, LedgerConnector, LedgerError};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::pm2::{filter_processes, ProcessManager};
use crate::watcher::LogWatcher;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    disk_warnings: Vec<String>,
    monitored: Vec<String>,
}

impl Supervisor {
    /// Discover processes and spawn all watcher and orchestrator tasks.
    ///
    /// A log that cannot be opened excludes only that process. The only
    /// startup error is an invalid configured hotkey address.
    pub async fn start(
        config: &HealthConfig,
        directory: Arc<dyn ProcessManager>,
        connector: Arc<dyn LedgerConnector>,
    ) -> Result<Self, LedgerError> {
        let hotkey_override = config
            .chain
            .hotkey_address
            .as_deref()
            .map(AccountId::from_ss58)
            .transpose()?;

        let disk_warnings = check_disk_space(config.disk.limit_percent, config.disk.min_partition_gb);
        if disk_warnings.is_empty() {
            tracing::info!(limit_percent = config.disk.limit_percent, "disk usage ok");
        }
        for warning in &disk_warnings {
            tracing::warn!("{warning}");
        }

        tracing::info!("listing pm2 processes");
        let processes = filter_processes(directory.list().await, &config.monitor.processes);

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut watchers = Vec::with_capacity(processes.len());

        for process in processes {
            let name = process.name.clone();
            if !process.is_online() {
                tracing::warn!(process = %name, status = %process.status, "process is not online");
            }
            match LogWatcher::open(process, Arc::clone(&directory), config.watcher.poll_interval())
                .await
            {
                Ok((watcher, follower)) => {
                    tasks.spawn(follower.run(cancel.child_token()));
                    watchers.push(watcher);
                }
                Err(e) => {
                    tracing::error!(process = %name, error = %e, "cannot monitor process");
                }
            }
        }

        if watchers.is_empty() {
            tracing::warn!("no processes to monitor");
        }
        let monitored = watchers.iter().map(|w| w.name().to_string()).collect();

        let settings = OrchestratorSettings::from_config(config, hotkey_override);
        let orchestrator = Orchestrator::new(watchers, connector, settings);
        tasks.spawn(orchestrator.run(cancel.child_token()));

        Ok(Self {
            cancel,
            tasks,
            disk_warnings,
            monitored,
        })
    }

    /// Warnings captured by the startup disk probe.
    pub fn disk_warnings(&self) -> &[String] {
        &self.disk_warnings
    }

    /// Names of processes with a running watcher, in discovery order.
    pub fn monitored(&self) -> &[String] {
        &self.monitored
    }

    /// Resolve when a monitor task exits before `stop`.
    ///
    /// Followers and the orchestrator only return once cancelled, so any
    /// earlier exit means a task died.
    pub async fn task_exited(&mut self) -> Result<(), JoinError> {
        match self.tasks.join_next().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    /// Signal every task to exit and wait for all of them.
    pub async fn stop(mut self) {
        tracing::info!("stopping monitor");
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "monitor task failed");
            }
        }
    }
}
