/// Health orchestrator: the periodic control loop.
///
/// Every cycle evaluates each watched process in discovery order. A process
/// is restarted when its log has been quiet longer than the stale timeout, and
/// separately when it participates in a subnet and neither its on-chain
/// update nor its last chain-triggered restart is within the block threshold.
/// Failures while evaluating one process never stop the sweep.
use crate::config::HealthConfig;
use crate::ledger::{
    connect_with_retry, default_wallet_dir, hotkey_from_wallet, is_registered, resolve_endpoint,
    AccountId, Ledger, LedgerConnector, LedgerError, Registration,
};
use crate::retry::Backoff;
use crate::watcher::LogWatcher;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a single check decided for a process this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    NoAction,
    LogStale,
    ChainStale,
}

/// Both checks' outcome for one process in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub process: String,
    pub log: RestartDecision,
    pub chain: RestartDecision,
}

impl Evaluation {
    pub fn restarted(&self) -> bool {
        self.log != RestartDecision::NoAction || self.chain != RestartDecision::NoAction
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub interval: Duration,
    pub stale_timeout: Duration,
    pub block_threshold: u64,
    pub connect_backoff: Backoff,
    pub default_network: String,
    /// Hotkey looked up on every subnet instead of the process's wallet.
    pub hotkey_override: Option<AccountId>,
    pub wallet_dir: PathBuf,
}

impl OrchestratorSettings {
    pub fn from_config(config: &HealthConfig, hotkey_override: Option<AccountId>) -> Self {
        Self {
            interval: config.monitor.interval(),
            stale_timeout: config.monitor.stale_timeout(),
            block_threshold: config.chain.block_threshold,
            connect_backoff: Backoff::new(
                config.chain.connect_attempts,
                Duration::from_secs(config.chain.connect_initial_delay_secs),
            ),
            default_network: config.chain.default_network.clone(),
            hotkey_override,
            wallet_dir: default_wallet_dir(),
        }
    }
}

/// Log staleness check.
pub fn log_decision(
    last_line_at: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_timeout: Duration,
) -> RestartDecision {
    let delta = (now - last_line_at).to_std().unwrap_or(Duration::ZERO);
    if delta > stale_timeout {
        RestartDecision::LogStale
    } else {
        RestartDecision::NoAction
    }
}

/// Chain staleness check. No previous restart counts as infinitely long ago.
pub fn chain_decision(
    current_block: u64,
    last_update: u64,
    last_restart_block: Option<u64>,
    threshold: u64,
) -> RestartDecision {
    let since_update = current_block.saturating_sub(last_update);
    let since_restart = last_restart_block.map_or(u64::MAX, |b| current_block.saturating_sub(b));
    if since_update >= threshold && since_restart >= threshold {
        RestartDecision::ChainStale
    } else {
        RestartDecision::NoAction
    }
}

pub struct Orchestrator {
    watchers: Vec<LogWatcher>,
    connector: Arc<dyn LedgerConnector>,
    settings: OrchestratorSettings,
    last_restart_block: HashMap<String, u64>,
}

impl Orchestrator {
    pub fn new(
        watchers: Vec<LogWatcher>,
        connector: Arc<dyn LedgerConnector>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            watchers,
            connector,
            settings,
            last_restart_block: HashMap::new(),
        }
    }

    /// Loop until cancelled. Cycles never overlap.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            processes = self.watchers.len(),
            interval_secs = self.settings.interval.as_secs(),
            stale_timeout_secs = self.settings.stale_timeout.as_secs(),
            "orchestrator started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                evaluations = self.evaluate_cycle(Utc::now()) => {
                    let restarted = evaluations.iter().filter(|e| e.restarted()).count();
                    tracing::info!(processes = evaluations.len(), restarted, "cycle complete");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        tracing::info!("orchestrator stopped");
    }

    /// Evaluate every process once, issuing restarts as needed.
    pub async fn evaluate_cycle(&mut self, now: DateTime<Utc>) -> Vec<Evaluation> {
        tracing::info!("monitoring processes");
        // Connections are per cycle; None marks an endpoint that failed this cycle.
        let mut ledgers: HashMap<String, Option<Arc<dyn Ledger>>> = HashMap::new();
        let mut evaluations = Vec::with_capacity(self.watchers.len());

        for index in 0..self.watchers.len() {
            let watcher = &self.watchers[index];
            let name = watcher.name().to_string();

            if !watcher.is_alive() {
                tracing::warn!(process = %name, "log watcher not running, skipping");
                evaluations.push(Evaluation {
                    process: name,
                    log: RestartDecision::NoAction,
                    chain: RestartDecision::NoAction,
                });
                continue;
            }

            let log = self.check_log(index, now).await;
            let chain = self.check_chain(index, &mut ledgers).await;
            evaluations.push(Evaluation {
                process: name,
                log,
                chain,
            });
        }
        evaluations
    }

    async fn check_log(&self, index: usize, now: DateTime<Utc>) -> RestartDecision {
        let watcher = &self.watchers[index];
        let stats = watcher.stats();
        let delta_secs = (now - stats.last_line_at).num_seconds();
        let decision = log_decision(stats.last_line_at, now, self.settings.stale_timeout);
        if let Ok(json) = stats.to_json() {
            tracing::debug!(stats = %json, "watcher stats");
        }

        if decision == RestartDecision::LogStale {
            tracing::warn!(
                process = %stats.process.name,
                last_line_secs_ago = delta_secs,
                "no log output, restarting"
            );
            watcher.restart().await;
        } else {
            tracing::info!(
                process = %stats.process.name,
                last_line_secs_ago = delta_secs,
                "process ok"
            );
        }
        decision
    }

    async fn check_chain(
        &mut self,
        index: usize,
        ledgers: &mut HashMap<String, Option<Arc<dyn Ledger>>>,
    ) -> RestartDecision {
        let process = self.watchers[index].process();
        let Some(netuid) = process.subnet() else {
            return RestartDecision::NoAction;
        };
        let name = process.name.clone();

        let hotkey = match self.monitored_hotkey(index) {
            Ok(hotkey) => hotkey,
            Err(e) => {
                tracing::warn!(process = %name, netuid, error = %e, "cannot resolve hotkey, skipping chain check");
                return RestartDecision::NoAction;
            }
        };

        let endpoint = resolve_endpoint(
            &process.subtensor_network,
            &process.chain_endpoint,
            &self.settings.default_network,
        );
        let ledger = match ledgers.get(&endpoint) {
            Some(cached) => cached.clone(),
            None => {
                let connected = match connect_with_retry(
                    self.connector.as_ref(),
                    &endpoint,
                    &self.settings.connect_backoff,
                )
                .await
                {
                    Ok(ledger) => Some(ledger),
                    Err(e) => {
                        tracing::error!(endpoint = %endpoint, error = %e, "ledger unreachable, skipping chain checks this cycle");
                        None
                    }
                };
                ledgers.insert(endpoint.clone(), connected.clone());
                connected
            }
        };
        let Some(ledger) = ledger else {
            return RestartDecision::NoAction;
        };

        match self.evaluate_chain(ledger.as_ref(), index, netuid, &hotkey).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(process = %name, netuid, error = %e, "chain check failed");
                RestartDecision::NoAction
            }
        }
    }

    async fn evaluate_chain(
        &mut self,
        ledger: &dyn Ledger,
        index: usize,
        netuid: u16,
        hotkey: &AccountId,
    ) -> Result<RestartDecision, LedgerError> {
        let name = self.watchers[index].name().to_string();
        let metagraph = ledger.metagraph(netuid).await?;
        let current_block = ledger.current_block().await?;

        let uid = match is_registered(&metagraph, hotkey) {
            Registration::Registered { uid } => uid,
            Registration::NotRegistered => {
                tracing::info!(process = %name, netuid, hotkey = %hotkey, "hotkey not registered, skipping chain check");
                return Ok(RestartDecision::NoAction);
            }
        };
        let last_update = metagraph.last_update_of(uid).ok_or_else(|| {
            LedgerError::Decode(format!("no last_update entry for uid {uid}"))
        })?;

        let last_restart = self.last_restart_block.get(&name).copied();
        let decision = chain_decision(
            current_block,
            last_update,
            last_restart,
            self.settings.block_threshold,
        );
        let since_update = current_block.saturating_sub(last_update);

        if decision == RestartDecision::ChainStale {
            tracing::warn!(
                process = %name,
                netuid,
                uid,
                blocks_since_update = since_update,
                "no on-chain update, restarting"
            );
            self.watchers[index].restart().await;
            self.last_restart_block.insert(name, current_block);
        } else {
            tracing::info!(
                process = %name,
                netuid,
                uid,
                blocks_since_update = since_update,
                blocks_since_restart = ?last_restart.map(|b| current_block.saturating_sub(b)),
                "chain ok"
            );
        }
        Ok(decision)
    }

    fn monitored_hotkey(&self, index: usize) -> Result<AccountId, LedgerError> {
        if let Some(hotkey) = self.settings.hotkey_override {
            return Ok(hotkey);
        }
        let process = self.watchers[index].process();
        if process.coldkey_name.is_empty() || process.hotkey_name.is_empty() {
            return Err(LedgerError::Decode(
                "process has no --wallet.name/--wallet.hotkey".to_string(),
            ));
        }
        let wallet_dir = if process.wallet_path.is_empty() {
            self.settings.wallet_dir.clone()
        } else {
            expand_home(&process.wallet_path)
        };
        hotkey_from_wallet(&wallet_dir, &process.coldkey_name, &process.hotkey_name)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm2::ProcessManager;
    use crate::process::ManagedProcess;
    use crate::testing::{managed_process, FakeConnector, FakeLedger, FakeProcessManager};
    use crate::watcher::ActivityState;
    use std::sync::atomic::Ordering;

    const HOTKEY: AccountId = AccountId([7; 32]);
    const OTHER: AccountId = AccountId([8; 32]);

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            interval: Duration::from_secs(150),
            stale_timeout: Duration::from_secs(15 * 60),
            block_threshold: 500,
            connect_backoff: Backoff::new(3, Duration::ZERO),
            default_network: "finney".to_string(),
            hotkey_override: Some(HOTKEY),
            wallet_dir: PathBuf::from("/nonexistent"),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn watcher(
        process: ManagedProcess,
        minutes_ago: i64,
        directory: &Arc<FakeProcessManager>,
    ) -> LogWatcher {
        let state = Arc::new(ActivityState::new(now() - chrono::Duration::minutes(minutes_ago)));
        state.set_alive(true);
        let directory: Arc<dyn ProcessManager> = directory.clone();
        LogWatcher::with_state(process, state, directory)
    }

    fn subnet_process(name: &str, netuid: i64) -> ManagedProcess {
        let mut process = managed_process(name);
        process.netuid = netuid;
        process
    }

    #[test]
    fn test_log_decision_threshold() {
        let timeout = Duration::from_secs(900);
        let at = now() - chrono::Duration::minutes(20);
        assert_eq!(log_decision(at, now(), timeout), RestartDecision::LogStale);

        let at = now() - chrono::Duration::minutes(15);
        assert_eq!(log_decision(at, now(), timeout), RestartDecision::NoAction);

        // Clock skew: a future timestamp is never stale.
        let at = now() + chrono::Duration::minutes(5);
        assert_eq!(log_decision(at, now(), timeout), RestartDecision::NoAction);
    }

    #[test]
    fn test_chain_decision() {
        assert_eq!(chain_decision(1000, 400, None, 500), RestartDecision::ChainStale);
        assert_eq!(chain_decision(1000, 500, None, 500), RestartDecision::ChainStale);
        assert_eq!(chain_decision(1000, 501, None, 500), RestartDecision::NoAction);
        assert_eq!(chain_decision(1000, 0, Some(900), 500), RestartDecision::NoAction);
        assert_eq!(chain_decision(1000, 0, Some(500), 500), RestartDecision::ChainStale);
        // Last update ahead of the head we read.
        assert_eq!(chain_decision(1000, 1200, None, 500), RestartDecision::NoAction);
    }

    #[tokio::test]
    async fn test_stale_log_restarts_exactly_once() {
        let directory = Arc::new(FakeProcessManager::default());
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeLedger::new(0))));
        let mut orchestrator = Orchestrator::new(
            vec![
                watcher(managed_process("miner-A"), 20, &directory),
                watcher(managed_process("miner-B"), 2, &directory),
            ],
            connector.clone(),
            settings(),
        );

        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(directory.restarts(), vec!["miner-A".to_string()]);
        assert_eq!(evaluations[0].log, RestartDecision::LogStale);
        assert_eq!(evaluations[1].log, RestartDecision::NoAction);
        assert!(evaluations[0].restarted());
        assert!(!evaluations[1].restarted());
        // No subnet processes, so no ledger traffic.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_log_restarts_every_cycle() {
        let directory = Arc::new(FakeProcessManager::default());
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeLedger::new(0))));
        let mut orchestrator = Orchestrator::new(
            vec![watcher(managed_process("miner-A"), 20, &directory)],
            connector,
            settings(),
        );

        orchestrator.evaluate_cycle(now()).await;
        orchestrator
            .evaluate_cycle(now() + chrono::Duration::seconds(150))
            .await;
        assert_eq!(directory.restarts(), vec!["miner-A", "miner-A"]);
    }

    #[tokio::test]
    async fn test_dead_watcher_never_restarted() {
        let directory = Arc::new(FakeProcessManager::default());
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeLedger::new(0))));
        // Never marked alive: the follower has not started.
        let state = Arc::new(ActivityState::new(now() - chrono::Duration::minutes(60)));
        let dead = LogWatcher::with_state(managed_process("miner-A"), state, directory.clone());

        let mut orchestrator = Orchestrator::new(vec![dead], connector, settings());
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert!(directory.restarts().is_empty());
        assert!(!evaluations[0].restarted());
    }

    #[tokio::test]
    async fn test_chain_stale_restarts_and_debounces() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(10_000));
        ledger.set_subnet(14, vec![OTHER, HOTKEY], vec![9_990, 9_000]);
        let connector = Arc::new(FakeConnector::new(ledger.clone()));

        let mut orchestrator = Orchestrator::new(
            vec![watcher(subnet_process("miner-A", 14), 1, &directory)],
            connector,
            settings(),
        );

        let first = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(first[0].log, RestartDecision::NoAction);
        assert_eq!(first[0].chain, RestartDecision::ChainStale);
        assert_eq!(directory.restarts(), vec!["miner-A"]);

        // Same block and a few blocks later: debounced.
        orchestrator.evaluate_cycle(now()).await;
        ledger.set_block(10_012);
        let second = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(second[0].chain, RestartDecision::NoAction);
        assert_eq!(directory.restarts().len(), 1);

        // Threshold reached again since the last restart.
        ledger.set_block(10_500);
        let third = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(third[0].chain, RestartDecision::ChainStale);
        assert_eq!(directory.restarts().len(), 2);
    }

    #[tokio::test]
    async fn test_recent_chain_update_is_ok() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(10_000));
        ledger.set_subnet(14, vec![HOTKEY], vec![9_800]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut orchestrator = Orchestrator::new(
            vec![watcher(subnet_process("miner-A", 14), 1, &directory)],
            connector,
            settings(),
        );
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(evaluations[0].chain, RestartDecision::NoAction);
        assert!(directory.restarts().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_never_chain_restarted() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(100_000));
        ledger.set_subnet(14, vec![OTHER], vec![0]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut orchestrator = Orchestrator::new(
            vec![watcher(subnet_process("miner-A", 14), 1, &directory)],
            connector,
            settings(),
        );
        for _ in 0..3 {
            let evaluations = orchestrator.evaluate_cycle(now()).await;
            assert_eq!(evaluations[0].chain, RestartDecision::NoAction);
        }
        assert!(directory.restarts().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_unreachable_skips_chain_but_not_log() {
        let directory = Arc::new(FakeProcessManager::default());
        let connector = Arc::new(FakeConnector::failing());

        let mut orchestrator = Orchestrator::new(
            vec![
                watcher(subnet_process("miner-A", 14), 30, &directory),
                watcher(subnet_process("miner-B", 14), 1, &directory),
            ],
            connector.clone(),
            settings(),
        );
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(evaluations[0].log, RestartDecision::LogStale);
        assert_eq!(evaluations[0].chain, RestartDecision::NoAction);
        assert_eq!(evaluations[1].chain, RestartDecision::NoAction);
        assert_eq!(directory.restarts(), vec!["miner-A"]);
        // One endpoint, three attempts, not retried for the second process.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connection_reused_within_cycle_and_recreated_next_cycle() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(1_000));
        ledger.set_subnet(14, vec![HOTKEY], vec![990]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut orchestrator = Orchestrator::new(
            vec![
                watcher(subnet_process("miner-A", 14), 1, &directory),
                watcher(subnet_process("miner-B", 14), 1, &directory),
            ],
            connector.clone(),
            settings(),
        );
        orchestrator.evaluate_cycle(now()).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        orchestrator.evaluate_cycle(now()).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_metagraph_failure_is_isolated() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(10_000));
        // Subnet 14 is known, subnet 15 is not.
        ledger.set_subnet(14, vec![HOTKEY], vec![0]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut orchestrator = Orchestrator::new(
            vec![
                watcher(subnet_process("broken", 15), 1, &directory),
                watcher(subnet_process("miner-A", 14), 1, &directory),
            ],
            connector,
            settings(),
        );
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(evaluations[0].chain, RestartDecision::NoAction);
        assert_eq!(evaluations[1].chain, RestartDecision::ChainStale);
        assert_eq!(directory.restarts(), vec!["miner-A"]);
    }

    #[tokio::test]
    async fn test_log_and_chain_can_both_fire() {
        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(10_000));
        ledger.set_subnet(14, vec![HOTKEY], vec![0]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut orchestrator = Orchestrator::new(
            vec![watcher(subnet_process("miner-A", 14), 20, &directory)],
            connector,
            settings(),
        );
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(evaluations[0].log, RestartDecision::LogStale);
        assert_eq!(evaluations[0].chain, RestartDecision::ChainStale);
        assert_eq!(directory.restarts(), vec!["miner-A", "miner-A"]);
    }

    #[tokio::test]
    async fn test_hotkey_from_wallet_files() {
        let wallets = tempfile::tempdir().unwrap();
        let hotkeys = wallets.path().join("cold1").join("hotkeys");
        std::fs::create_dir_all(&hotkeys).unwrap();
        std::fs::write(
            hotkeys.join("hot1"),
            format!(r#"{{"ss58Address": "{}"}}"#, HOTKEY.to_ss58()),
        )
        .unwrap();

        let directory = Arc::new(FakeProcessManager::default());
        let ledger = Arc::new(FakeLedger::new(10_000));
        ledger.set_subnet(14, vec![OTHER, HOTKEY], vec![0, 0]);
        let connector = Arc::new(FakeConnector::new(ledger));

        let mut process = subnet_process("miner-A", 14);
        process.coldkey_name = "cold1".to_string();
        process.hotkey_name = "hot1".to_string();
        let mut no_wallet = subnet_process("miner-B", 14);
        no_wallet.coldkey_name = "cold1".to_string();

        let mut settings = settings();
        settings.hotkey_override = None;
        settings.wallet_dir = wallets.path().to_path_buf();

        let mut orchestrator = Orchestrator::new(
            vec![
                watcher(process, 1, &directory),
                watcher(no_wallet, 1, &directory),
            ],
            connector,
            settings,
        );
        let evaluations = orchestrator.evaluate_cycle(now()).await;
        assert_eq!(evaluations[0].chain, RestartDecision::ChainStale);
        assert_eq!(evaluations[1].chain, RestartDecision::NoAction);
        assert_eq!(directory.restarts(), vec!["miner-A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let directory = Arc::new(FakeProcessManager::default());
        let connector = Arc::new(FakeConnector::new(Arc::new(FakeLedger::new(0))));
        let orchestrator = Orchestrator::new(
            vec![watcher(managed_process("miner-A"), 0, &directory)],
            connector,
            settings(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(orchestrator.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(400)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(!directory.restarts().is_empty());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/wallets"), PathBuf::from("/srv/wallets"));
        assert!(expand_home("~/wallets").ends_with("wallets"));
    }
}
