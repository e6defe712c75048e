//! Fakes for the external collaborators, shared by unit tests.

use crate::ledger::{AccountId, Ledger, LedgerConnector, LedgerError, Metagraph};
use crate::pm2::ProcessManager;
use crate::process::{ManagedProcess, NO_SUBNET};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub fn managed_process(name: &str) -> ManagedProcess {
    ManagedProcess {
        name: name.to_string(),
        interpreter: Some("python3".to_string()),
        args: Vec::new(),
        out_log_path: PathBuf::from(format!("/tmp/{name}-out.log")),
        err_log_path: PathBuf::from(format!("/tmp/{name}-error.log")),
        status: "online".to_string(),
        pm2_home: None,
        venv: None,
        pwd: None,
        git_revision: "N/A".to_string(),
        git_comment: "N/A".to_string(),
        git_branch: "N/A".to_string(),
        git_repo_path: "N/A".to_string(),
        netuid: NO_SUBNET,
        subtensor_network: String::new(),
        chain_endpoint: String::new(),
        coldkey_name: String::new(),
        hotkey_name: String::new(),
        wallet_path: String::new(),
    }
}

/// Process manager that records restarts instead of running pm2.
#[derive(Default)]
pub struct FakeProcessManager {
    pub processes: Mutex<Vec<ManagedProcess>>,
    pub restarts: Mutex<Vec<String>>,
}

impl FakeProcessManager {
    pub fn with_processes(processes: Vec<ManagedProcess>) -> Self {
        Self {
            processes: Mutex::new(processes),
            restarts: Mutex::new(Vec::new()),
        }
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn list(&self) -> Vec<ManagedProcess> {
        self.processes.lock().unwrap().clone()
    }

    async fn restart(&self, name: &str) {
        self.restarts.lock().unwrap().push(name.to_string());
    }
}

/// Ledger with a settable block height and fixed metagraphs.
#[derive(Default)]
pub struct FakeLedger {
    pub block: AtomicU64,
    pub metagraphs: Mutex<HashMap<u16, Metagraph>>,
}

impl FakeLedger {
    pub fn new(block: u64) -> Self {
        Self {
            block: AtomicU64::new(block),
            metagraphs: Mutex::new(HashMap::new()),
        }
    }

    /// Register `hotkeys` on `netuid` with the given last-update heights.
    pub fn set_subnet(&self, netuid: u16, hotkeys: Vec<AccountId>, last_update: Vec<u64>) {
        let metagraph = Metagraph {
            netuid,
            block: self.block.load(Ordering::SeqCst),
            hotkeys,
            last_update,
        };
        self.metagraphs.lock().unwrap().insert(netuid, metagraph);
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn current_block(&self) -> Result<u64, LedgerError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn metagraph(&self, netuid: u16) -> Result<Metagraph, LedgerError> {
        self.metagraphs
            .lock()
            .unwrap()
            .get(&netuid)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc(format!("unknown subnet {netuid}")))
    }
}

/// Connector that hands out one shared fake ledger, or fails every time.
pub struct FakeConnector {
    pub ledger: Arc<FakeLedger>,
    pub fail: bool,
    pub connects: AtomicU32,
}

impl FakeConnector {
    pub fn new(ledger: Arc<FakeLedger>) -> Self {
        Self {
            ledger,
            fail: false,
            connects: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            ledger: Arc::new(FakeLedger::default()),
            fail: true,
            connects: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LedgerConnector for FakeConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn Ledger>, LedgerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(LedgerError::Rpc("connection refused".to_string()));
        }
        Ok(self.ledger.clone())
    }
}
