pub mod account;
pub mod subtensor;

pub use account::AccountId;

use crate::retry::{retry_with_backoff, Backoff};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Errors produced by ledger queries.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Snapshot of a subnet: every participant's hotkey and last update height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metagraph {
    pub netuid: u16,
    /// Block height at which the snapshot was read.
    pub block: u64,
    /// Hotkey of each uid.
    pub hotkeys: Vec<AccountId>,
    /// Last update block of each uid.
    pub last_update: Vec<u64>,
}

impl Metagraph {
    pub fn last_update_of(&self, uid: u16) -> Option<u64> {
        self.last_update.get(usize::from(uid)).copied()
    }
}

/// Outcome of a hotkey lookup in a metagraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered { uid: u16 },
    NotRegistered,
}

/// Find the uid of `hotkey` on the subnet.
pub fn is_registered(metagraph: &Metagraph, hotkey: &AccountId) -> Registration {
    metagraph
        .hotkeys
        .iter()
        .position(|key| key == hotkey)
        .and_then(|uid| u16::try_from(uid).ok())
        .map_or(Registration::NotRegistered, |uid| Registration::Registered {
            uid,
        })
}

/// Read-only query contract over a connected ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn current_block(&self) -> Result<u64, LedgerError>;
    async fn metagraph(&self, netuid: u16) -> Result<Metagraph, LedgerError>;
}

/// Establishes ledger connections.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Ledger>, LedgerError>;
}

/// Connect with exponential backoff.
pub async fn connect_with_retry(
    connector: &dyn LedgerConnector,
    endpoint: &str,
    backoff: &Backoff,
) -> Result<Arc<dyn Ledger>, LedgerError> {
    retry_with_backoff(backoff, "ledger connect", || connector.connect(endpoint)).await
}

/// Resolve a network name (or explicit endpoint) to an HTTP JSON-RPC URL.
pub fn resolve_endpoint(network: &str, chain_endpoint: &str, default_network: &str) -> String {
    let target = if !chain_endpoint.is_empty() {
        chain_endpoint
    } else if !network.is_empty() {
        network
    } else {
        default_network
    };

    match target {
        "finney" => "https://entrypoint-finney.opentensor.ai:443".to_string(),
        "test" => "https://test.finney.opentensor.ai:443".to_string(),
        "local" => "http://127.0.0.1:9944".to_string(),
        url if url.starts_with("wss://") => format!("https://{}", &url["wss://".len()..]),
        url if url.starts_with("ws://") => format!("http://{}", &url["ws://".len()..]),
        url if url.contains("://") => url.to_string(),
        host => format!("http://{host}"),
    }
}

/// Default directory holding bittensor wallets.
pub fn default_wallet_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".bittensor")
        .join("wallets")
}

/// Read the SS58 address of a hotkey from its wallet file.
///
/// Wallet layout: `<wallet_dir>/<coldkey>/hotkeys/<hotkey>`, a JSON document
/// with an `ss58Address` field.
pub fn hotkey_from_wallet(
    wallet_dir: &Path,
    coldkey: &str,
    hotkey: &str,
) -> Result<AccountId, LedgerError> {
    let path = wallet_dir.join(coldkey).join("hotkeys").join(hotkey);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| LedgerError::Decode(format!("{}: {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| LedgerError::Decode(format!("{}: {e}", path.display())))?;
    let address = value
        .get("ss58Address")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| LedgerError::Decode(format!("{}: no ss58Address", path.display())))?;
    AccountId::from_ss58(address)
}
