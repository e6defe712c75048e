/// Subtensor ledger client over substrate JSON-RPC (HTTP).
///
/// Reads `SubtensorModule.LastUpdate` and `SubtensorModule.Keys` directly from
/// storage, pinned to one block hash so the metagraph is a consistent snapshot.
use super::{AccountId, Ledger, LedgerConnector, LedgerError, Metagraph};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twox_hash::XxHash64;

const PALLET: &[u8] = b"SubtensorModule";

/// Creates a fresh HTTP client per connection.
#[derive(Debug, Clone)]
pub struct SubtensorConnector {
    timeout: Duration,
}

impl SubtensorConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LedgerConnector for SubtensorConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Ledger>, LedgerError> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let rpc = SubtensorRpc {
            client,
            url: endpoint.to_string(),
            next_id: AtomicU64::new(1),
        };
        // A header fetch proves the node is reachable and serving.
        let block = rpc.current_block().await?;
        tracing::debug!(endpoint, block, "connected to subtensor");
        Ok(Arc::new(rpc))
    }
}

pub struct SubtensorRpc {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl SubtensorRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response: Value = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.get("error") {
            return Err(LedgerError::Rpc(format!("{method}: {error}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Rpc(format!("{method}: response has no result")))
    }

    async fn block_hash(&self, number: u64) -> Result<String, LedgerError> {
        let result = self.call("chain_getBlockHash", json!([number])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LedgerError::Decode(format!("no hash for block {number}")))
    }

    async fn storage(&self, key: &[u8], at: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        let result = self
            .call("state_getStorage", json!([to_hex(key), at]))
            .await?;
        match result.as_str() {
            Some(s) => Ok(Some(from_hex(s)?)),
            None => Ok(None),
        }
    }

    /// Fetch many keys in one round trip; missing values come back as None.
    async fn storage_many(
        &self,
        keys: &[Vec<u8>],
        at: &str,
    ) -> Result<Vec<Option<Vec<u8>>>, LedgerError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let hex_keys: Vec<String> = keys.iter().map(|k| to_hex(k)).collect();
        let result = self
            .call("state_queryStorageAt", json!([hex_keys, at]))
            .await?;

        let mut values: std::collections::HashMap<String, Option<Vec<u8>>> =
            std::collections::HashMap::new();
        let change_sets = result
            .as_array()
            .ok_or_else(|| LedgerError::Decode("queryStorageAt: expected array".to_string()))?;
        for set in change_sets {
            let changes = set
                .get("changes")
                .and_then(Value::as_array)
                .ok_or_else(|| LedgerError::Decode("queryStorageAt: no changes".to_string()))?;
            for change in changes {
                let key = change
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| LedgerError::Decode("queryStorageAt: bad key".to_string()))?;
                let value = match change.get(1).and_then(Value::as_str) {
                    Some(v) => Some(from_hex(v)?),
                    None => None,
                };
                values.insert(key.to_lowercase(), value);
            }
        }
        Ok(hex_keys
            .iter()
            .map(|k| values.get(k).cloned().flatten())
            .collect())
    }
}

#[async_trait]
impl Ledger for SubtensorRpc {
    async fn current_block(&self) -> Result<u64, LedgerError> {
        let header = self.call("chain_getHeader", json!([])).await?;
        let number = header
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Decode("header has no number".to_string()))?;
        parse_hex_u64(number)
    }

    async fn metagraph(&self, netuid: u16) -> Result<Metagraph, LedgerError> {
        let block = self.current_block().await?;
        let at = self.block_hash(block).await?;

        let last_update = match self.storage(&last_update_key(netuid), &at).await? {
            Some(bytes) => decode_u64_vec(&bytes)?,
            None => Vec::new(),
        };

        let uid_count = u16::try_from(last_update.len())
            .map_err(|_| LedgerError::Decode("too many uids".to_string()))?;
        let keys: Vec<Vec<u8>> = (0..uid_count).map(|uid| hotkey_key(netuid, uid)).collect();
        let hotkeys = self
            .storage_many(&keys, &at)
            .await?
            .into_iter()
            .map(|value| match value {
                Some(bytes) => decode_account(&bytes),
                None => Ok(AccountId([0; 32])),
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(netuid, block, uids = uid_count, "fetched metagraph");
        Ok(Metagraph {
            netuid,
            block,
            hotkeys,
            last_update,
        })
    }
}

/// Substrate `Twox128` hasher: two seeded xxhash64 digests, little-endian.
pub fn twox128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (seed, chunk) in out.chunks_exact_mut(8).enumerate() {
        let mut hasher = XxHash64::with_seed(seed as u64);
        hasher.write(data);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

fn storage_prefix(item: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 4);
    key.extend_from_slice(&twox128(PALLET));
    key.extend_from_slice(&twox128(item));
    key
}

/// `LastUpdate: map Identity(netuid) => Vec<u64>`
pub fn last_update_key(netuid: u16) -> Vec<u8> {
    let mut key = storage_prefix(b"LastUpdate");
    key.extend_from_slice(&netuid.to_le_bytes());
    key
}

/// `Keys: double_map Identity(netuid), Identity(uid) => AccountId`
pub fn hotkey_key(netuid: u16, uid: u16) -> Vec<u8> {
    let mut key = storage_prefix(b"Keys");
    key.extend_from_slice(&netuid.to_le_bytes());
    key.extend_from_slice(&uid.to_le_bytes());
    key
}

fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn from_hex(s: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(s.trim_start_matches("0x")).map_err(|e| LedgerError::Decode(e.to_string()))
}

fn parse_hex_u64(s: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::Decode(format!("bad number {s}: {e}")))
}

/// SCALE compact integer; returns (value, bytes consumed).
fn decode_compact(bytes: &[u8]) -> Result<(u64, usize), LedgerError> {
    let short = || LedgerError::Decode("truncated compact integer".to_string());
    let first = *bytes.first().ok_or_else(short)?;
    match first & 0b11 {
        0b00 => Ok((u64::from(first >> 2), 1)),
        0b01 => {
            let raw = bytes.get(..2).ok_or_else(short)?;
            Ok((u64::from(u16::from_le_bytes([raw[0], raw[1]]) >> 2), 2))
        }
        0b10 => {
            let raw = bytes.get(..4).ok_or_else(short)?;
            Ok((
                u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) >> 2),
                4,
            ))
        }
        _ => {
            let len = usize::from(first >> 2) + 4;
            if len > 8 {
                return Err(LedgerError::Decode("compact integer too large".to_string()));
            }
            let raw = bytes.get(1..1 + len).ok_or_else(short)?;
            let mut buf = [0u8; 8];
            buf[..len].copy_from_slice(raw);
            Ok((u64::from_le_bytes(buf), 1 + len))
        }
    }
}

fn decode_u64_vec(bytes: &[u8]) -> Result<Vec<u64>, LedgerError> {
    let (len, offset) = decode_compact(bytes)?;
    let body = &bytes[offset..];
    let len = usize::try_from(len).map_err(|e| LedgerError::Decode(e.to_string()))?;
    if body.len() != len.saturating_mul(8) {
        return Err(LedgerError::Decode(format!(
            "expected {len} u64 values, got {} bytes",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(8)
        .map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            u64::from_le_bytes(buf)
        })
        .collect())
}

fn decode_account(bytes: &[u8]) -> Result<AccountId, LedgerError> {
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| LedgerError::Decode(format!("account id of {} bytes", bytes.len())))?;
    Ok(AccountId(key))
}
