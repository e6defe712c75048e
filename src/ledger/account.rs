/// 32-byte account ids and their SS58 text form.
use super::LedgerError;
use blake2::digest::consts::U64;
use blake2::{Blake2b, Digest};
use std::fmt;

/// Address format used by subtensor.
pub const SUBSTRATE_PREFIX: u16 = 42;

const CHECKSUM_PREAMBLE: &[u8] = b"SS58PRE";
const CHECKSUM_LEN: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    /// Decode and checksum-verify an SS58 address (any network prefix).
    pub fn from_ss58(address: &str) -> Result<Self, LedgerError> {
        let data = bs58::decode(address)
            .into_vec()
            .map_err(|e| LedgerError::Decode(format!("invalid ss58 address {address}: {e}")))?;

        let prefix_len = match data.first() {
            Some(b) if *b < 64 => 1,
            Some(b) if *b < 128 => 2,
            _ => {
                return Err(LedgerError::Decode(format!(
                    "unsupported ss58 prefix in {address}"
                )))
            }
        };
        if data.len() != prefix_len + 32 + CHECKSUM_LEN {
            return Err(LedgerError::Decode(format!(
                "ss58 address {address} has wrong length {}",
                data.len()
            )));
        }

        let body_len = prefix_len + 32;
        let hash = checksum(&data[..body_len]);
        if data[body_len..] != hash[..CHECKSUM_LEN] {
            return Err(LedgerError::Decode(format!(
                "ss58 checksum mismatch for {address}"
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&data[prefix_len..body_len]);
        Ok(AccountId(key))
    }

    /// Encode with the substrate generic prefix.
    pub fn to_ss58(&self) -> String {
        let mut data = Vec::with_capacity(1 + 32 + CHECKSUM_LEN);
        data.push(SUBSTRATE_PREFIX as u8);
        data.extend_from_slice(&self.0);
        let hash = checksum(&data);
        data.extend_from_slice(&hash[..CHECKSUM_LEN]);
        bs58::encode(data).into_string()
    }
}

fn checksum(body: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2b::<U64>::new();
    hasher.update(CHECKSUM_PREAMBLE);
    hasher.update(body);
    hasher.finalize().to_vec()
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ss58())
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.to_ss58())
    }
}
