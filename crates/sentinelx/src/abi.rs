//! Minimal ABI helpers for the handful of contract calls SentinelX makes.

use ethereum_types::{Address, H256};
use sha3::{Digest, Keccak256};

pub const WORD: usize = 32;

pub const ROUTER_LATEST_SIGNATURE: &str = "latest(bytes32)";
pub const PAUSE_SIGNATURE: &str = "pause()";
pub const UNPAUSE_SIGNATURE: &str = "unpause()";
pub const HUB_PAUSE_SIGNATURE: &str = "pause(address)";
pub const HUB_UNPAUSE_SIGNATURE: &str = "unpause(address)";

pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(data))
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(hash.as_bytes().get(..4).unwrap_or(&[0; 4]));
    out
}

/// The router keys its feed pairs by `keccak256(oracleKey)`.
pub fn oracle_key_hash(oracle_key: &str) -> H256 {
    keccak256(oracle_key.as_bytes())
}

pub fn encode_address(address: Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    if let Some(tail) = word.get_mut(12..) {
        tail.copy_from_slice(address.as_bytes());
    }
    word
}

pub fn router_latest_calldata(oracle_key: &str) -> Vec<u8> {
    let mut data = selector(ROUTER_LATEST_SIGNATURE).to_vec();
    data.extend_from_slice(oracle_key_hash(oracle_key).as_bytes());
    data
}

/// `pause()` on the guarded contract, or `pause(address)` on a guardian hub.
pub fn pause_calldata(via_hub: Option<Address>) -> Vec<u8> {
    match via_hub {
        Some(guarded) => {
            let mut data = selector(HUB_PAUSE_SIGNATURE).to_vec();
            data.extend_from_slice(&encode_address(guarded));
            data
        }
        None => selector(PAUSE_SIGNATURE).to_vec(),
    }
}

pub fn unpause_calldata(via_hub: Option<Address>) -> Vec<u8> {
    match via_hub {
        Some(guarded) => {
            let mut data = selector(HUB_UNPAUSE_SIGNATURE).to_vec();
            data.extend_from_slice(&encode_address(guarded));
            data
        }
        None => selector(UNPAUSE_SIGNATURE).to_vec(),
    }
}

pub fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    let start = index.checked_mul(WORD)?;
    data.get(start..start.checked_add(WORD)?)
}

/// Decode a two's-complement `int256` word, rejecting values outside `i128`.
pub fn decode_i128(word: &[u8]) -> Option<i128> {
    let (high, low) = (word.get(..16)?, word.get(16..WORD)?);
    let mut low_bytes = [0u8; 16];
    low_bytes.copy_from_slice(low);
    let value = i128::from_be_bytes(low_bytes);
    let extension = if value < 0 { 0xff } else { 0x00 };
    high.iter().all(|byte| *byte == extension).then_some(value)
}

pub fn decode_u64(word: &[u8]) -> Option<u64> {
    let (high, low) = (word.get(..24)?, word.get(24..WORD)?);
    if high.iter().any(|byte| *byte != 0) {
        return None;
    }
    let mut low_bytes = [0u8; 8];
    low_bytes.copy_from_slice(low);
    Some(u64::from_be_bytes(low_bytes))
}

pub fn decode_bool(word: &[u8]) -> Option<bool> {
    match decode_u64(word)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

pub fn parse_hex_bytes(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(digits).ok()
}

/// Parse a `0x`-prefixed (or bare) 20-byte hex address.
pub fn parse_address(raw: &str) -> Option<Address> {
    let bytes = parse_hex_bytes(raw)?;
    (bytes.len() == 20).then(|| Address::from_slice(&bytes))
}

pub fn parse_h256(raw: &str) -> Option<H256> {
    let bytes = parse_hex_bytes(raw)?;
    (bytes.len() == WORD).then(|| H256::from_slice(&bytes))
}

pub fn format_address(address: &Address) -> String {
    format!("0x{address:x}")
}

pub fn format_hash(hash: &H256) -> String {
    format!("0x{hash:x}")
}

pub fn to_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(data))
}
