//! Chain-side block and transaction shapes as returned by
//! `eth_getBlockByNumber(n, true)`.
//!
//! Quantities stay hex strings, the way the node sends them; accessors
//! convert on demand. `number` and `hash` are required and checked with
//! [`ChainBlock::verify`]; every other field is lenient and a malformed
//! quantity reads as 0.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Protocol contracts whose transactions are counted separately from user
/// transactions.
pub const SYSTEM_ADDRESSES: [&str; 6] = [
    "0x0000000000000000000000000000000000000089", // sign block
    "0x0000000000000000000000000000000000000090", // randomize
    "0x0000000000000000000000000000000000000091", // tomox
    "0x0000000000000000000000000000000000000092", // tomox trading state
    "0x0000000000000000000000000000000000000093", // tomox lending
    "0x0000000000000000000000000000000000000094", // tomox final lending
];

/// Returns `true` if `address` is one of [`SYSTEM_ADDRESSES`] (case-insensitive).
pub fn is_system_address(address: &str) -> bool {
    SYSTEM_ADDRESSES.iter().any(|a| a.eq_ignore_ascii_case(address))
}

/// A block as returned by the node, with full transaction objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBlock {
    pub number: String,
    pub hash: String,
    #[serde(default)]
    pub parent_hash: String,
    #[serde(default)]
    pub sha3_uncles: String,
    #[serde(default)]
    pub miner: String,
    #[serde(default)]
    pub state_root: String,
    #[serde(default)]
    pub transactions_root: String,
    #[serde(default)]
    pub receipts_root: String,
    #[serde(default)]
    pub logs_bloom: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub total_difficulty: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub gas_limit: String,
    #[serde(default)]
    pub gas_used: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub extra_data: String,
    #[serde(default)]
    pub mix_hash: String,
    #[serde(default)]
    pub nonce: String,
    /// Attestor seal (XDPoS chains only).
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub validators: Option<String>,
    #[serde(default)]
    pub penalties: Option<String>,
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
}

impl ChainBlock {
    /// Lenient block number; trust it only on a block that passed [`verify`](Self::verify).
    pub fn number_u64(&self) -> u64 {
        parse_hex_u64(&self.number)
    }

    /// The block number, or a decode error if it is not a hex quantity.
    pub fn checked_number(&self) -> Result<u64, RpcError> {
        try_parse_hex_u64(&self.number)
            .ok_or_else(|| RpcError::Decode(format!("invalid block number '{}'", self.number)))
    }

    /// Check that this is block `requested`: a well-formed number equal to
    /// it and a non-empty hex hash.
    pub fn verify(&self, requested: u64) -> Result<(), RpcError> {
        let number = self.checked_number()?;
        if number != requested {
            return Err(RpcError::Decode(format!("asked for block {requested}, node returned {number}")));
        }
        let digits = self.hash.strip_prefix("0x").unwrap_or(&self.hash);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RpcError::Decode(format!("block {number} has invalid hash '{}'", self.hash)));
        }
        Ok(())
    }

    pub fn timestamp_i64(&self) -> i64 {
        parse_hex_u64(&self.timestamp) as i64
    }

    /// Normalized (lowercase) block hash.
    pub fn hash_normalized(&self) -> String {
        normalize_hash(&self.hash)
    }

    /// Number of transactions sent to a system contract.
    pub fn system_transaction_count(&self) -> u32 {
        self.transactions
            .iter()
            .filter(|tx| tx.to.as_deref().map(is_system_address).unwrap_or(false))
            .count() as u32
    }
}

/// A transaction object embedded in a [`ChainBlock`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainTransaction {
    pub hash: String,
    pub block_number: String,
    pub block_hash: String,
    pub transaction_index: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub nonce: String,
    pub gas: String,
    pub gas_price: String,
    pub input: String,
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64; 0 on bad input.
pub fn parse_hex_u64(s: &str) -> u64 {
    try_parse_hex_u64(s).unwrap_or(0)
}

/// Parse a hex-encoded quantity (with or without `0x`); `None` on empty,
/// invalid or overflowing input.
pub fn try_parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.starts_with('+') {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a hex quantity of arbitrary width; `None` on empty or invalid input.
pub fn parse_hex_u256(s: &str) -> Option<U256> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    U256::from_str_radix(digits, 16).ok()
}

/// Render a hex quantity as a decimal string (`""` when absent).
pub fn hex_to_decimal(s: &str) -> String {
    parse_hex_u256(s).map(|v| v.to_string()).unwrap_or_default()
}

/// Decode a hex byte string; odd-length input is left-padded with a zero.
pub fn decode_hex_bytes(s: &str) -> Option<Vec<u8>> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.len() % 2 == 1 {
        hex::decode(format!("0{digits}")).ok()
    } else {
        hex::decode(digits).ok()
    }
}

/// Lowercase a hash and make sure it carries the `0x` prefix.
pub fn normalize_hash(s: &str) -> String {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    format!("0x{}", digits.to_ascii_lowercase())
}
