//! Issues — immutable forensic records of anomalies seen while indexing.
//!
//! Every issue carries a content-derived checksum:
//!
//! ```text
//! sha256( kind ‖ block-hash bytes ‖ tx-hash bytes ‖ canonical JSON(extras) )
//! ```
//!
//! Extras live in a `BTreeMap`, so their JSON form has sorted keys and the
//! same evidence always serializes the same way. Storage backends use the
//! checksum as a unique key, which makes replaying a window harmless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::chain::{decode_hex_bytes, normalize_hash};

/// The anomaly an [`Issue`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A block could not be fetched or decoded.
    Error,
    /// The hash stored for a block number changed.
    Reorg,
    /// A block hash was observed under two different block numbers.
    DuplicatedBlockHash,
    /// A transaction hash was observed in two different blocks.
    DuplicatedTxHash,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Reorg => "reorg",
            Self::DuplicatedBlockHash => "duplicated_block_hash",
            Self::DuplicatedTxHash => "duplicated_tx_hash",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for IssueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "reorg" => Ok(Self::Reorg),
            "duplicated_block_hash" => Ok(Self::DuplicatedBlockHash),
            "duplicated_tx_hash" => Ok(Self::DuplicatedTxHash),
            other => Err(format!("unknown issue kind '{other}'")),
        }
    }
}

/// An immutable record of an anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub block_number: u64,
    /// Empty when the block hash is unknown.
    pub block_hash: String,
    /// Empty for block-level issues.
    pub tx_hash: String,
    pub extras: BTreeMap<String, Value>,
    /// Hex-encoded SHA-256; see the module docs.
    pub checksum: String,
    /// Unix timestamp of the observation. Not part of the checksum.
    pub observed_at: i64,
}

impl Issue {
    /// Build an issue and compute its checksum.
    pub fn new(
        kind: IssueKind,
        block_number: u64,
        block_hash: impl Into<String>,
        tx_hash: impl Into<String>,
        mut extras: BTreeMap<String, Value>,
    ) -> Self {
        let block_hash = block_hash.into();
        let tx_hash = tx_hash.into();
        extras.insert("blockNumber".into(), Value::from(block_number));
        let checksum = compute_checksum(kind, &block_hash, &tx_hash, &extras);
        Self {
            kind,
            block_number,
            block_hash,
            tx_hash,
            extras,
            checksum,
            observed_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The hash stored for `block_number` changed from `old_hash` to `new_hash`.
    pub fn reorg(block_number: u64, old_hash: &str, new_hash: &str) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert("prevBlockHash".into(), Value::from(normalize_hash(old_hash)));
        Self::new(IssueKind::Reorg, block_number, normalize_hash(new_hash), "", extras)
    }

    /// `block_hash` is now at `block_number` but was stored at `prev_block_number`.
    pub fn duplicated_block_hash(block_hash: &str, block_number: u64, prev_block_number: u64) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert("prevBlockNumber".into(), Value::from(prev_block_number));
        extras.insert("prevBlockNumberHex".into(), Value::from(format!("{prev_block_number:#x}")));
        Self::new(IssueKind::DuplicatedBlockHash, block_number, normalize_hash(block_hash), "", extras)
    }

    /// `tx_hash` is now in block `block_number` but was bound to `prev_block_number`.
    pub fn duplicated_tx_hash(
        tx_hash: &str,
        block_number: u64,
        block_hash: &str,
        prev_block_number: u64,
        prev_block_hash: &str,
    ) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert("prevBlockNumber".into(), Value::from(prev_block_number));
        extras.insert("prevBlockNumberHex".into(), Value::from(format!("{prev_block_number:#x}")));
        extras.insert("prevBlockHash".into(), Value::from(normalize_hash(prev_block_hash)));
        Self::new(
            IssueKind::DuplicatedTxHash,
            block_number,
            normalize_hash(block_hash),
            normalize_hash(tx_hash),
            extras,
        )
    }

    /// A block (or transaction) could not be processed.
    pub fn error(block_number: u64, block_hash: &str, tx_hash: &str, message: impl Into<String>) -> Self {
        let mut extras = BTreeMap::new();
        extras.insert("error".into(), Value::from(message.into()));
        Self::new(IssueKind::Error, block_number, block_hash, tx_hash, extras)
    }

    /// Recompute the checksum from the current fields.
    pub fn expected_checksum(&self) -> String {
        compute_checksum(self.kind, &self.block_hash, &self.tx_hash, &self.extras)
    }
}

/// Compute the checksum of an issue's identifying content.
pub fn compute_checksum(
    kind: IssueKind,
    block_hash: &str,
    tx_hash: &str,
    extras: &BTreeMap<String, Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(hash_bytes(block_hash));
    hasher.update(hash_bytes(tx_hash));
    // BTreeMap serializes with sorted keys; serialization of a map of JSON
    // values cannot fail.
    let canonical = serde_json::to_vec(extras).unwrap_or_default();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

fn hash_bytes(s: &str) -> Vec<u8> {
    if s.is_empty() {
        return Vec::new();
    }
    decode_hex_bytes(s).unwrap_or_else(|| s.as_bytes().to_vec())
}
