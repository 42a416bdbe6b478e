//! Persisted rows: blocks, transactions, and checkpoints.

use serde::{Deserialize, Serialize};

use crate::chain::{hex_to_decimal, normalize_hash, parse_hex_u64, ChainBlock, ChainTransaction};

/// One row per block number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub uncle_hash: String,
    pub state_root: String,
    pub transactions_root: String,
    pub receipts_root: String,
    pub miner: String,
    pub timestamp: i64,
    pub size: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Decimal string.
    pub difficulty: String,
    /// Decimal string.
    pub total_difficulty: String,
    pub transaction_count: u32,
    pub system_transaction_count: u32,
    pub creator: Option<String>,
    pub attestor: Option<String>,
    /// Seconds since the parent block, when the parent is known.
    pub mint_duration: Option<u64>,
}

impl BlockRow {
    /// Build a row from a fetched block. Signer fields and mint duration are
    /// filled in later by the classifier.
    pub fn from_chain(block: &ChainBlock) -> Self {
        Self {
            number: block.number_u64(),
            hash: block.hash_normalized(),
            parent_hash: normalize_hash(&block.parent_hash),
            uncle_hash: block.sha3_uncles.to_ascii_lowercase(),
            state_root: block.state_root.to_ascii_lowercase(),
            transactions_root: block.transactions_root.to_ascii_lowercase(),
            receipts_root: block.receipts_root.to_ascii_lowercase(),
            miner: block.miner.to_ascii_lowercase(),
            timestamp: block.timestamp_i64(),
            size: parse_hex_u64(&block.size),
            gas_limit: parse_hex_u64(&block.gas_limit),
            gas_used: parse_hex_u64(&block.gas_used),
            difficulty: hex_to_decimal(&block.difficulty),
            total_difficulty: hex_to_decimal(&block.total_difficulty),
            transaction_count: block.transactions.len() as u32,
            system_transaction_count: block.system_transaction_count(),
            creator: None,
            attestor: None,
            mint_duration: None,
        }
    }
}

/// One row per transaction hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRow {
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u32,
    pub from: String,
    pub to: Option<String>,
    /// Decimal string.
    pub value: String,
    pub nonce: u64,
    pub gas: u64,
    /// Decimal string.
    pub gas_price: String,
}

impl TransactionRow {
    /// Build a row from a transaction embedded in `block`.
    pub fn from_chain(tx: &ChainTransaction, block: &ChainBlock) -> Self {
        Self {
            hash: normalize_hash(&tx.hash),
            block_number: block.number_u64(),
            block_hash: block.hash_normalized(),
            transaction_index: parse_hex_u64(&tx.transaction_index) as u32,
            from: tx.from.to_ascii_lowercase(),
            to: tx.to.as_ref().map(|a| a.to_ascii_lowercase()),
            value: hex_to_decimal(&tx.value),
            nonce: parse_hex_u64(&tx.nonce),
            gas: parse_hex_u64(&tx.gas),
            gas_price: hex_to_decimal(&tx.gas_price),
        }
    }
}

/// Which pipeline a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Index,
    Trace,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CheckpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(Self::Index),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown checkpoint kind '{other}'")),
        }
    }
}

/// Durable cursor: the next block number a pipeline resumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub kind: CheckpointKind,
    pub block_number: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(kind: CheckpointKind, block_number: u64) -> Self {
        Self {
            kind,
            block_number,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_row_from_chain() {
        let block = ChainBlock {
            number: "0x69".into(),
            hash: "0xAB".into(),
            parent_hash: "0xCD".into(),
            difficulty: "0x2".into(),
            gas_used: "0x5208".into(),
            transactions: vec![ChainTransaction::default(), ChainTransaction::default()],
            ..Default::default()
        };
        let row = BlockRow::from_chain(&block);
        assert_eq!(row.number, 105);
        assert_eq!(row.hash, "0xab");
        assert_eq!(row.parent_hash, "0xcd");
        assert_eq!(row.difficulty, "2");
        assert_eq!(row.gas_used, 21_000);
        assert_eq!(row.transaction_count, 2);
        assert!(row.creator.is_none());
    }

    #[test]
    fn transaction_row_takes_block_binding() {
        let block = ChainBlock { number: "0xa".into(), hash: "0xBB".into(), ..Default::default() };
        let tx = ChainTransaction {
            hash: "0xAA".into(),
            transaction_index: "0x3".into(),
            value: "0xde0b6b3a7640000".into(),
            ..Default::default()
        };
        let row = TransactionRow::from_chain(&tx, &block);
        assert_eq!(row.hash, "0xaa");
        assert_eq!(row.block_number, 10);
        assert_eq!(row.block_hash, "0xbb");
        assert_eq!(row.transaction_index, 3);
        assert_eq!(row.value, "1000000000000000000");
    }

    #[test]
    fn checkpoint_kind_parses() {
        assert_eq!("trace".parse::<CheckpointKind>().unwrap(), CheckpointKind::Trace);
        assert!("highest".parse::<CheckpointKind>().is_err());
        assert_eq!(CheckpointKind::Index.to_string(), "index");
    }
}
