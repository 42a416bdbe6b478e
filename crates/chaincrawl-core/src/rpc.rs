//! The chain RPC collaborator.

use async_trait::async_trait;
use serde_json::Value;

use crate::chain::ChainBlock;
use crate::error::RpcError;

/// A decoded block together with the raw JSON it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    pub block: ChainBlock,
    pub raw: String,
}

/// Call traces of every transaction in a block, plus the raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrace {
    pub traces: Vec<Value>,
    pub raw: String,
}

/// Trait for reading chain data from a JSON-RPC node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `eth_getBlockByNumber(number, true)`.
    async fn get_block_by_number(&self, number: u64) -> Result<RawBlock, RpcError>;

    /// `eth_blockNumber`.
    async fn get_block_number(&self) -> Result<u64, RpcError>;

    /// `debug_traceBlockByNumber(number, {tracer: "callTracer"})`.
    async fn trace_block_by_number(&self, number: u64) -> Result<RawTrace, RpcError>;

    /// `debug_traceTransaction(hash, {tracer: "callTracer"})`.
    async fn trace_transaction(&self, hash: &str) -> Result<Value, RpcError>;
}
