//! chaincrawl-rpc — the HTTP JSON-RPC implementation of [`ChainRpc`].
//!
//! [`ChainRpc`]: chaincrawl_core::rpc::ChainRpc

pub mod client;
pub mod request;

pub use client::{HttpChainRpc, HttpClientConfig};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
