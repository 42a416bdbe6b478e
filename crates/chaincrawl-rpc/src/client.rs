//! HTTP JSON-RPC client backed by `reqwest`.
//!
//! One POST per call, no retries: the fetcher and tracer services own the
//! retry loop, and they decide from the [`RpcError`] kind. HTTP 502/503 are
//! reported as [`RpcError::Unavailable`] so they can be retried at half cost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use chaincrawl_core::chain::{try_parse_hex_u64, ChainBlock};
use chaincrawl_core::error::RpcError;
use chaincrawl_core::rpc::{ChainRpc, RawBlock, RawTrace};

use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// Configuration for [`HttpChainRpc`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30) }
    }
}

/// JSON-RPC client for one node.
pub struct HttpChainRpc {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpChainRpc {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { url: url.into(), http, next_id: AtomicU64::new(1) })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request and return its `result` (possibly `null`).
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let body = resp.bytes().await.map_err(|e| RpcError::Transport(e.to_string()))?;
        debug!(method, id, bytes = body.len(), "rpc response");
        let resp: JsonRpcResponse =
            serde_json::from_slice(&body).map_err(|e| RpcError::Decode(format!("{method}: {e}")))?;
        resp.into_result()
    }

    async fn call_non_null(&self, method: &str, params: Vec<Value>, what: String) -> Result<Value, RpcError> {
        match self.call(method, params).await? {
            Value::Null => Err(RpcError::NotFound { what }),
            value => Ok(value),
        }
    }
}

/// Classify a non-2xx HTTP status.
pub fn status_error(status: u16, body: &str) -> RpcError {
    match status {
        502 | 503 => RpcError::Unavailable { status },
        _ => RpcError::Transport(format!("HTTP {status}: {body}")),
    }
}

fn call_tracer() -> Value {
    json!({ "tracer": "callTracer" })
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn get_block_by_number(&self, number: u64) -> Result<RawBlock, RpcError> {
        let value = self
            .call_non_null("eth_getBlockByNumber", vec![json!(format!("{number:#x}")), json!(true)], format!("block {number}"))
            .await?;
        let raw = value.to_string();
        let block: ChainBlock =
            serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("block {number}: {e}")))?;
        block.verify(number)?;
        Ok(RawBlock { block, raw })
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        match self.call("eth_blockNumber", vec![]).await? {
            Value::String(s) => try_parse_hex_u64(&s)
                .ok_or_else(|| RpcError::Decode(format!("eth_blockNumber returned '{s}'"))),
            other => Err(RpcError::Decode(format!("eth_blockNumber returned {other}"))),
        }
    }

    async fn trace_block_by_number(&self, number: u64) -> Result<RawTrace, RpcError> {
        let value = self
            .call_non_null(
                "debug_traceBlockByNumber",
                vec![json!(format!("{number:#x}")), call_tracer()],
                format!("traces of block {number}"),
            )
            .await?;
        let raw = value.to_string();
        match value {
            Value::Array(traces) => Ok(RawTrace { traces, raw }),
            other => Err(RpcError::Decode(format!("traces of block {number}: expected array, got {other}"))),
        }
    }

    async fn trace_transaction(&self, hash: &str) -> Result<Value, RpcError> {
        self.call_non_null(
            "debug_traceTransaction",
            vec![json!(hash), call_tracer()],
            format!("trace of transaction {hash}"),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP response, then close.
    async fn one_shot_server(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn client(url: String) -> HttpChainRpc {
        HttpChainRpc::new(url, HttpClientConfig::default()).unwrap()
    }

    #[test]
    fn status_classification() {
        assert_eq!(status_error(502, ""), RpcError::Unavailable { status: 502 });
        assert_eq!(status_error(503, "busy"), RpcError::Unavailable { status: 503 });
        assert!(matches!(status_error(500, "boom"), RpcError::Transport(_)));
        assert!(matches!(status_error(429, ""), RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn service_unavailable_maps_to_unavailable() {
        let url = one_shot_server("503 Service Unavailable", "").await;
        let err = client(url).get_block_number().await.unwrap_err();
        assert_eq!(err, RpcError::Unavailable { status: 503 });
    }

    #[tokio::test]
    async fn block_is_decoded_with_raw_json() {
        let url = one_shot_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x64","hash":"0xAB","transactions":[]}}"#,
        )
        .await;
        let raw = client(url).get_block_by_number(100).await.unwrap();
        assert_eq!(raw.block.number_u64(), 100);
        assert_eq!(raw.block.hash_normalized(), "0xab");
        assert!(raw.raw.contains("\"0x64\""));
    }

    #[tokio::test]
    async fn block_with_another_number_is_decode_error() {
        let url = one_shot_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x65","hash":"0xab","transactions":[]}}"#,
        )
        .await;
        let err = client(url).get_block_by_number(100).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(m) if m.contains("100")));
    }

    #[tokio::test]
    async fn block_without_number_is_decode_error() {
        let url = one_shot_server("200 OK", r#"{"jsonrpc":"2.0","id":1,"result":{"transactions":[]}}"#).await;
        let err = client(url).get_block_by_number(100).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[tokio::test]
    async fn malformed_head_is_decode_error() {
        let url = one_shot_server("200 OK", r#"{"jsonrpc":"2.0","id":1,"result":"0xzz"}"#).await;
        let err = client(url).get_block_number().await.unwrap_err();
        assert_eq!(err, RpcError::Decode("eth_blockNumber returned '0xzz'".into()));
    }

    #[tokio::test]
    async fn null_block_is_not_found() {
        let url = one_shot_server("200 OK", r#"{"jsonrpc":"2.0","id":1,"result":null}"#).await;
        let err = client(url).get_block_by_number(7).await.unwrap_err();
        assert_eq!(err, RpcError::NotFound { what: "block 7".into() });
    }

    #[tokio::test]
    async fn error_object_is_rpc_error() {
        let url = one_shot_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .await;
        let err = client(url).trace_transaction("0x01").await.unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let url = one_shot_server("200 OK", "not json").await;
        let err = client(url).get_block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(format!("http://{addr}")).get_block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
