//! Crawler configuration.
//!
//! Plain serde structs with defaults; the CLI loads them from YAML and layers
//! command-line overrides on top. Nothing in the library reads the
//! environment or global state: the config is handed to constructors.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CrawlerError;
use crate::retry::RetryConfig;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub rpc: RpcConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub retry: RetryConfig,
    pub workers: WorkerConfig,
    pub indexer: IndexerConfig,
    pub schedule: ScheduleConfig,
    pub download: DownloadConfig,
}

impl CrawlerConfig {
    /// Reject configurations that cannot work before anything starts.
    pub fn validate(&self) -> Result<(), CrawlerError> {
        if self.rpc.url.trim().is_empty() {
            return Err(CrawlerError::Config("rpc.url must be set".into()));
        }
        if self.indexer.batch_size == 0 {
            return Err(CrawlerError::Config("indexer.batch_size must be > 0".into()));
        }
        if self.download.batch_size == 0 {
            return Err(CrawlerError::Config("download.batch_size must be > 0".into()));
        }
        if self.retry.min_gap_ms > self.retry.max_gap_ms {
            return Err(CrawlerError::Config(format!(
                "retry.min_gap_ms ({}) is greater than retry.max_gap_ms ({})",
                self.retry.min_gap_ms, self.retry.max_gap_ms
            )));
        }
        if let Some(end) = self.indexer.end_block {
            if end < self.indexer.start_block {
                return Err(CrawlerError::Config(format!(
                    "indexer.end_block ({end}) is below indexer.start_block ({})",
                    self.indexer.start_block
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// JSON-RPC endpoint URL.
    pub url: String,
    /// Per-request timeout.
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".into(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `memory:`, `sqlite:<path>` or `postgres://...`.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite:./chaincrawl.db".into() }
    }
}

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    pub level: String,
    /// Override per component: component_name → level
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Worker count per service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub block_fetcher: u16,
    pub block_tracer: u16,
    pub block_indexer: u16,
    pub downloader: u16,
    pub fs_writer: u16,
    pub db_writer: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            block_fetcher: 8,
            block_tracer: 4,
            block_indexer: 1,
            downloader: 1,
            fs_writer: 2,
            db_writer: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub start_block: u64,
    /// `None` follows the chain head.
    pub end_block: Option<u64>,
    pub batch_size: u64,
    /// Round window ends down to multiples of this (1 = off).
    pub batch_alignment: u64,
    /// How far to step back when the first block of a window reorged.
    pub rewind_depth: u64,
    /// Resume from the stored index checkpoint instead of `start_block`.
    pub use_checkpoint: bool,
    /// Recover creator/attestor addresses from header seals.
    pub recover_signers: bool,
    /// Also classify and persist transactions.
    pub index_transactions: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            end_block: None,
            batch_size: 100,
            batch_alignment: 1,
            rewind_depth: 10,
            use_checkpoint: true,
            recover_signers: true,
            index_transactions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Scheduler tick; clamped to 250 ms – 60 s.
    pub tick_ms: u64,
    /// How often the `index` job fires.
    pub index_interval_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            index_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Output root for raw JSON dumps.
    pub root: PathBuf,
    pub batch_size: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            batch_size: 100,
        }
    }
}
