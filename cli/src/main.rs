//! ChainCrawl CLI — crawl, index and dump an EVM chain over JSON-RPC.
//!
//! # Commands
//! ```text
//! chaincrawl index     [--from N] [--to N] [--batch N] [--worker N] [--force]
//! chaincrawl serve
//! chaincrawl download  blocks|traces --from N --to N [--batch N] [--root DIR]
//! chaincrawl database  migrate
//! chaincrawl benchmark blocks|traces --from N --to N [--batch N]
//! chaincrawl info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use chaincrawl_bus::command::{DownloadParams, IndexParams};
use chaincrawl_core::config::CrawlerConfig;
use chaincrawl_core::fs::LocalFileSystem;
use chaincrawl_core::storage::Storage;
use chaincrawl_rpc::{HttpChainRpc, HttpClientConfig};
use chaincrawl_storage::open_storage;
use chaincrawl_svc::CrawlerRuntime;

mod cmd_benchmark;
mod config;
mod logging;

#[derive(Parser)]
#[command(
    name = "chaincrawl",
    about = "Blockchain RPC crawler and indexer — ChainCrawl CLI",
    long_about = "
ChainCrawl CLI: index blocks and transactions into a SQL store, detect reorgs
and duplicates, and dump raw block / trace JSON to disk.

ENVIRONMENT VARIABLES:
  CHAINCRAWL_CONFIG        Path to the YAML config file
  CHAINCRAWL_RPC_URL       JSON-RPC endpoint (overrides rpc.url)
  CHAINCRAWL_DATABASE_URL  memory: | sqlite:<path> | postgres://... (overrides database.url)
  CHAINCRAWL_LOG_LEVEL     Log level (overrides log.level)
  RUST_LOG                 Full tracing filter, wins over everything else
",
    version
)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true, env = "CHAINCRAWL_CONFIG")]
    config: Option<PathBuf>,

    /// JSON-RPC endpoint URL
    #[arg(long, global = true, env = "CHAINCRAWL_RPC_URL")]
    rpc_url: Option<String>,

    /// Database URL
    #[arg(long, global = true, env = "CHAINCRAWL_DATABASE_URL")]
    database_url: Option<String>,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true, env = "CHAINCRAWL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index blocks (and transactions) into the database
    Index {
        /// First block (default: indexer.start_block)
        #[arg(long)]
        from: Option<u64>,
        /// Last block (default: indexer.end_block, else the chain head)
        #[arg(long)]
        to: Option<u64>,
        /// Window size (default: indexer.batch_size)
        #[arg(long)]
        batch: Option<u64>,
        /// Block fetcher workers (default: workers.block_fetcher)
        #[arg(long)]
        worker: Option<u16>,
        /// Ignore the stored checkpoint and start at --from
        #[arg(long)]
        force: bool,
    },

    /// Run the scheduler: index on an interval until Ctrl-C
    Serve,

    /// Dump raw block or trace JSON to disk
    Download {
        #[command(subcommand)]
        target: DownloadTarget,
    },

    /// Database management
    Database {
        #[command(subcommand)]
        action: DatabaseAction,
    },

    /// Measure fetch throughput against the node
    Benchmark {
        #[command(subcommand)]
        target: BenchmarkTarget,
    },

    /// Show build, config and checkpoint info
    Info,
}

#[derive(clap::Args, Clone, Copy)]
struct RangeArgs {
    #[arg(long)]
    from: u64,
    #[arg(long)]
    to: u64,
    /// Window size (default: download.batch_size)
    #[arg(long)]
    batch: Option<u64>,
}

#[derive(Subcommand)]
enum DownloadTarget {
    /// eth_getBlockByNumber dumps under <root>/getBlockByNumber
    Blocks {
        #[command(flatten)]
        range: RangeArgs,
        /// Output root (default: download.root)
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// debug_traceBlockByNumber dumps under <root>/traceBlockByNumber
    Traces {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        root: Option<PathBuf>,
        /// Resume from, and advance, the trace checkpoint
        #[arg(long)]
        use_checkpoint: bool,
    },
}

#[derive(Subcommand)]
enum DatabaseAction {
    /// Create or update the schema
    Migrate,
}

#[derive(Subcommand)]
enum BenchmarkTarget {
    Blocks {
        #[command(flatten)]
        range: RangeArgs,
    },
    Traces {
        #[command(flatten)]
        range: RangeArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = config::Overrides {
        rpc_url: cli.rpc_url.clone(),
        database_url: cli.database_url.clone(),
        log_level: cli.log_level.clone(),
        json_logs: cli.json_logs,
    };
    let mut config = config::load(cli.config.as_deref(), &overrides)?;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Index { from, to, batch, worker, force } => {
            if let Some(worker) = worker {
                config.workers.block_fetcher = worker;
            }
            let params = IndexParams {
                from: from.unwrap_or(config.indexer.start_block),
                to: to.or(config.indexer.end_block),
                batch_size: batch.unwrap_or(config.indexer.batch_size),
                use_checkpoint: config.indexer.use_checkpoint && !force,
            };
            cmd_index(config, params).await
        }

        Commands::Serve => cmd_serve(config).await,

        Commands::Download { target } => {
            let (range, root, traces, use_checkpoint) = match target {
                DownloadTarget::Blocks { range, root } => (range, root, false, false),
                DownloadTarget::Traces { range, root, use_checkpoint } => (range, root, true, use_checkpoint),
            };
            let params = DownloadParams {
                from: range.from,
                to: range.to,
                batch_size: range.batch.unwrap_or(config.download.batch_size),
                root: root.unwrap_or_else(|| config.download.root.clone()),
                use_checkpoint,
            };
            cmd_download(config, params, traces).await
        }

        Commands::Database { action: DatabaseAction::Migrate } => cmd_migrate(&config).await,

        Commands::Benchmark { target } => {
            let (target, range) = match target {
                BenchmarkTarget::Blocks { range } => (cmd_benchmark::Target::Blocks, range),
                BenchmarkTarget::Traces { range } => (cmd_benchmark::Target::Traces, range),
            };
            let batch = range.batch.unwrap_or(config.download.batch_size);
            let rt = start_runtime(config).await?;
            let result = cmd_benchmark::run(&rt, target, range.from, range.to, batch).await;
            rt.shutdown().await;
            result
        }

        Commands::Info => cmd_info(&config).await,
    }
}

// ─── Wiring ──────────────────────────────────────────────────────────────────

async fn start_runtime(config: CrawlerConfig) -> Result<CrawlerRuntime> {
    let rpc = HttpChainRpc::new(
        config.rpc.url.clone(),
        HttpClientConfig { request_timeout: Duration::from_millis(config.rpc.timeout_ms) },
    )?;
    let storage = open_storage(&config.database.url)
        .await
        .with_context(|| format!("open database '{}'", config.database.url))?;
    let rt = CrawlerRuntime::start(Arc::new(rpc), storage, Arc::new(LocalFileSystem), config).await?;
    Ok(rt)
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_index(config: CrawlerConfig, params: IndexParams) -> Result<()> {
    let rt = start_runtime(config).await?;
    let result = rt.index(params).await;
    rt.shutdown().await;

    let report = result.context("index failed")?;
    println!("✓ Indexed {} window(s), next block {}", report.windows, report.next_block);
    println!("  Blocks:       {} new, {} changed", report.new_blocks, report.changed_blocks);
    println!("  Transactions: {} new, {} changed", report.new_transactions, report.changed_transactions);
    println!("  Issues:       {} ({} reorgs)", report.issues, report.reorgs);
    if report.failed_blocks > 0 {
        println!("  Failed:       {} block(s), checkpoint held", report.failed_blocks);
    }
    Ok(())
}

async fn cmd_serve(config: CrawlerConfig) -> Result<()> {
    let rt = start_runtime(config).await?;
    rt.start_scheduler().await?;
    info!("serving; press Ctrl-C to stop");

    let stopped_by_bus = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            false
        }
        _ = rt.controller().wait_exit() => true,
    };
    rt.shutdown().await;

    if stopped_by_bus {
        bail!("the service bus exited (storage failure?); see the log for the cause");
    }
    info!("stopped");
    Ok(())
}

async fn cmd_download(config: CrawlerConfig, params: DownloadParams, traces: bool) -> Result<()> {
    anyhow::ensure!(params.from <= params.to, "--from ({}) is above --to ({})", params.from, params.to);
    let root = params.root.clone();
    let rt = start_runtime(config).await?;
    let result = if traces { rt.download_traces(params).await } else { rt.download_blocks(params).await };
    rt.shutdown().await;

    let report = result.context("download failed")?;
    println!("✓ Wrote {} file(s) under {}", report.written, root.display());
    if report.failed > 0 {
        println!("  Skipped {} item(s) that could not be fetched", report.failed);
    }
    Ok(())
}

async fn cmd_migrate(config: &CrawlerConfig) -> Result<()> {
    let storage = open_storage(&config.database.url)
        .await
        .with_context(|| format!("open database '{}'", config.database.url))?;
    storage.migrate().await.context("migration failed")?;
    println!("✓ Schema is up to date ({})", config.database.url);
    Ok(())
}

async fn cmd_info(config: &CrawlerConfig) -> Result<()> {
    println!("ChainCrawl v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("RPC:       {}", config.rpc.url);
    println!("Database:  {}", config.database.url);
    println!("Dump root: {}", config.download.root.display());
    let w = &config.workers;
    println!(
        "Workers:   fetcher={} tracer={} indexer={} downloader={} fs_writer={} db_writer={}",
        w.block_fetcher, w.block_tracer, w.block_indexer, w.downloader, w.fs_writer, w.db_writer
    );

    match open_storage(&config.database.url).await {
        Ok(storage) => print_checkpoints(storage.as_ref()).await?,
        Err(e) => println!("Storage:   unavailable ({e})"),
    }
    Ok(())
}

async fn print_checkpoints(storage: &dyn Storage) -> Result<()> {
    let show = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |n| n.to_string());
    println!("Index checkpoint: {}", show(storage.highest_index_block().await?));
    println!("Trace checkpoint: {}", show(storage.highest_trace_block().await?));
    println!("Issues recorded:  {}", storage.issues().await?.len());
    Ok(())
}
