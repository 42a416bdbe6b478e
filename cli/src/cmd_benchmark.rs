//! `chaincrawl benchmark` — measure fetch / trace throughput against the
//! configured node, through the same services the indexer uses.

use std::time::Instant;

use anyhow::Result;
use chaincrawl_bus::command::Command;
use chaincrawl_svc::{CrawlerRuntime, BLOCK_FETCHER, BLOCK_TRACER};

#[derive(Debug, Clone, Copy)]
pub enum Target {
    Blocks,
    Traces,
}

#[derive(Debug, Default)]
pub struct Tally {
    pub ok: usize,
    pub failed: usize,
    pub retries: u64,
}

pub async fn run(rt: &CrawlerRuntime, target: Target, from: u64, to: u64, batch: u64) -> Result<()> {
    anyhow::ensure!(from <= to, "--from ({from}) is above --to ({to})");
    let batch = batch.max(1);
    let started = Instant::now();
    let mut tally = Tally::default();

    let mut start = from;
    while start <= to {
        let end = start.saturating_add(batch - 1).min(to);
        window(rt, target, start, end, &mut tally).await?;
        start = end + 1;
    }

    let elapsed = started.elapsed();
    let total = tally.ok + tally.failed;
    let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("Benchmark: {target:?} {from}..={to} (batch {batch})");
    println!("  Items:      {total} ({} ok, {} failed)", tally.ok, tally.failed);
    println!("  Retries:    {}", tally.retries);
    println!("  Elapsed:    {:.2}s", elapsed.as_secs_f64());
    println!("  Throughput: {rate:.1} items/s");
    Ok(())
}

async fn window(rt: &CrawlerRuntime, target: Target, start: u64, end: u64, tally: &mut Tally) -> Result<()> {
    let request_id = format!("benchmark_{start}_{end}");
    let ctx = rt.context();
    match target {
        Target::Blocks => {
            let command = Command::GetBlocksRange { request_id, from: start, to: end };
            let reply = rt.controller().dispatch_and_wait(BLOCK_FETCHER, command).await?;
            let handle = reply.into_slot_handle("get_blocks_range")?;
            for result in ctx.blocks.take_array(&handle)? {
                match result {
                    Some(r) if r.is_ok() => {
                        tally.ok += 1;
                        tally.retries += u64::from(r.retries);
                    }
                    _ => tally.failed += 1,
                }
            }
        }
        Target::Traces => {
            let command = Command::TraceBlocksRange { request_id, from: start, to: end };
            let reply = rt.controller().dispatch_and_wait(BLOCK_TRACER, command).await?;
            let handle = reply.into_slot_handle("trace_blocks_range")?;
            for result in ctx.traces.take_array(&handle)? {
                match result {
                    Some(r) if r.is_ok() => {
                        tally.ok += 1;
                        tally.retries += u64::from(r.retries);
                    }
                    _ => tally.failed += 1,
                }
            }
        }
    }
    Ok(())
}
