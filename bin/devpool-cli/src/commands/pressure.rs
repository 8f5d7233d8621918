// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `devpool pressure` command: recover from device out-of-memory.
//!
//! Fills the simulated device with buffers, lets go of half of them, then
//! asks for a buffer that only fits once the idle ones are evicted.

use buffer_cache::{CacheError, ClContext, ContextConfig};
use compute_engine::sim::SimEngine;
use compute_engine::{BufDir, BufferSpec, MemoryKind, MemorySize};
use std::sync::Arc;

pub async fn execute(
    config: ContextConfig,
    size: String,
    device_memory: String,
) -> anyhow::Result<()> {
    let buffer_size = super::parse_size("buffer size", &size)?;
    let capacity = super::parse_size("device memory", &device_memory)?;
    let slots = capacity.as_bytes() / buffer_size.as_bytes();
    anyhow::ensure!(
        slots >= 2,
        "device memory {capacity} must hold at least two {buffer_size} buffers"
    );

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║            devpool · Memory Pressure Demo            ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();

    let engine = Arc::new(SimEngine::single_device(capacity));
    let ctx = ClContext::connect(engine.clone(), config).await?;
    let spec = BufferSpec::new(buffer_size.as_bytes(), BufDir::ReadWrite, MemoryKind::None);

    // ── Fill ───────────────────────────────────────────────────
    let mut held = Vec::with_capacity(slots);
    for _ in 0..slots {
        held.push(ctx.create_buffer_spec(spec, Some("filler")).await?);
    }
    println!(
        "  [1/3] Filled device with {slots} × {buffer_size}: {} of {capacity} in use",
        MemorySize::from_bytes(engine.allocated_bytes()),
    );

    let idle = slots / 2;
    for buf in held.drain(..idle) {
        buf.release();
    }
    println!("        Released {idle} buffer(s); they stay registered for reuse.");
    println!();

    // ── Evict and retry ────────────────────────────────────────
    let large = BufferSpec::new(
        buffer_size.as_bytes() * idle,
        BufDir::ReadWrite,
        MemoryKind::None,
    );
    println!("  [2/3] Requesting {} bytes...", large.num_bytes);
    let big = ctx.create_buffer_spec(large, Some("large")).await?;
    let stats = ctx.stats();
    println!(
        "        Allocated buffer {} after {} eviction sweep(s) freeing {} buffer(s).",
        big.index(),
        stats.oom_retries,
        stats.evicted_buffers,
    );
    println!();

    // ── Exhausted ──────────────────────────────────────────────
    println!("  [3/3] Requesting another {buffer_size} with every buffer reserved...");
    match ctx.create_buffer_spec(spec, Some("overflow")).await {
        Err(CacheError::AllocationFailure(e)) => {
            println!("        Refused as expected: {e}");
        }
        Ok(buf) => {
            println!("        Unexpectedly allocated buffer {}", buf.index());
        }
        Err(e) => return Err(e.into()),
    }
    println!();

    println!("  Cache");
    println!("   {}", ctx.stats().summary());
    println!();

    ctx.release_buffers("filler");
    ctx.release_buffers("large");
    ctx.close().await?;
    println!("  Context closed; {} bytes still allocated.", engine.allocated_bytes());
    Ok(())
}
