// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `devpool demo` command: stream frames through a three-stage pipeline.
//!
//! ```text
//! load (host → device) ─▶ process (kernel) ─▶ unload (device → host)
//! ```
//!
//! Each stage takes its buffers from the cache under its own owner and
//! releases them when the frame is done, so after the first frame every
//! request should be a cache hit.

use buffer_cache::{ClContext, CloseOutcome, ContextConfig};
use compute_engine::sim::SimEngine;
use compute_engine::{BufDir, HostAccess, KernelArg, KernelParams, MemoryKind, ProgramOptions};
use std::sync::Arc;
use std::time::Instant;

const BLEND_KERNEL: &str = r#"
__kernel void blend(__global const uchar* restrict src,
                    __global uchar* restrict dst,
                    const float alpha) {
    uint i = get_global_id(0);
    dst[i] = (uchar)(src[i] * alpha);
}
"#;

pub async fn execute(
    config: ContextConfig,
    frames: u32,
    size: String,
    device_memory: String,
    json: bool,
) -> anyhow::Result<()> {
    let frame_size = super::parse_size("frame size", &size)?;
    let capacity = super::parse_size("device memory", &device_memory)?;

    if !json {
        println!("╔══════════════════════════════════════════════════════╗");
        println!("║             devpool · Frame Pipeline Demo            ║");
        println!("╚══════════════════════════════════════════════════════╝");
        println!();
        println!("  Frames:        {frames}");
        println!("  Frame size:    {frame_size}");
        println!("  Device memory: {capacity}");
        println!("  Queues:        {}", config.num_queues());
        println!();
    }

    let engine = Arc::new(SimEngine::single_device(capacity));
    let ctx = ClContext::connect(engine.clone(), config).await?;
    let queues = ctx.queues()?;
    let program = ctx
        .create_program(BLEND_KERNEL, ProgramOptions::new(vec![frame_size.as_bytes() as u32]))
        .await?;

    let source = vec![0x80u8; frame_size.as_bytes()];
    let started = Instant::now();

    // ── Pipeline ───────────────────────────────────────────────
    for frame in 0..frames {
        let input = ctx
            .create_buffer(
                frame_size.as_bytes(),
                BufDir::ReadOnly,
                MemoryKind::None,
                None,
                Some("loader"),
            )
            .await?;
        input.set_timestamp(i64::from(frame));
        input
            .host_access(HostAccess::WriteOnly, Some(queues.load), Some(&source))
            .await?;
        input.set_loadstamp(i64::from(frame));

        let output = ctx
            .create_buffer(
                frame_size.as_bytes(),
                BufDir::WriteOnly,
                MemoryKind::None,
                None,
                Some("blender"),
            )
            .await?;
        output.set_timestamp(i64::from(frame));

        let mut params = KernelParams::new();
        params.insert("src".into(), input.kernel_arg()?);
        params.insert("dst".into(), output.kernel_arg()?);
        params.insert("alpha".into(), KernelArg::Float(0.5));
        ctx.run_program_on(&*program, &params, Some(queues.process))
            .await?;
        input.release();

        output
            .host_access(HostAccess::ReadOnly, Some(queues.unload), None)
            .await?;
        ctx.wait_finish(Some(queues.unload)).await?;
        output.release();
    }
    let elapsed = started.elapsed();

    // ── Report ─────────────────────────────────────────────────
    let stats = ctx.stats();
    let buffers = ctx.buffers();

    if json {
        let report = serde_json::json!({
            "frames": frames,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
            "device_allocated_bytes": engine.allocated_bytes(),
            "stats": stats,
            "buffers": buffers,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "  Processed {frames} frames in {:.2} ms ({:.1} µs/frame)",
            elapsed.as_secs_f64() * 1000.0,
            elapsed.as_secs_f64() * 1e6 / f64::from(frames.max(1)),
        );
        println!();
        println!("  Cache");
        println!("   {}", stats.summary());
        println!();
        println!("  Registry");
        println!(
            "   {:>5} {:<10} {:>12} {:<10} {:<9} {:>4} {:>10}",
            "Index", "Owner", "Bytes", "Direction", "Status", "Refs", "Alloc µs",
        );
        println!("   {}", "-".repeat(66));
        for info in &buffers {
            println!(
                "   {:>5} {:<10} {:>12} {:<10} {:<9} {:>4} {:>10}",
                info.index,
                info.owner.as_deref().unwrap_or("-"),
                info.num_bytes,
                info.direction.as_str(),
                if info.reserved { "reserved" } else { "available" },
                info.refs,
                info.creation_time_us,
            );
        }
        println!();
    }
    ctx.log_buffers();

    // ── Shutdown ───────────────────────────────────────────────
    let released = ctx.release_buffers("loader") + ctx.release_buffers("blender");
    let outcome = ctx.close().await?;
    if !json {
        println!("  Released {released} buffer(s)");
        match outcome {
            CloseOutcome::Drained => println!("  Context closed cleanly."),
            CloseOutcome::TimedOut { forced_frees } => {
                println!("  Context close timed out; force-freed {forced_frees} buffer(s).")
            }
        }
    }
    Ok(())
}
