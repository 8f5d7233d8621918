// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # devpool
//!
//! Command-line driver for the device buffer cache, running against the
//! simulated compute engine.
//!
//! ## Usage
//! ```bash
//! # Stream frames through a pipeline that reuses its buffers
//! devpool demo --frames 120 --size 8M --device-memory 256M
//!
//! # Fill a small device and watch evict-and-retry recover
//! devpool pressure --size 4M --device-memory 16M
//!
//! # Print the effective context configuration
//! devpool --config devpool.toml config
//! ```

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "devpool",
    about = "Reference-counted device buffer cache driver",
    version,
    author
)]
struct Cli {
    /// Path to a TOML context configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated frame pipeline and report cache behaviour.
    Demo {
        /// Number of frames to push through the pipeline.
        #[arg(short, long, default_value_t = 60)]
        frames: u32,

        /// Size of each frame buffer (e.g., "4M", "512K").
        #[arg(short, long, default_value = "4M")]
        size: String,

        /// Simulated device memory (e.g., "64M", "1G").
        #[arg(short = 'm', long, default_value = "64M")]
        device_memory: String,

        /// Print statistics and the registry as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Exhaust device memory and demonstrate eviction and retry.
    Pressure {
        /// Size of each filler buffer.
        #[arg(short, long, default_value = "4M")]
        size: String,

        /// Simulated device memory.
        #[arg(short = 'm', long, default_value = "16M")]
        device_memory: String,
    },

    /// Print the effective context configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    commands::init_tracing(cli.verbose);
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            frames,
            size,
            device_memory,
            json,
        } => commands::demo::execute(config, frames, size, device_memory, json).await,
        Commands::Pressure {
            size,
            device_memory,
        } => commands::pressure::execute(config, size, device_memory).await,
        Commands::Config => commands::config::execute(config),
    }
}
