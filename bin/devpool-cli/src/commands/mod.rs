// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

pub mod config;
pub mod demo;
pub mod pressure;

use buffer_cache::ContextConfig;
use compute_engine::MemorySize;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
/// the verbosity flag.
pub fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// The configuration file if one was given, else the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ContextConfig> {
    match path {
        Some(path) => Ok(ContextConfig::from_file(path)?),
        None => Ok(ContextConfig::default()),
    }
}

pub fn parse_size(what: &str, value: &str) -> anyhow::Result<MemorySize> {
    MemorySize::parse(value).map_err(|e| anyhow::anyhow!("invalid {what} '{value}': {e}"))
}
