// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `devpool config` command: print the effective configuration.

use buffer_cache::ContextConfig;

pub fn execute(config: ContextConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
