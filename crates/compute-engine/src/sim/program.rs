// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Simulated kernel programs.
//!
//! The simulator does not compile kernels. It reads each
//! `__kernel void name(...)` signature from the source so that runs can
//! enforce the parameter-name contract.

use super::FaultPlan;
use crate::{EngineError, KernelParams, Program, ProgramOptions, QueueSelector, RunTimings};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

const KERNEL_KEYWORD: &str = "__kernel";

/// Name and parameter names of one kernel function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KernelSignature {
    pub name: String,
    pub params: Vec<String>,
}

/// Scans kernel source for `__kernel` function signatures, in order.
pub(crate) fn parse_kernels(source: &str) -> Vec<KernelSignature> {
    let mut kernels = Vec::new();
    let mut rest = source;

    while let Some(pos) = rest.find(KERNEL_KEYWORD) {
        rest = &rest[pos + KERNEL_KEYWORD.len()..];
        let Some(open) = rest.find('(') else { break };
        let Some(len) = rest[open..].find(')') else { break };

        let header = &rest[..open];
        let args = &rest[open + 1..open + len];
        rest = &rest[open + len..];

        let Some(name) = header.split_whitespace().last() else {
            continue;
        };
        kernels.push(KernelSignature {
            name: name.to_string(),
            params: args.split(',').filter_map(param_name).collect(),
        });
    }
    kernels
}

/// The declared name of one parameter: the trailing identifier of its
/// declaration, e.g. `output` in `__global float* restrict output`.
fn param_name(decl: &str) -> Option<String> {
    let decl = decl.trim();
    if decl.is_empty() || decl == "void" {
        return None;
    }
    let start = decl
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)?;
    Some(decl[start..].to_string())
}

/// A built simulated program.
#[derive(Debug)]
pub struct SimProgram {
    signature: KernelSignature,
    options: ProgramOptions,
    num_queues: u32,
    faults: Arc<FaultPlan>,
}

impl SimProgram {
    pub(crate) fn new(
        signature: KernelSignature,
        options: ProgramOptions,
        num_queues: u32,
        faults: Arc<FaultPlan>,
    ) -> Self {
        Self {
            signature,
            options,
            num_queues,
            faults,
        }
    }

    pub fn options(&self) -> &ProgramOptions {
        &self.options
    }

    fn check_params(&self, params: &KernelParams) -> Result<(), EngineError> {
        let declared = &self.signature.params;
        if let Some(missing) = declared.iter().find(|p| !params.contains_key(*p)) {
            return Err(EngineError::Validation(format!(
                "missing parameter '{missing}' for kernel '{}'",
                self.signature.name
            )));
        }
        if let Some(extra) = params.keys().find(|k| !declared.contains(*k)) {
            return Err(EngineError::Validation(format!(
                "unexpected parameter '{extra}' for kernel '{}'",
                self.signature.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Program for SimProgram {
    fn name(&self) -> &str {
        &self.signature.name
    }

    fn param_names(&self) -> &[String] {
        &self.signature.params
    }

    async fn run(
        &self,
        params: &KernelParams,
        queue: Option<QueueSelector>,
    ) -> Result<RunTimings, EngineError> {
        queue.unwrap_or_default().check(self.num_queues)?;
        self.check_params(params)?;
        if self.faults.take_run() {
            return Err(EngineError::OutOfMemory {
                requested_bytes: 0,
                available_bytes: 0,
                capacity_bytes: 0,
            });
        }

        let start = Instant::now();
        tokio::task::yield_now().await;
        let data_to_kernel = start.elapsed();

        let exec_start = Instant::now();
        tokio::task::yield_now().await;
        let kernel_exec = exec_start.elapsed();

        Ok(RunTimings {
            data_to_kernel,
            kernel_exec,
            data_from_kernel: Default::default(),
            total_time: start.elapsed(),
        })
    }
}
