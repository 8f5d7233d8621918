// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The asynchronous engine contract.
//!
//! Implementations wrap a real device API or, for tests, the in-process
//! [`sim`](crate::sim) device. Trait objects are `Send + Sync` so handles can
//! be shared between tokio tasks.

use crate::{
    BufferSpec, EngineError, HostAccess, KernelParams, ProgramOptions, QueueSelector, RunTimings,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Entry point: opens a context on a platform/device pair.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// Creates a context.
    ///
    /// Both indices omitted selects the default device. Supplying only one
    /// of them, or an index out of range, is a validation error.
    /// `num_queues` must be between 1 and 3.
    async fn create_context(
        &self,
        platform_index: Option<u32>,
        device_index: Option<u32>,
        num_queues: u32,
    ) -> Result<Arc<dyn ContextHandle>, EngineError>;
}

/// An open device context.
#[async_trait]
pub trait ContextHandle: Send + Sync {
    fn platform_index(&self) -> u32;

    fn device_index(&self) -> u32;

    fn num_queues(&self) -> u32;

    /// Allocates device memory. Fails with [`EngineError::OutOfMemory`]
    /// under device pressure.
    async fn create_buffer(&self, spec: &BufferSpec) -> Result<Arc<dyn NativeBuffer>, EngineError>;

    /// Builds a program from kernel source.
    async fn create_program(
        &self,
        kernel_source: &str,
        options: ProgramOptions,
    ) -> Result<Arc<dyn Program>, EngineError>;

    /// Waits for all work on a queue (default: queue 0) to finish.
    async fn wait_finish(&self, queue: Option<QueueSelector>) -> Result<(), EngineError>;
}

/// A device allocation.
#[async_trait]
pub trait NativeBuffer: Send + Sync {
    fn num_bytes(&self) -> usize;

    /// Releases the device memory. Callers must not free twice.
    fn free(&self);

    /// Makes the buffer visible to the host in `access` direction,
    /// optionally copying `source` in first. [`HostAccess::None`] withdraws
    /// host access.
    async fn host_access(
        &self,
        access: HostAccess,
        queue: Option<QueueSelector>,
        source: Option<&[u8]>,
    ) -> Result<(), EngineError>;
}

/// A built kernel program.
#[async_trait]
pub trait Program: Send + Sync {
    /// Name of the selected kernel function.
    fn name(&self) -> &str;

    /// Declared kernel parameter names, in signature order.
    fn param_names(&self) -> &[String];

    /// Runs the kernel. The keys of `params` must equal
    /// [`param_names`](Program::param_names) exactly.
    async fn run(
        &self,
        params: &KernelParams,
        queue: Option<QueueSelector>,
    ) -> Result<RunTimings, EngineError>;
}
