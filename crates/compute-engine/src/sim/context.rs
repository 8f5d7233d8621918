// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Simulated device context.

use super::program::{parse_kernels, SimProgram};
use super::{DeviceMemory, FaultPlan, SimBuffer};
use crate::{
    BufferSpec, ContextHandle, EngineError, NativeBuffer, Program, ProgramOptions, QueueSelector,
};
use async_trait::async_trait;
use std::sync::Arc;

/// A context on a simulated device.
#[derive(Debug)]
pub struct SimContext {
    platform_index: u32,
    device_index: u32,
    num_queues: u32,
    memory: Arc<DeviceMemory>,
    faults: Arc<FaultPlan>,
}

impl SimContext {
    pub(crate) fn new(
        platform_index: u32,
        device_index: u32,
        num_queues: u32,
        memory: Arc<DeviceMemory>,
        faults: Arc<FaultPlan>,
    ) -> Self {
        Self {
            platform_index,
            device_index,
            num_queues,
            memory,
            faults,
        }
    }

    /// Allocates a buffer and returns it with its concrete type.
    pub async fn allocate(&self, spec: &BufferSpec) -> Result<Arc<SimBuffer>, EngineError> {
        spec.validate()?;
        if self.faults.take_allocation() {
            return Err(self.memory.out_of_memory(spec.num_bytes));
        }
        self.memory.reserve(spec.num_bytes)?;
        tokio::task::yield_now().await;
        Ok(Arc::new(SimBuffer::new(
            *spec,
            self.num_queues,
            Arc::clone(&self.memory),
        )))
    }

    /// Bytes still available on the device.
    pub fn available_bytes(&self) -> usize {
        self.memory.available()
    }
}

#[async_trait]
impl ContextHandle for SimContext {
    fn platform_index(&self) -> u32 {
        self.platform_index
    }

    fn device_index(&self) -> u32 {
        self.device_index
    }

    fn num_queues(&self) -> u32 {
        self.num_queues
    }

    async fn create_buffer(&self, spec: &BufferSpec) -> Result<Arc<dyn NativeBuffer>, EngineError> {
        let buffer = self.allocate(spec).await?;
        Ok(buffer)
    }

    async fn create_program(
        &self,
        kernel_source: &str,
        options: ProgramOptions,
    ) -> Result<Arc<dyn Program>, EngineError> {
        options.validate()?;
        let kernels = parse_kernels(kernel_source);
        if kernels.is_empty() {
            return Err(EngineError::BuildFailure(
                "no __kernel function found in source".into(),
            ));
        }
        let signature = match options.name.as_deref() {
            Some(name) => kernels
                .into_iter()
                .find(|k| k.name == name)
                .ok_or_else(|| EngineError::BuildFailure(format!("kernel '{name}' not found")))?,
            None => kernels.into_iter().next().ok_or_else(|| {
                EngineError::BuildFailure("no __kernel function found in source".into())
            })?,
        };
        tokio::task::yield_now().await;

        tracing::debug!(
            "sim program '{}' built with {} parameter(s)",
            signature.name,
            signature.params.len()
        );
        Ok(Arc::new(SimProgram::new(
            signature,
            options,
            self.num_queues,
            Arc::clone(&self.faults),
        )))
    }

    async fn wait_finish(&self, queue: Option<QueueSelector>) -> Result<(), EngineError> {
        queue.unwrap_or_default().check(self.num_queues)?;
        tokio::task::yield_now().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;
    use crate::{BufDir, MemoryKind, MemorySize};

    const KERNEL: &str = r#"
__kernel void square(__global const float* restrict input,
                     __global float* restrict output,
                     const uint count) {
    uint i = get_global_id(0);
    if (i < count) output[i] = input[i] * input[i];
}

__kernel void fill(__global float* output, const float value) {
    output[get_global_id(0)] = value;
}
"#;

    #[tokio::test]
    async fn test_allocate_validates_spec() {
        let engine = SimEngine::single_device(MemorySize::from_kb(4));
        let ctx = engine.open(None, None, 1).await.unwrap();
        let zero = BufferSpec::new(0, BufDir::ReadWrite, MemoryKind::None);
        assert!(matches!(
            ctx.allocate(&zero).await.unwrap_err(),
            EngineError::Validation(_)
        ));
        assert_eq!(engine.live_allocations(), 0);
    }

    #[tokio::test]
    async fn test_create_program_selects_kernel() {
        let engine = SimEngine::single_device(MemorySize::from_kb(4));
        let ctx = engine.open(None, None, 1).await.unwrap();

        let first = ctx
            .create_program(KERNEL, ProgramOptions::new(vec![64]))
            .await
            .unwrap();
        assert_eq!(first.name(), "square");
        assert_eq!(first.param_names(), ["input", "output", "count"]);

        let named = ctx
            .create_program(KERNEL, ProgramOptions::new(vec![64]).named("fill"))
            .await
            .unwrap();
        assert_eq!(named.name(), "fill");
        assert_eq!(named.param_names(), ["output", "value"]);
    }

    #[tokio::test]
    async fn test_create_program_errors() {
        let engine = SimEngine::single_device(MemorySize::from_kb(4));
        let ctx = engine.open(None, None, 1).await.unwrap();

        let missing_items = ctx
            .create_program(KERNEL, ProgramOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(missing_items, EngineError::Validation(_)));

        let unknown = ctx
            .create_program(KERNEL, ProgramOptions::new(vec![1]).named("nope"))
            .await
            .err()
            .unwrap();
        assert!(matches!(unknown, EngineError::BuildFailure(_)));

        let empty = ctx
            .create_program("int x;", ProgramOptions::new(vec![1]))
            .await
            .err()
            .unwrap();
        assert!(matches!(empty, EngineError::BuildFailure(_)));
    }

    #[tokio::test]
    async fn test_wait_finish_checks_queue() {
        let engine = SimEngine::single_device(MemorySize::from_kb(4));
        let ctx = engine.open(None, None, 3).await.unwrap();
        assert!(ctx.wait_finish(None).await.is_ok());
        assert!(ctx.wait_finish(Some(QueueSelector(2))).await.is_ok());
        assert!(ctx.wait_finish(Some(QueueSelector(3))).await.is_err());
    }
}
