// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! An in-process simulated compute engine.
//!
//! [`SimEngine`] models a set of platforms and devices, each device with a
//! fixed byte capacity. Allocations beyond the capacity fail with
//! [`EngineError::OutOfMemory`], exactly like a real device under pressure,
//! which makes the buffer cache's eviction path testable without hardware.
//!
//! Out-of-memory failures can also be injected on demand with
//! [`SimEngine::fail_next_allocations`] and [`SimEngine::fail_next_runs`].
//!
//! Buffers are backed by host memory; [`SimBuffer::contents`] exposes the
//! bytes so host-access copies can be checked.

mod buffer;
mod context;
mod program;

pub use buffer::SimBuffer;
pub use context::SimContext;
pub use program::SimProgram;

use crate::{ComputeEngine, ContextHandle, EngineError, MemorySize};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Byte accounting for one simulated device, shared by every context and
/// buffer created on it.
#[derive(Debug)]
pub(crate) struct DeviceMemory {
    capacity: usize,
    allocated: AtomicUsize,
    live: AtomicUsize,
    frees: AtomicU64,
}

impl DeviceMemory {
    fn new(capacity: MemorySize) -> Self {
        Self {
            capacity: capacity.as_bytes(),
            allocated: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            frees: AtomicU64::new(0),
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.allocated.load(Ordering::Acquire))
    }

    pub(crate) fn out_of_memory(&self, requested_bytes: usize) -> EngineError {
        EngineError::OutOfMemory {
            requested_bytes,
            available_bytes: self.available(),
            capacity_bytes: self.capacity,
        }
    }

    /// Claims `bytes` of device memory, failing if the capacity would be
    /// exceeded.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<(), EngineError> {
        let capacity = self.capacity;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= capacity)
            })
            .map_err(|current| EngineError::OutOfMemory {
                requested_bytes: bytes,
                available_bytes: capacity.saturating_sub(current),
                capacity_bytes: capacity,
            })?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::AcqRel);
    }
}

/// Pending injected failures.
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    allocations: AtomicUsize,
    runs: AtomicUsize,
}

impl FaultPlan {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn take_allocation(&self) -> bool {
        Self::take(&self.allocations)
    }

    pub(crate) fn take_run(&self) -> bool {
        Self::take(&self.runs)
    }
}

/// A simulated device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    memory: Arc<DeviceMemory>,
}

impl SimDevice {
    pub fn new(name: impl Into<String>, capacity: MemorySize) -> Self {
        Self {
            name: name.into(),
            memory: Arc::new(DeviceMemory::new(capacity)),
        }
    }

    pub fn capacity(&self) -> MemorySize {
        MemorySize::from_bytes(self.memory.capacity)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.memory.allocated.load(Ordering::Acquire)
    }
}

/// A simulated platform holding one or more devices.
#[derive(Debug, Clone)]
pub struct SimPlatform {
    pub name: String,
    pub devices: Vec<SimDevice>,
}

impl SimPlatform {
    pub fn new(name: impl Into<String>, devices: Vec<SimDevice>) -> Self {
        Self {
            name: name.into(),
            devices,
        }
    }
}

/// The simulated engine.
///
/// # Example
/// ```
/// use compute_engine::sim::SimEngine;
/// use compute_engine::MemorySize;
///
/// let engine = SimEngine::single_device(MemorySize::from_mb(16));
/// assert_eq!(engine.capacity_bytes(), 16 * 1024 * 1024);
/// assert_eq!(engine.allocated_bytes(), 0);
/// ```
#[derive(Debug)]
pub struct SimEngine {
    platforms: Vec<SimPlatform>,
    faults: Arc<FaultPlan>,
}

impl SimEngine {
    pub fn new(platforms: Vec<SimPlatform>) -> Self {
        Self {
            platforms,
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// One platform with one device of the given capacity.
    pub fn single_device(capacity: MemorySize) -> Self {
        Self::new(vec![SimPlatform::new(
            "sim",
            vec![SimDevice::new("sim-device-0", capacity)],
        )])
    }

    pub fn platforms(&self) -> &[SimPlatform] {
        &self.platforms
    }

    /// Makes the next `n` buffer allocations fail with out-of-memory,
    /// regardless of free capacity.
    pub fn fail_next_allocations(&self, n: usize) {
        self.faults.allocations.fetch_add(n, Ordering::AcqRel);
    }

    /// Makes the next `n` program runs fail with out-of-memory.
    pub fn fail_next_runs(&self, n: usize) {
        self.faults.runs.fetch_add(n, Ordering::AcqRel);
    }

    fn devices(&self) -> impl Iterator<Item = &SimDevice> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }

    /// Total capacity across all devices.
    pub fn capacity_bytes(&self) -> usize {
        self.devices().map(|d| d.memory.capacity).sum()
    }

    /// Bytes currently allocated across all devices.
    pub fn allocated_bytes(&self) -> usize {
        self.devices().map(SimDevice::allocated_bytes).sum()
    }

    /// Number of device allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.devices()
            .map(|d| d.memory.live.load(Ordering::Acquire))
            .sum()
    }

    /// Number of device allocations freed so far.
    pub fn total_frees(&self) -> u64 {
        self.devices()
            .map(|d| d.memory.frees.load(Ordering::Acquire))
            .sum()
    }

    /// Opens a context and returns it with its concrete type, so that
    /// tests can reach [`SimBuffer`]s directly.
    pub async fn open(
        &self,
        platform_index: Option<u32>,
        device_index: Option<u32>,
        num_queues: u32,
    ) -> Result<SimContext, EngineError> {
        if !(1..=3).contains(&num_queues) {
            return Err(EngineError::validation(format!(
                "numQueues must be between 1 and 3, got {num_queues}"
            )));
        }
        let (pi, di, device) = self.resolve_device(platform_index, device_index)?;
        tokio::task::yield_now().await;

        tracing::debug!(
            "sim context created on platform {pi}, device {di} ('{}', {} capacity, {num_queues} queue(s))",
            device.name,
            device.capacity(),
        );
        Ok(SimContext::new(
            pi,
            di,
            num_queues,
            Arc::clone(&device.memory),
            Arc::clone(&self.faults),
        ))
    }

    fn resolve_device(
        &self,
        platform_index: Option<u32>,
        device_index: Option<u32>,
    ) -> Result<(u32, u32, &SimDevice), EngineError> {
        let (pi, di) = match (platform_index, device_index) {
            (Some(pi), Some(di)) => (pi, di),
            (None, None) => {
                let first = self
                    .platforms
                    .iter()
                    .position(|p| !p.devices.is_empty())
                    .ok_or_else(|| EngineError::validation("failed to find a device on this system"))?;
                (first as u32, 0)
            }
            (None, Some(_)) => {
                return Err(EngineError::validation(
                    "configuration parameters must have platformIndex",
                ))
            }
            (Some(_), None) => {
                return Err(EngineError::validation(
                    "configuration parameters must have deviceIndex",
                ))
            }
        };

        let platform = self.platforms.get(pi as usize).ok_or_else(|| {
            EngineError::validation(format!(
                "platformIndex {pi} is larger than the available number of platforms ({})",
                self.platforms.len()
            ))
        })?;
        let device = platform.devices.get(di as usize).ok_or_else(|| {
            EngineError::validation(format!(
                "deviceIndex {di} is larger than the available number of devices for platform {pi}"
            ))
        })?;
        Ok((pi, di, device))
    }
}

#[async_trait]
impl ComputeEngine for SimEngine {
    async fn create_context(
        &self,
        platform_index: Option<u32>,
        device_index: Option<u32>,
        num_queues: u32,
    ) -> Result<Arc<dyn ContextHandle>, EngineError> {
        let ctx = self.open(platform_index, device_index, num_queues).await?;
        Ok(Arc::new(ctx))
    }
}
