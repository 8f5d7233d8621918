// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Host-backed simulated device buffers.

use super::DeviceMemory;
use crate::{BufferSpec, EngineError, HostAccess, NativeBuffer, QueueSelector};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct SimBufferState {
    data: Vec<u8>,
    access: HostAccess,
    freed: bool,
}

/// A simulated device allocation.
///
/// Device memory is returned when the buffer is freed, or when it is
/// dropped without having been freed.
#[derive(Debug)]
pub struct SimBuffer {
    spec: BufferSpec,
    num_queues: u32,
    memory: Arc<DeviceMemory>,
    state: Mutex<SimBufferState>,
}

impl SimBuffer {
    pub(crate) fn new(spec: BufferSpec, num_queues: u32, memory: Arc<DeviceMemory>) -> Self {
        Self {
            spec,
            num_queues,
            memory,
            state: Mutex::new(SimBufferState {
                data: vec![0u8; spec.num_bytes],
                access: HostAccess::ReadWrite,
                freed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimBufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    /// A copy of the buffer's bytes. Empty once freed.
    pub fn contents(&self) -> Vec<u8> {
        self.state().data.clone()
    }

    /// The host access most recently granted.
    pub fn host_access_mode(&self) -> HostAccess {
        self.state().access
    }

    pub fn is_freed(&self) -> bool {
        self.state().freed
    }

    fn release(state: &mut SimBufferState, memory: &DeviceMemory, num_bytes: usize) -> bool {
        if state.freed {
            return false;
        }
        state.freed = true;
        state.data = Vec::new();
        state.access = HostAccess::None;
        memory.release(num_bytes);
        true
    }
}

#[async_trait]
impl NativeBuffer for SimBuffer {
    fn num_bytes(&self) -> usize {
        self.spec.num_bytes
    }

    fn free(&self) {
        let mut state = self.state();
        if !Self::release(&mut state, &self.memory, self.spec.num_bytes) {
            tracing::warn!("sim buffer of {} bytes freed twice", self.spec.num_bytes);
        }
    }

    async fn host_access(
        &self,
        access: HostAccess,
        queue: Option<QueueSelector>,
        source: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        if let Some(q) = queue {
            q.check(self.num_queues)?;
        }
        {
            let mut state = self.state();
            if state.freed {
                return Err(EngineError::HostAccess(
                    "buffer allocation has been freed".into(),
                ));
            }
            if let Some(src) = source {
                if !access.is_writable() {
                    return Err(EngineError::Validation(format!(
                        "a source copy requires writable host access, got {access:?}"
                    )));
                }
                if src.len() > self.spec.num_bytes {
                    return Err(EngineError::Validation(format!(
                        "source of {} bytes does not fit a buffer of {} bytes",
                        src.len(),
                        self.spec.num_bytes
                    )));
                }
                state.data[..src.len()].copy_from_slice(src);
            }
            state.access = access;
        }
        tokio::task::yield_now().await;
        Ok(())
    }
}

impl Drop for SimBuffer {
    fn drop(&mut self) {
        let num_bytes = self.spec.num_bytes;
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        Self::release(state, &self.memory, num_bytes);
    }
}
