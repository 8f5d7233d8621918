// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reference-counted device buffers.
//!
//! A [`Buffer`] is a cheap, cloneable handle. Clones share one record: the
//! immutable shape of the allocation, the device allocation itself, and the
//! mutable bookkeeping (owner, reservation flag, reference count and the
//! caller's timestamps).
//!
//! Reference counting here is *advisory*. It decides when a registered
//! buffer becomes eligible for reuse; it does not free memory. Misuse is
//! logged and tolerated, never raised as an error.

use crate::cache::CacheInner;
use crate::CacheError;
use compute_engine::{
    BufDir, BufferSpec, HostAccess, ImageDims, KernelArg, MemoryKind, NativeBuffer, QueueSelector,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

#[derive(Debug)]
struct BufferState {
    owner: Option<String>,
    reserved: bool,
    refs: u32,
    timestamp: i64,
    loadstamp: i64,
}

struct BufferInner {
    index: u64,
    spec: BufferSpec,
    creation_time: Duration,
    native: Mutex<Option<Arc<dyn NativeBuffer>>>,
    state: Mutex<BufferState>,
    cache: Weak<CacheInner>,
}

/// A device buffer handed out by the cache.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

/// A point-in-time snapshot of one buffer, for logging and reporting.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BufferInfo {
    pub index: u64,
    pub owner: Option<String>,
    pub num_bytes: usize,
    pub direction: BufDir,
    pub memory_kind: MemoryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dims: Option<ImageDims>,
    pub reserved: bool,
    pub refs: u32,
    pub timestamp: i64,
    pub loadstamp: i64,
    /// Allocation latency in microseconds.
    pub creation_time_us: u128,
}

impl Buffer {
    /// A freshly allocated buffer: reserved, with one reference.
    pub(crate) fn new(
        index: u64,
        spec: BufferSpec,
        creation_time: Duration,
        native: Arc<dyn NativeBuffer>,
        owner: Option<String>,
        cache: Weak<CacheInner>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                index,
                spec,
                creation_time,
                native: Mutex::new(Some(native)),
                state: Mutex::new(BufferState {
                    owner,
                    reserved: true,
                    refs: 1,
                    timestamp: 0,
                    loadstamp: 0,
                }),
                cache,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn native_slot(&self) -> MutexGuard<'_, Option<Arc<dyn NativeBuffer>>> {
        self.inner
            .native
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creation order, unique per cache.
    pub fn index(&self) -> u64 {
        self.inner.index
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.inner.spec
    }

    pub fn num_bytes(&self) -> usize {
        self.inner.spec.num_bytes
    }

    pub fn direction(&self) -> BufDir {
        self.inner.spec.direction
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.inner.spec.memory_kind
    }

    pub fn image_dims(&self) -> Option<ImageDims> {
        self.inner.spec.image_dims
    }

    /// How long the device allocation took.
    pub fn creation_time(&self) -> Duration {
        self.inner.creation_time
    }

    /// The current owner label. `None` for untracked buffers.
    pub fn owner(&self) -> Option<String> {
        self.state().owner.clone()
    }

    pub fn is_reserved(&self) -> bool {
        self.state().reserved
    }

    pub fn refs(&self) -> u32 {
        self.state().refs
    }

    /// Caller-managed timestamp, not interpreted by the cache.
    pub fn timestamp(&self) -> i64 {
        self.state().timestamp
    }

    pub fn set_timestamp(&self, timestamp: i64) {
        self.state().timestamp = timestamp;
    }

    /// Caller-managed marker of the last content load.
    pub fn loadstamp(&self) -> i64 {
        self.state().loadstamp
    }

    pub fn set_loadstamp(&self, loadstamp: i64) {
        self.state().loadstamp = loadstamp;
    }

    /// Whether the device allocation has been freed.
    pub fn is_freed(&self) -> bool {
        self.native_slot().is_none()
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_as(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_registered(&self) -> bool {
        self.inner
            .cache
            .upgrade()
            .map(|cache| cache.contains(self.inner.index))
            .unwrap_or(false)
    }

    /// Takes an additional reference.
    ///
    /// Logs an error if the buffer is untracked or no longer registered,
    /// and a warning if it was not reserved. Either way the count is
    /// incremented and the buffer is reserved again.
    pub fn add_ref(&self) {
        let registered = self.is_registered();
        let mut state = self.state();
        if !registered {
            tracing::error!(
                "add_ref on {} buffer {} ({} bytes, owner {})",
                if state.owner.is_some() { "released" } else { "untracked" },
                self.inner.index,
                self.num_bytes(),
                owner_label(&state.owner),
            );
        }
        if !state.reserved {
            tracing::warn!(
                "add_ref on unreserved buffer {} ({} bytes, owner {})",
                self.inner.index,
                self.num_bytes(),
                owner_label(&state.owner),
            );
            state.reserved = true;
        }
        state.refs = state.refs.saturating_add(1);
    }

    /// Drops one reference. At zero the buffer becomes available for reuse.
    ///
    /// Releasing an unreserved buffer logs a warning; the count never goes
    /// below zero.
    pub fn release(&self) {
        let mut state = self.state();
        if !state.reserved {
            tracing::warn!(
                "release of unreserved buffer {} ({} bytes, owner {}, refs {})",
                self.inner.index,
                self.num_bytes(),
                owner_label(&state.owner),
                state.refs,
            );
        }
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            state.reserved = false;
        }
    }

    /// Claims the buffer for `owner` if it is free and has shape `spec`.
    pub(crate) fn try_claim(&self, spec: &BufferSpec, owner: &str) -> Option<String> {
        if self.inner.spec != *spec {
            return None;
        }
        let mut state = self.state();
        if state.reserved {
            return None;
        }
        let previous = state.owner.replace(owner.to_string());
        state.reserved = true;
        state.refs = 1;
        state.timestamp = 0;
        state.loadstamp = 0;
        Some(previous.unwrap_or_default())
    }

    /// Whether the registry may hand this buffer to a new request.
    pub(crate) fn is_evictable(&self) -> bool {
        !self.state().reserved
    }

    pub(crate) fn is_owned_by(&self, owner: &str) -> bool {
        self.state().owner.as_deref() == Some(owner)
    }

    /// Frees the device allocation, once. Returns whether this call freed it.
    pub(crate) fn free_native(&self) -> bool {
        let native = self.native_slot().take();
        match native {
            Some(native) => {
                native.free();
                true
            }
            None => false,
        }
    }

    /// Frees the device allocation now.
    ///
    /// This is how untracked buffers are disposed of. A registered buffer
    /// is removed from its cache first so it can never be handed out again.
    pub fn free(&self) {
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.remove(self.inner.index);
        }
        if !self.free_native() {
            tracing::warn!("buffer {} freed twice", self.inner.index);
        }
    }

    /// The underlying device allocation.
    pub fn native(&self) -> Result<Arc<dyn NativeBuffer>, CacheError> {
        self.native_slot()
            .as_ref()
            .map(Arc::clone)
            .ok_or(CacheError::BufferFreed {
                index: self.inner.index,
            })
    }

    /// This buffer as a kernel argument.
    pub fn kernel_arg(&self) -> Result<KernelArg, CacheError> {
        Ok(KernelArg::Buffer(self.native()?))
    }

    /// Makes the buffer visible to the host, optionally copying `source`
    /// in first. See [`NativeBuffer::host_access`].
    pub async fn host_access(
        &self,
        access: HostAccess,
        queue: Option<QueueSelector>,
        source: Option<&[u8]>,
    ) -> Result<(), CacheError> {
        let native = self.native()?;
        native.host_access(access, queue, source).await?;
        Ok(())
    }

    pub fn info(&self) -> BufferInfo {
        let state = self.state();
        let spec = &self.inner.spec;
        BufferInfo {
            index: self.inner.index,
            owner: state.owner.clone(),
            num_bytes: spec.num_bytes,
            direction: spec.direction,
            memory_kind: spec.memory_kind,
            image_dims: spec.image_dims,
            reserved: state.reserved,
            refs: state.refs,
            timestamp: state.timestamp,
            loadstamp: state.loadstamp,
            creation_time_us: self.inner.creation_time.as_micros(),
        }
    }
}

fn owner_label(owner: &Option<String>) -> &str {
    owner.as_deref().unwrap_or("<untracked>")
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Buffer")
            .field("index", &self.inner.index)
            .field("spec", &self.inner.spec)
            .field("owner", &state.owner)
            .field("reserved", &state.reserved)
            .field("refs", &state.refs)
            .finish()
    }
}

impl fmt::Display for BufferInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} bytes {}",
            self.index,
            self.owner.as_deref().unwrap_or("<untracked>"),
            self.num_bytes,
            if self.reserved { "reserved" } else { "available" },
        )
    }
}
