// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The buffer registry: shape-keyed reuse of device allocations.
//!
//! Every buffer requested with an owner is recorded in the registry. When
//! its reference count drops to zero it stays registered but unreserved,
//! and the next request with the same [`BufferSpec`] gets it back without
//! touching the device. Buffers requested without an owner are never
//! registered and never reused.
//!
//! Device memory is only returned by an owner's
//! [`release_buffers`](BufferCache::release_buffers), by an eviction sweep
//! under memory pressure, or by a shutdown that times out.

use crate::{Buffer, BufferInfo, CacheError, CacheStats};
use compute_engine::{BufferSpec, ContextHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub(crate) struct CacheInner {
    registry: Mutex<Vec<Buffer>>,
    next_index: AtomicU64,
    stats: Mutex<CacheStats>,
}

impl CacheInner {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Vec<Buffer>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn contains(&self, index: u64) -> bool {
        self.registry().iter().any(|b| b.index() == index)
    }

    pub(crate) fn remove(&self, index: u64) -> Option<Buffer> {
        let mut registry = self.registry();
        let pos = registry.iter().position(|b| b.index() == index)?;
        Some(registry.remove(pos))
    }

    /// Removes every registered buffer matching `pred` and returns them.
    pub(crate) fn take_where(&self, pred: impl Fn(&Buffer) -> bool) -> Vec<Buffer> {
        let mut registry = self.registry();
        let (taken, kept) = std::mem::take(&mut *registry)
            .into_iter()
            .partition(|b| pred(b));
        *registry = kept;
        taken
    }
}

/// A registry of device buffers for one context.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct BufferCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry: Mutex::new(Vec::new()),
                next_index: AtomicU64::new(0),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    /// Returns a buffer of shape `spec`, reusing a free registered one when
    /// possible.
    ///
    /// With an `owner`, an unreserved registered buffer of identical shape
    /// is revived for the new owner; otherwise a new allocation is made
    /// (evicting unreserved buffers and retrying once if the device is out
    /// of memory) and registered. Without an owner the buffer is always
    /// newly allocated and never registered; the caller must
    /// [`free`](Buffer::free) it.
    pub async fn create_buffer(
        &self,
        handle: &dyn ContextHandle,
        spec: BufferSpec,
        owner: Option<&str>,
    ) -> Result<Buffer, CacheError> {
        spec.validate()?;

        if let Some(owner) = owner {
            if let Some(buffer) = self.try_reuse(&spec, owner) {
                return Ok(buffer);
            }
        }

        let spec_ref = &spec;
        let started = Instant::now();
        let native = match self
            .check_alloc(move || handle.create_buffer(spec_ref))
            .await
        {
            Ok(native) => native,
            Err(err) => {
                self.inner.stats().record_failure();
                tracing::error!(
                    "allocation of {spec} for {} failed: {err}",
                    owner.unwrap_or("<untracked>")
                );
                return Err(err.into());
            }
        };
        let creation_time = started.elapsed();

        let index = self.inner.next_index.fetch_add(1, Ordering::Relaxed);
        let buffer = Buffer::new(
            index,
            spec,
            creation_time,
            native,
            owner.map(str::to_string),
            Arc::downgrade(&self.inner),
        );

        let registered_bytes = owner.map(|_| {
            let mut registry = self.inner.registry();
            registry.push(buffer.clone());
            registry.iter().map(Buffer::num_bytes).sum::<usize>()
        });
        {
            let mut stats = self.inner.stats();
            stats.record_miss();
            if let Some(bytes) = registered_bytes {
                stats.update_peak(bytes);
            }
        }

        tracing::debug!(
            "allocated buffer {index} for {}: {spec} in {creation_time:?}",
            owner.unwrap_or("<untracked>")
        );
        Ok(buffer)
    }

    /// Claims the first free registered buffer of shape `spec`.
    ///
    /// The scan and the claim happen under one registry lock, so two
    /// concurrent requests never revive the same buffer.
    fn try_reuse(&self, spec: &BufferSpec, owner: &str) -> Option<Buffer> {
        let (buffer, previous) = {
            let registry = self.inner.registry();
            registry
                .iter()
                .find_map(|b| b.try_claim(spec, owner).map(|prev| (b.clone(), prev)))?
        };
        self.inner.stats().record_hit();
        tracing::debug!(
            "reusing buffer {} for {owner} (previously {previous}): {spec}",
            buffer.index()
        );
        Some(buffer)
    }

    /// Frees and unregisters every buffer owned by `owner`, reserved or not.
    ///
    /// Returns how many buffers were released.
    pub fn release_buffers(&self, owner: &str) -> usize {
        let released = self.inner.take_where(|b| b.is_owned_by(owner));
        let bytes: usize = released.iter().map(Buffer::num_bytes).sum();
        for buffer in &released {
            buffer.free_native();
        }
        self.inner.stats().record_owner_release(released.len());

        if !released.is_empty() {
            tracing::info!(
                "released {} buffer(s) ({bytes} bytes) owned by {owner}",
                released.len()
            );
        }
        released.len()
    }

    /// Frees and unregisters every unreserved buffer.
    pub(crate) fn evict_unreserved(&self) -> usize {
        let evicted = self.inner.take_where(Buffer::is_evictable);
        for buffer in &evicted {
            buffer.free_native();
        }
        evicted.len()
    }

    /// Unregisters `buffer` and frees its allocation unless already freed.
    pub(crate) fn discard(&self, buffer: &Buffer) {
        self.inner.remove(buffer.index());
        buffer.free_native();
    }

    /// Frees and unregisters every buffer, reserved or not.
    pub(crate) fn free_all(&self) -> usize {
        let all = self.inner.take_where(|_| true);
        for buffer in &all {
            tracing::debug!(
                "force-freeing buffer {} owned by {}",
                buffer.index(),
                buffer.owner().unwrap_or_default()
            );
            buffer.free_native();
        }
        self.inner.stats().record_forced_frees(all.len());
        all.len()
    }

    /// Writes one line per registered buffer to the log.
    pub fn log_buffers(&self) {
        let buffers = self.buffers();
        let total: usize = buffers.iter().map(|b| b.num_bytes).sum();
        tracing::info!(
            "{} registered buffer(s), {:.2} MB",
            buffers.len(),
            total as f64 / (1024.0 * 1024.0)
        );
        for info in &buffers {
            tracing::info!("{info}");
        }
    }

    /// Snapshots of all registered buffers, in creation order.
    pub fn buffers(&self) -> Vec<BufferInfo> {
        let registry = self.inner.registry().clone();
        registry.iter().map(Buffer::info).collect()
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry().is_empty()
    }

    /// Total bytes held by registered buffers.
    pub fn registered_bytes(&self) -> usize {
        self.inner.registry().iter().map(Buffer::num_bytes).sum()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats().clone()
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("registered", &self.len())
            .field("registered_bytes", &self.registered_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_engine::sim::SimEngine;
    use compute_engine::{BufDir, ComputeEngine, ImageDims, MemoryKind, MemorySize};

    async fn setup(capacity: MemorySize) -> (SimEngine, Arc<dyn ContextHandle>, BufferCache) {
        let engine = SimEngine::single_device(capacity);
        let handle = engine.create_context(None, None, 1).await.unwrap();
        (engine, handle, BufferCache::new())
    }

    fn rw(bytes: usize) -> BufferSpec {
        BufferSpec::new(bytes, BufDir::ReadWrite, MemoryKind::None)
    }

    #[tokio::test]
    async fn test_released_buffer_is_reused() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;

        let a = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        a.release();
        let b = cache.create_buffer(&*handle, rw(1024), Some("b")).await.unwrap();

        assert!(a.same_as(&b));
        assert_eq!(b.owner().as_deref(), Some("b"));
        assert!(b.is_reserved());
        assert_eq!(b.refs(), 1);
        assert_eq!(engine.live_allocations(), 1);

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_reserved_buffer_is_not_reused() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;

        let a = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        let b = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        assert!(!a.same_as(&b));
        assert_eq!(engine.live_allocations(), 2);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_not_reused() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(64)).await;

        let a = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        a.release();
        let shapes = [
            rw(2048),
            BufferSpec::new(1024, BufDir::ReadOnly, MemoryKind::None),
            BufferSpec::new(1024, BufDir::ReadWrite, MemoryKind::Coarse),
            rw(1024).with_image_dims(ImageDims::new(16, 16)),
        ];
        for spec in shapes {
            let b = cache.create_buffer(&*handle, spec, Some("b")).await.unwrap();
            assert!(!a.same_as(&b), "{spec} must not reuse {}", a.spec());
        }
    }

    #[tokio::test]
    async fn test_indices_strictly_increase() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let mut last = None;
        for owner in [Some("a"), None, Some("b"), None] {
            let buf = cache.create_buffer(&*handle, rw(64), owner).await.unwrap();
            if let Some(prev) = last {
                assert!(buf.index() > prev);
            }
            last = Some(buf.index());
        }
    }

    #[tokio::test]
    async fn test_untracked_buffers_are_not_registered() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;

        let buf = cache.create_buffer(&*handle, rw(512), None).await.unwrap();
        assert!(cache.is_empty());
        buf.release();

        let again = cache.create_buffer(&*handle, rw(512), None).await.unwrap();
        assert!(!buf.same_as(&again));

        buf.free();
        again.free();
        assert_eq!(engine.live_allocations(), 0);
    }

    #[tokio::test]
    async fn test_validation_before_allocation() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let err = cache.create_buffer(&*handle, rw(0), Some("a")).await.unwrap_err();
        assert!(matches!(err, CacheError::Validation(_)));
        assert_eq!(engine.live_allocations(), 0);
        assert_eq!(cache.stats().requests, 0);
    }

    #[tokio::test]
    async fn test_release_buffers_is_owner_scoped() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;

        let a1 = cache.create_buffer(&*handle, rw(256), Some("a")).await.unwrap();
        let a2 = cache.create_buffer(&*handle, rw(512), Some("a")).await.unwrap();
        a2.release();
        let b = cache.create_buffer(&*handle, rw(256), Some("b")).await.unwrap();

        assert_eq!(cache.release_buffers("a"), 2);
        assert!(a1.is_freed());
        assert!(a2.is_freed());
        assert!(!b.is_freed());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.buffers()[0].owner.as_deref(), Some("b"));
        assert_eq!(engine.live_allocations(), 1);

        assert_eq!(cache.release_buffers("a"), 0);
        assert_eq!(cache.stats().owner_releases, 2);
    }

    #[tokio::test]
    async fn test_free_unregisters() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let a = cache.create_buffer(&*handle, rw(256), Some("a")).await.unwrap();
        a.free();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_add_ref_after_release_buffers() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let a = cache.create_buffer(&*handle, rw(256), Some("a")).await.unwrap();
        cache.release_buffers("a");
        // logged, not fatal
        a.add_ref();
        assert_eq!(a.refs(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_registered_bytes_and_peak() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let _a = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        let _b = cache.create_buffer(&*handle, rw(2048), Some("b")).await.unwrap();
        assert_eq!(cache.registered_bytes(), 3072);
        cache.release_buffers("b");
        assert_eq!(cache.registered_bytes(), 1024);
        assert_eq!(cache.stats().peak_registered_bytes, 3072);
        cache.log_buffers();
    }

    #[tokio::test]
    async fn test_free_all() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(64)).await;
        let _a = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        let _b = cache.create_buffer(&*handle, rw(1024), Some("b")).await.unwrap();
        assert_eq!(cache.free_all(), 2);
        assert!(cache.is_empty());
        assert_eq!(engine.allocated_bytes(), 0);
        assert_eq!(cache.stats().forced_frees, 2);
    }
}
