// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Out-of-memory recovery.

use crate::BufferCache;
use compute_engine::EngineError;
use std::future::Future;

impl BufferCache {
    /// Runs a device operation, recovering once from out-of-memory.
    ///
    /// If `operation` fails with [`EngineError::OutOfMemory`], every
    /// unreserved registered buffer is freed and `operation` runs a second
    /// time; that second outcome is returned as is. Reserved buffers are
    /// never touched. Any other failure is returned without retrying.
    pub async fn check_alloc<T, F, Fut>(&self, mut operation: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match operation().await {
            Err(err) if err.is_out_of_memory() => {
                let evicted = self.evict_unreserved();
                self.inner.stats().record_oom_retry(evicted);
                tracing::warn!(
                    "failed to allocate device memory ({err}) - freed {evicted} unreserved \
                     allocation(s), retrying"
                );
                operation().await
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_engine::sim::SimEngine;
    use compute_engine::{
        BufDir, BufferSpec, ComputeEngine, ContextHandle, MemoryKind, MemorySize,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rw(bytes: usize) -> BufferSpec {
        BufferSpec::new(bytes, BufDir::ReadWrite, MemoryKind::None)
    }

    async fn setup(capacity: MemorySize) -> (SimEngine, Arc<dyn ContextHandle>, BufferCache) {
        let engine = SimEngine::single_device(capacity);
        let handle = engine.create_context(None, None, 1).await.unwrap();
        (engine, handle, BufferCache::new())
    }

    #[tokio::test]
    async fn test_eviction_frees_only_unreserved() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(16)).await;

        let r1 = cache.create_buffer(&*handle, rw(4096), Some("a")).await.unwrap();
        let u1 = cache.create_buffer(&*handle, rw(4096), Some("a")).await.unwrap();
        let u2 = cache.create_buffer(&*handle, rw(4096), Some("b")).await.unwrap();
        u1.release();
        u2.release();

        // 4 KiB free, 8 KiB needed: only evicting U1 and U2 makes room
        let big = cache.create_buffer(&*handle, rw(8192), Some("c")).await.unwrap();

        assert!(!r1.is_freed());
        assert!(u1.is_freed());
        assert!(u2.is_freed());
        assert!(!big.is_freed());
        assert_eq!(cache.len(), 2);
        assert_eq!(engine.allocated_bytes(), 4096 + 8192);

        let stats = cache.stats();
        assert_eq!(stats.oom_retries, 1);
        assert_eq!(stats.evicted_buffers, 2);
    }

    #[tokio::test]
    async fn test_double_failure_keeps_reserved() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(16)).await;

        let r1 = cache.create_buffer(&*handle, rw(8192), Some("a")).await.unwrap();
        let err = cache
            .create_buffer(&*handle, rw(12 * 1024), Some("b"))
            .await
            .unwrap_err();

        assert!(err.is_out_of_memory());
        assert!(!r1.is_freed());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().failed_allocations, 1);
    }

    #[tokio::test]
    async fn test_retries_exactly_once() {
        let (_engine, _handle, cache) = setup(MemorySize::from_kb(16)).await;
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: Result<(), EngineError> = cache
            .check_alloc(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::OutOfMemory {
                    requested_bytes: 1,
                    available_bytes: 0,
                    capacity_bytes: 0,
                })
            })
            .await;

        assert!(result.unwrap_err().is_out_of_memory());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (_engine, handle, cache) = setup(MemorySize::from_kb(16)).await;
        let spare = cache.create_buffer(&*handle, rw(1024), Some("a")).await.unwrap();
        spare.release();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: Result<(), EngineError> = cache
            .check_alloc(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Execution("kernel fault".into()))
            })
            .await;

        assert!(matches!(result, Err(EngineError::Execution(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!spare.is_freed(), "no eviction without memory pressure");
    }

    #[tokio::test]
    async fn test_injected_oom_recovers() {
        let (engine, handle, cache) = setup(MemorySize::from_kb(16)).await;
        engine.fail_next_allocations(1);
        let buf = cache.create_buffer(&*handle, rw(1024), Some("a")).await;
        assert!(buf.is_ok());
        assert_eq!(cache.stats().oom_retries, 1);
    }
}
