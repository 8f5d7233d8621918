// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The compute context: one device, its queues, and its buffer cache.
//!
//! ```text
//!  Uninitialized ──initialise()──▶ Initialized ──close()──▶ Closing ──▶ Closed
//!                                                              │
//!                                        owners release, or the timeout
//!                                        force-frees what is left
//! ```
//!
//! While `Closing`, new buffer requests are refused with
//! [`CacheError::Closing`]. Everything that lets owners finish and let go
//! (release, host access, program runs, queue waits) keeps working.

use crate::{Buffer, BufferCache, BufferInfo, CacheError, CacheStats, ContextConfig};
use compute_engine::{
    BufDir, BufferSpec, CommandQueues, ComputeEngine, ContextHandle, ImageDims, KernelParams,
    MemoryKind, Program, ProgramOptions, QueueSelector, RunTimings,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ── Lifecycle ──────────────────────────────────────────────────

/// Lifecycle state of a [`ClContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ContextState {
    Uninitialized,
    Initialized,
    Closing,
    Closed,
}

/// How a [`ClContext::close`] completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Every owner released its buffers before the timeout.
    Drained,
    /// The timeout expired and the remaining buffers were freed.
    TimedOut { forced_frees: usize },
}

struct Lifecycle {
    state: ContextState,
    handle: Option<Arc<dyn ContextHandle>>,
}

// ── Context ────────────────────────────────────────────────────

/// A device context with a shared buffer cache.
///
/// Share it between tasks behind an [`Arc`]; every method takes `&self`.
///
/// # Example
/// ```
/// use buffer_cache::{ClContext, ContextConfig};
/// use compute_engine::sim::SimEngine;
/// use compute_engine::{BufDir, MemoryKind, MemorySize};
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let engine = Arc::new(SimEngine::single_device(MemorySize::from_mb(64)));
///     let ctx = ClContext::connect(engine, ContextConfig::default()).await.unwrap();
///
///     let frame = ctx
///         .create_buffer(1 << 20, BufDir::WriteOnly, MemoryKind::None, None, Some("decoder"))
///         .await
///         .unwrap();
///     frame.release();
///
///     let again = ctx
///         .create_buffer(1 << 20, BufDir::WriteOnly, MemoryKind::None, None, Some("scaler"))
///         .await
///         .unwrap();
///     assert!(frame.same_as(&again));
///
///     ctx.release_buffers("scaler");
///     ctx.close().await.unwrap();
/// });
/// ```
pub struct ClContext {
    config: ContextConfig,
    engine: Arc<dyn ComputeEngine>,
    lifecycle: Mutex<Lifecycle>,
    cache: BufferCache,
}

impl ClContext {
    /// Creates an uninitialised context. Call
    /// [`initialise`](Self::initialise) before use.
    pub fn new(engine: Arc<dyn ComputeEngine>, config: ContextConfig) -> Self {
        Self {
            config,
            engine,
            lifecycle: Mutex::new(Lifecycle {
                state: ContextState::Uninitialized,
                handle: None,
            }),
            cache: BufferCache::new(),
        }
    }

    /// Creates and initialises a context in one step.
    pub async fn connect(
        engine: Arc<dyn ComputeEngine>,
        config: ContextConfig,
    ) -> Result<Self, CacheError> {
        let ctx = Self::new(engine, config);
        ctx.initialise().await?;
        Ok(ctx)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the device context described by the configuration.
    ///
    /// Does nothing if already initialised. A closed context cannot be
    /// initialised again.
    pub async fn initialise(&self) -> Result<(), CacheError> {
        self.config.validate()?;
        match self.state() {
            ContextState::Initialized => return Ok(()),
            ContextState::Closing => return Err(CacheError::Closing),
            ContextState::Closed => return Err(CacheError::NotInitialized),
            ContextState::Uninitialized => {}
        }

        let handle = self
            .engine
            .create_context(
                self.config.platform_index,
                self.config.device_index,
                self.config.num_queues(),
            )
            .await?;

        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            ContextState::Uninitialized => {
                tracing::info!(
                    "compute context initialised on platform {} device {} with {} queue(s)",
                    handle.platform_index(),
                    handle.device_index(),
                    handle.num_queues()
                );
                lifecycle.handle = Some(handle);
                lifecycle.state = ContextState::Initialized;
                Ok(())
            }
            // A concurrent initialise got there first.
            ContextState::Initialized => Ok(()),
            ContextState::Closing => Err(CacheError::Closing),
            ContextState::Closed => Err(CacheError::NotInitialized),
        }
    }

    pub fn state(&self) -> ContextState {
        self.lifecycle().state
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The underlying buffer cache.
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// The device handle, while initialised or closing.
    fn handle(&self) -> Result<Arc<dyn ContextHandle>, CacheError> {
        let lifecycle = self.lifecycle();
        match (&lifecycle.state, &lifecycle.handle) {
            (ContextState::Initialized | ContextState::Closing, Some(handle)) => {
                Ok(Arc::clone(handle))
            }
            _ => Err(CacheError::NotInitialized),
        }
    }

    /// The device handle, only while new allocations are accepted.
    fn allocation_handle(&self) -> Result<Arc<dyn ContextHandle>, CacheError> {
        let lifecycle = self.lifecycle();
        match (&lifecycle.state, &lifecycle.handle) {
            (ContextState::Initialized, Some(handle)) => Ok(Arc::clone(handle)),
            (ContextState::Closing, _) => Err(CacheError::Closing),
            _ => Err(CacheError::NotInitialized),
        }
    }

    /// Queue roles for this context. See [`CommandQueues::for_queue_count`].
    pub fn queues(&self) -> Result<CommandQueues, CacheError> {
        let handle = self.handle()?;
        Ok(CommandQueues::for_queue_count(handle.num_queues()))
    }

    // ── Buffers ────────────────────────────────────────────────

    /// Returns a buffer of the requested shape, reusing a free registered
    /// buffer when possible. See [`BufferCache::create_buffer`].
    pub async fn create_buffer(
        &self,
        num_bytes: usize,
        direction: BufDir,
        memory_kind: MemoryKind,
        image_dims: Option<ImageDims>,
        owner: Option<&str>,
    ) -> Result<Buffer, CacheError> {
        let mut spec = BufferSpec::new(num_bytes, direction, memory_kind);
        spec.image_dims = image_dims;
        self.create_buffer_spec(spec, owner).await
    }

    /// [`create_buffer`](Self::create_buffer) taking a prepared spec.
    pub async fn create_buffer_spec(
        &self,
        spec: BufferSpec,
        owner: Option<&str>,
    ) -> Result<Buffer, CacheError> {
        let handle = self.allocation_handle()?;
        let buffer = self.cache.create_buffer(&*handle, spec, owner).await?;

        // A close that started during the allocation never saw this buffer.
        if self.state() != ContextState::Initialized {
            tracing::warn!(
                "compute context closed while allocating buffer {} for {}; freeing it",
                buffer.index(),
                owner.unwrap_or("<untracked>")
            );
            self.cache.discard(&buffer);
            return Err(CacheError::Closing);
        }
        Ok(buffer)
    }

    /// Frees every buffer owned by `owner`. Returns how many were freed.
    pub fn release_buffers(&self, owner: &str) -> usize {
        self.cache.release_buffers(owner)
    }

    pub fn log_buffers(&self) {
        self.cache.log_buffers();
    }

    pub fn buffers(&self) -> Vec<BufferInfo> {
        self.cache.buffers()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ── Programs ───────────────────────────────────────────────

    /// Builds a program from kernel source.
    pub async fn create_program(
        &self,
        kernel_source: &str,
        options: ProgramOptions,
    ) -> Result<Arc<dyn Program>, CacheError> {
        let handle = self.allocation_handle()?;
        let program = handle.create_program(kernel_source, options).await?;
        tracing::debug!("built program '{}'", program.name());
        Ok(program)
    }

    /// Runs a program on the default queue.
    pub async fn run_program(
        &self,
        program: &dyn Program,
        params: &KernelParams,
    ) -> Result<RunTimings, CacheError> {
        self.run_program_on(program, params, None).await
    }

    /// Runs a program on `queue`, recovering once from out-of-memory by
    /// evicting unreserved buffers.
    pub async fn run_program_on(
        &self,
        program: &dyn Program,
        params: &KernelParams,
        queue: Option<QueueSelector>,
    ) -> Result<RunTimings, CacheError> {
        let handle = self.handle()?;
        if let Some(queue) = queue {
            queue.check(handle.num_queues())?;
        }
        let timings = self
            .cache
            .check_alloc(move || program.run(params, queue))
            .await?;
        tracing::trace!(
            "kernel '{}' ran in {:?}",
            program.name(),
            timings.total_time
        );
        Ok(timings)
    }

    /// Waits for all work on `queue` (default: queue 0) to finish.
    pub async fn wait_finish(&self, queue: Option<QueueSelector>) -> Result<(), CacheError> {
        let handle = self.handle()?;
        handle.wait_finish(queue).await?;
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────────

    /// Closes the context.
    ///
    /// New allocations are refused from the moment this is called. The
    /// registry is polled every `close_poll_interval_ms` until it is empty
    /// or `close_timeout_ms` expires; on timeout every remaining buffer is
    /// freed. Either way the context ends up `Closed`.
    pub async fn close(&self) -> Result<CloseOutcome, CacheError> {
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ContextState::Initialized => lifecycle.state = ContextState::Closing,
                ContextState::Closing => return Err(CacheError::Closing),
                ContextState::Uninitialized | ContextState::Closed => {
                    return Err(CacheError::NotInitialized)
                }
            }
        }

        let timeout = self.config.close_timeout();
        tracing::info!(
            "closing compute context: waiting up to {timeout:?} for {} registered buffer(s)",
            self.cache.len()
        );

        let outcome = match tokio::time::timeout(timeout, self.drained(self.config.poll_interval()))
            .await
        {
            Ok(()) => {
                tracing::info!("all device allocations have been released");
                CloseOutcome::Drained
            }
            Err(_) => {
                tracing::warn!(
                    "timed out waiting for release of {} device allocation(s)",
                    self.cache.len()
                );
                self.cache.log_buffers();
                let forced_frees = self.cache.free_all();
                CloseOutcome::TimedOut { forced_frees }
            }
        };

        let mut lifecycle = self.lifecycle();
        lifecycle.handle = None;
        lifecycle.state = ContextState::Closed;
        tracing::info!("compute context closed");
        Ok(outcome)
    }

    /// Resolves once the registry is empty.
    async fn drained(&self, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.cache.is_empty() {
                return;
            }
        }
    }

    /// Closes the context on a background task and reports the outcome to
    /// `on_done`, which is called exactly once.
    pub fn close_with<F>(self: &Arc<Self>, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<CloseOutcome, CacheError>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = ctx.close().await;
            on_done(outcome);
        })
    }
}

impl std::fmt::Debug for ClContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClContext")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_engine::sim::SimEngine;
    use compute_engine::{KernelArg, MemorySize};

    const KERNEL: &str = r#"
__kernel void scale(__global const float* input, __global float* output, const float k) {
    output[get_global_id(0)] = input[get_global_id(0)] * k;
}
"#;

    fn sim(capacity: MemorySize) -> Arc<SimEngine> {
        Arc::new(SimEngine::single_device(capacity))
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let ctx = ClContext::new(sim(MemorySize::from_kb(64)), ContextConfig::default());
        assert_eq!(ctx.state(), ContextState::Uninitialized);

        let err = ctx
            .create_buffer(64, BufDir::ReadWrite, MemoryKind::None, None, Some("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotInitialized));
        assert!(matches!(ctx.queues(), Err(CacheError::NotInitialized)));

        ctx.initialise().await.unwrap();
        ctx.initialise().await.unwrap();
        assert_eq!(ctx.state(), ContextState::Initialized);

        assert_eq!(ctx.close().await.unwrap(), CloseOutcome::Drained);
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(matches!(
            ctx.initialise().await,
            Err(CacheError::NotInitialized)
        ));
        assert!(matches!(ctx.close().await, Err(CacheError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_initialise_rejects_bad_device() {
        let config = ContextConfig::default().with_device(0, 5);
        let err = ClContext::connect(sim(MemorySize::from_kb(64)), config)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Validation(_)));
    }

    #[tokio::test]
    async fn test_queues() {
        let single = ClContext::connect(sim(MemorySize::from_kb(64)), ContextConfig::default())
            .await
            .unwrap();
        let q = single.queues().unwrap();
        assert_eq!((q.load, q.process, q.unload), (QueueSelector(0), QueueSelector(0), QueueSelector(0)));

        let overlapping = ClContext::connect(
            sim(MemorySize::from_kb(64)),
            ContextConfig::default().with_overlapping(true),
        )
        .await
        .unwrap();
        let q = overlapping.queues().unwrap();
        assert_eq!(q.unload, QueueSelector(2));
        assert!(overlapping.wait_finish(Some(q.unload)).await.is_ok());
        assert!(single.wait_finish(Some(QueueSelector(1))).await.is_err());
    }

    #[tokio::test]
    async fn test_run_program() {
        let ctx = ClContext::connect(sim(MemorySize::from_kb(64)), ContextConfig::default())
            .await
            .unwrap();
        let program = ctx
            .create_program(KERNEL, ProgramOptions::new(vec![16]))
            .await
            .unwrap();
        let input = ctx
            .create_buffer(64, BufDir::ReadOnly, MemoryKind::None, None, Some("t"))
            .await
            .unwrap();
        let output = ctx
            .create_buffer(64, BufDir::WriteOnly, MemoryKind::None, None, Some("t"))
            .await
            .unwrap();

        let mut params = KernelParams::new();
        params.insert("input".into(), input.kernel_arg().unwrap());
        params.insert("output".into(), output.kernel_arg().unwrap());
        params.insert("k".into(), KernelArg::Float(2.0));
        assert!(ctx.run_program(&*program, &params).await.is_ok());

        params.remove("k");
        let err = ctx.run_program(&*program, &params).await.unwrap_err();
        assert!(matches!(err, CacheError::Validation(_)));

        params.insert("k".into(), KernelArg::Float(2.0));
        let err = ctx
            .run_program_on(&*program, &params, Some(QueueSelector(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Validation(_)));
    }

    #[tokio::test]
    async fn test_run_program_retries_after_eviction() {
        let engine = sim(MemorySize::from_kb(64));
        let ctx = ClContext::connect(engine.clone(), ContextConfig::default())
            .await
            .unwrap();
        let program = ctx
            .create_program(KERNEL, ProgramOptions::new(vec![16]))
            .await
            .unwrap();
        let spare = ctx
            .create_buffer(1024, BufDir::ReadWrite, MemoryKind::None, None, Some("spare"))
            .await
            .unwrap();
        spare.release();

        let mut params = KernelParams::new();
        params.insert("input".into(), KernelArg::Float(0.0));
        params.insert("output".into(), KernelArg::Float(0.0));
        params.insert("k".into(), KernelArg::Float(1.0));

        engine.fail_next_runs(1);
        assert!(ctx.run_program(&*program, &params).await.is_ok());
        assert!(spare.is_freed());
        assert_eq!(ctx.stats().oom_retries, 1);

        engine.fail_next_runs(2);
        let err = ctx.run_program(&*program, &params).await.unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_refuses_new_allocations() {
        let ctx = Arc::new(
            ClContext::connect(sim(MemorySize::from_kb(64)), ContextConfig::default())
                .await
                .unwrap(),
        );
        let held = ctx
            .create_buffer(256, BufDir::ReadWrite, MemoryKind::None, None, Some("a"))
            .await
            .unwrap();

        let closing = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.close().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ctx.state(), ContextState::Closing);

        let err = ctx
            .create_buffer(256, BufDir::ReadWrite, MemoryKind::None, None, Some("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Closing));
        assert!(matches!(ctx.close().await, Err(CacheError::Closing)));

        // owners can still finish up
        held.release();
        held.add_ref();
        held.release();
        assert_eq!(ctx.release_buffers("a"), 1);

        assert_eq!(closing.await.unwrap().unwrap(), CloseOutcome::Drained);
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_with_reports_once() {
        let ctx = Arc::new(
            ClContext::connect(sim(MemorySize::from_kb(64)), ContextConfig::default())
                .await
                .unwrap(),
        );
        let _held = ctx
            .create_buffer(256, BufDir::ReadWrite, MemoryKind::None, None, Some("a"))
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        ctx.close_with(move |outcome| {
            let _ = tx.send(outcome);
        })
        .await
        .unwrap();

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome, CloseOutcome::TimedOut { forced_frees: 1 });
    }
}
