// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # compute-engine
//!
//! The contract between the buffer cache and a device compute engine
//! (OpenCL-style: contexts, device buffers, kernel programs, command queues).
//!
//! # Key Components
//!
//! - [`ComputeEngine`]: creates a [`ContextHandle`] for a platform/device pair.
//! - [`ContextHandle`]: allocates [`NativeBuffer`]s, builds [`Program`]s and
//!   waits on command queues.
//! - [`EngineError`]: tagged failures. [`EngineError::OutOfMemory`] is the
//!   signal the buffer cache recovers from by evicting unused buffers.
//! - [`MemorySize`]: human-readable byte sizes (`"64M"`, `"4K"`).
//! - [`sim::SimEngine`]: an in-process device with a fixed byte capacity,
//!   host-memory backing and fault injection.
//!
//! Every operation that crosses into the device is `async`; nothing else in
//! this crate suspends.
//!
//! # Example
//! ```
//! use compute_engine::sim::SimEngine;
//! use compute_engine::{
//!     BufDir, BufferSpec, ComputeEngine, ContextHandle, MemoryKind, MemorySize, NativeBuffer,
//! };
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let engine = SimEngine::single_device(MemorySize::from_mb(1));
//!     let ctx = engine.create_context(Some(0), Some(0), 1).await.unwrap();
//!     let spec = BufferSpec::new(4096, BufDir::ReadWrite, MemoryKind::None);
//!     let buf = ctx.create_buffer(&spec).await.unwrap();
//!     assert_eq!(buf.num_bytes(), 4096);
//!     buf.free();
//!     assert_eq!(engine.allocated_bytes(), 0);
//! });
//! ```

mod error;
mod size;
mod traits;
mod types;

pub mod sim;

pub use error::EngineError;
pub use size::MemorySize;
pub use traits::{ComputeEngine, ContextHandle, NativeBuffer, Program};
pub use types::{
    BufDir, BufferSpec, CommandQueues, HostAccess, ImageDims, KernelArg, KernelParams,
    MemoryKind, ProgramOptions, QueueSelector, RunTimings,
};
