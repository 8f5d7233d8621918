// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # buffer-cache
//!
//! Device buffer reuse and lifecycle management for compute pipelines.
//!
//! Pipelines that process a stream of frames allocate the same shapes of
//! device buffer over and over. This crate keeps those allocations alive
//! and hands them back out:
//!
//! ```text
//! create_buffer(spec, owner)
//!     │
//!     ├─ free registered buffer with identical spec? ──▶ revive it (hit)
//!     │
//!     └─ allocate on device ── out of memory? ──▶ evict unreserved, retry once
//!             │
//!             ▼
//!        register under owner (miss)
//!
//! Buffer::release() at refs == 0 ──▶ unreserved, stays registered for reuse
//! release_buffers(owner)          ──▶ frees everything that owner holds
//! ```
//!
//! [`ClContext`] ties a cache to one device context and manages its
//! lifecycle, including a bounded, polling shutdown that waits for owners
//! to let go before force-freeing.
//!
//! # Reference Counting
//! Counts are advisory: they mark when a buffer may be reused, and misuse
//! (releasing twice, taking a reference on a released buffer) is logged
//! rather than raised.

mod buffer;
mod cache;
mod config;
mod context;
mod error;
mod retry;
mod stats;

pub use buffer::{Buffer, BufferInfo};
pub use cache::BufferCache;
pub use config::{ContextConfig, DEFAULT_CLOSE_POLL_INTERVAL_MS, DEFAULT_CLOSE_TIMEOUT_MS};
pub use context::{ClContext, CloseOutcome, ContextState};
pub use error::CacheError;
pub use stats::CacheStats;
