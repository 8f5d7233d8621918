// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the buffer cache and context lifecycle.

use compute_engine::EngineError;

/// Errors surfaced to callers of the cache and context.
///
/// A failed operation leaves the context usable. Misuse of reference
/// counting is never an error; it is logged instead.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Malformed input: bad size, enum name, queue index or kernel
    /// parameter set. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The context has not been initialised, or has been closed.
    #[error("compute context is not initialised")]
    NotInitialized,

    /// The context is draining for shutdown and accepts no new allocations.
    #[error("compute context is closing")]
    Closing,

    /// The device ran out of memory and the retry after eviction failed too.
    #[error("device allocation failed after evicting unreserved buffers: {0}")]
    AllocationFailure(#[source] EngineError),

    /// The buffer's device allocation has already been freed.
    #[error("buffer {index} has been freed")]
    BufferFreed { index: u64 },

    /// Any other engine failure.
    #[error("compute engine error: {0}")]
    Engine(#[source] EngineError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CacheError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::AllocationFailure(e) if e.is_out_of_memory())
    }
}

impl From<EngineError> for CacheError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => Self::Validation(msg),
            oom @ EngineError::OutOfMemory { .. } => Self::AllocationFailure(oom),
            other => Self::Engine(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_engine_error() {
        let v: CacheError = EngineError::Validation("bad".into()).into();
        assert!(matches!(v, CacheError::Validation(ref m) if m == "bad"));

        let oom: CacheError = EngineError::OutOfMemory {
            requested_bytes: 1,
            available_bytes: 0,
            capacity_bytes: 0,
        }
        .into();
        assert!(oom.is_out_of_memory());

        let other: CacheError = EngineError::Execution("boom".into()).into();
        assert!(matches!(other, CacheError::Engine(_)));
        assert!(!other.is_out_of_memory());
    }
}
