// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types reported by a compute engine.

/// Errors that a compute engine can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The device could not satisfy an allocation.
    ///
    /// Kernel execution can also report this when the driver needs scratch
    /// memory it cannot get.
    #[error("out of device memory: requested {requested_bytes} bytes, but only {available_bytes} available (capacity: {capacity_bytes})")]
    OutOfMemory {
        requested_bytes: usize,
        available_bytes: usize,
        capacity_bytes: usize,
    },

    /// Malformed input: bad index, unknown enum name, missing option,
    /// parameter-name mismatch.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The kernel source could not be built into a program.
    #[error("program build failed: {0}")]
    BuildFailure(String),

    /// A kernel failed while running.
    #[error("kernel execution failed: {0}")]
    Execution(String),

    /// Host access to a device buffer could not be granted.
    #[error("host access failed: {0}")]
    HostAccess(String),
}

impl EngineError {
    /// Returns `true` for the out-of-device-memory signal.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_tag() {
        let oom = EngineError::OutOfMemory {
            requested_bytes: 10,
            available_bytes: 2,
            capacity_bytes: 8,
        };
        assert!(oom.is_out_of_memory());
        assert!(!EngineError::Validation("x".into()).is_out_of_memory());
        assert!(!EngineError::Execution("x".into()).is_out_of_memory());
    }

    #[test]
    fn test_display() {
        let oom = EngineError::OutOfMemory {
            requested_bytes: 4096,
            available_bytes: 1024,
            capacity_bytes: 8192,
        };
        let msg = oom.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }
}
