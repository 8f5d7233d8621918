// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Context configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! platform_index = 0
//! device_index = 1
//! overlapping = true
//! close_poll_interval_ms = 20
//! close_timeout_ms = 1000
//! ```
//!
//! Leave both indices out to use the default device.

use crate::CacheError;
use std::path::Path;
use std::time::Duration;

/// Default interval between registry checks while closing.
pub const DEFAULT_CLOSE_POLL_INTERVAL_MS: u64 = 20;

/// Default time a close waits for owners to release their buffers.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1000;

/// Configuration for a [`ClContext`](crate::ClContext).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Platform to open. Must be given together with `device_index`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_index: Option<u32>,
    /// Device on the platform. Must be given together with `platform_index`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_index: Option<u32>,
    /// Use three command queues (load, process, unload) instead of one.
    pub overlapping: bool,
    pub close_poll_interval_ms: u64,
    pub close_timeout_ms: u64,
}

impl ContextConfig {
    /// Selects an explicit platform and device.
    pub fn with_device(mut self, platform_index: u32, device_index: u32) -> Self {
        self.platform_index = Some(platform_index);
        self.device_index = Some(device_index);
        self
    }

    pub fn with_overlapping(mut self, overlapping: bool) -> Self {
        self.overlapping = overlapping;
        self
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, CacheError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CacheError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| CacheError::ConfigError(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, CacheError> {
        toml::to_string_pretty(self)
            .map_err(|e| CacheError::ConfigError(format!("TOML serialise error: {e}")))
    }

    /// Number of command queues to open: three when overlapping, else one.
    pub fn num_queues(&self) -> u32 {
        if self.overlapping {
            3
        } else {
            1
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.close_poll_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Rejects a half-specified device and zero durations.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.platform_index.is_some() != self.device_index.is_some() {
            return Err(CacheError::ConfigError(
                "platform_index and device_index must be given together".into(),
            ));
        }
        if self.close_poll_interval_ms == 0 {
            return Err(CacheError::ConfigError(
                "close_poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.close_timeout_ms < self.close_poll_interval_ms {
            return Err(CacheError::ConfigError(format!(
                "close_timeout_ms ({}) must not be shorter than close_poll_interval_ms ({})",
                self.close_timeout_ms, self.close_poll_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            platform_index: None,
            device_index: None,
            overlapping: false,
            close_poll_interval_ms: DEFAULT_CLOSE_POLL_INTERVAL_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContextConfig::default();
        assert_eq!(config.num_queues(), 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.close_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ContextConfig::default()
            .with_device(0, 1)
            .with_overlapping(true);
        let toml_str = config.to_toml().unwrap();
        let parsed = ContextConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.num_queues(), 3);
    }

    #[test]
    fn test_default_device_omits_indices() {
        let toml_str = ContextConfig::default().to_toml().unwrap();
        assert!(!toml_str.contains("platform_index"));
        let parsed = ContextConfig::from_toml("overlapping = true").unwrap();
        assert_eq!(parsed.platform_index, None);
        assert_eq!(parsed.close_timeout_ms, DEFAULT_CLOSE_TIMEOUT_MS);
    }

    #[test]
    fn test_rejects_half_specified_device() {
        let err = ContextConfig::from_toml("platform_index = 0").unwrap_err();
        assert!(matches!(err, CacheError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_bad_intervals() {
        assert!(ContextConfig::from_toml("close_poll_interval_ms = 0").is_err());
        assert!(ContextConfig::from_toml(
            "close_poll_interval_ms = 50\nclose_timeout_ms = 10"
        )
        .is_err());
    }

    #[test]
    fn test_invalid_toml() {
        let err = ContextConfig::from_toml("overlapping = \"yes please\"").unwrap_err();
        assert!(err.to_string().contains("TOML parse error"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ContextConfig::from_file(Path::new("/nonexistent/devpool.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read config"));
    }
}
