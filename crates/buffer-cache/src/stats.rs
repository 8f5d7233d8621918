// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Buffer cache statistics.
//!
//! [`CacheStats`] counts how requests were served (reused or freshly
//! allocated), how often memory pressure forced an eviction sweep, and how
//! buffers left the registry. The hit ratio is the number to watch when
//! tuning a pipeline's buffer shapes.

/// Cumulative statistics for one buffer cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Buffer requests, successful or not.
    pub requests: u64,
    /// Requests served by reviving a registry entry.
    pub cache_hits: u64,
    /// Requests that needed a device allocation.
    pub cache_misses: u64,
    /// Requests that failed in the engine (after any retry).
    pub failed_allocations: u64,
    /// Out-of-memory failures that triggered an eviction sweep and retry.
    pub oom_retries: u64,
    /// Unreserved buffers freed by eviction sweeps.
    pub evicted_buffers: u64,
    /// Buffers freed by per-owner release.
    pub owner_releases: u64,
    /// Buffers force-freed by a shutdown that timed out.
    pub forced_frees: u64,
    /// High-water mark of bytes held in the registry.
    pub peak_registered_bytes: usize,
}

impl CacheStats {
    /// Fraction of served requests that were cache hits, in `[0.0, 1.0]`.
    pub fn cache_hit_ratio(&self) -> f64 {
        let served = self.cache_hits + self.cache_misses;
        if served == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / served as f64
    }

    pub(crate) fn record_hit(&mut self) {
        self.requests += 1;
        self.cache_hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.requests += 1;
        self.cache_misses += 1;
    }

    pub(crate) fn record_failure(&mut self) {
        self.requests += 1;
        self.failed_allocations += 1;
    }

    pub(crate) fn record_oom_retry(&mut self, evicted: usize) {
        self.oom_retries += 1;
        self.evicted_buffers += evicted as u64;
    }

    pub(crate) fn record_owner_release(&mut self, released: usize) {
        self.owner_releases += released as u64;
    }

    pub(crate) fn record_forced_frees(&mut self, freed: usize) {
        self.forced_frees += freed as u64;
    }

    pub(crate) fn update_peak(&mut self, registered_bytes: usize) {
        self.peak_registered_bytes = self.peak_registered_bytes.max(registered_bytes);
    }

    pub fn summary(&self) -> String {
        let peak_mb = self.peak_registered_bytes as f64 / (1024.0 * 1024.0);
        format!(
            "Requests: {} ({} hits, {} misses, {:.0}% hit rate), {} failed, \
             {} OOM retries evicting {} buffers, {} owner releases, {} forced frees, \
             peak {:.2} MB registered",
            self.requests,
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_ratio() * 100.0,
            self.failed_allocations,
            self.oom_retries,
            self.evicted_buffers,
            self.owner_releases,
            self.forced_frees,
            peak_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let mut s = CacheStats::default();
        assert_eq!(s.cache_hit_ratio(), 0.0);
        s.record_hit();
        s.record_hit();
        s.record_miss();
        s.record_failure();
        assert_eq!(s.requests, 4);
        assert!((s.cache_hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak_never_decreases() {
        let mut s = CacheStats::default();
        s.update_peak(4096);
        s.update_peak(1024);
        assert_eq!(s.peak_registered_bytes, 4096);
    }

    #[test]
    fn test_summary() {
        let mut s = CacheStats::default();
        s.record_miss();
        s.record_hit();
        s.record_oom_retry(3);
        let summary = s.summary();
        assert!(summary.contains("2 ("));
        assert!(summary.contains("1 hits"));
        assert!(summary.contains("evicting 3 buffers"));
    }
}
