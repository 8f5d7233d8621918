// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Human-readable byte sizes.
//!
//! [`MemorySize`] is used for device capacities and for buffer sizes given
//! on the command line.

use crate::EngineError;
use std::fmt;
use std::str::FromStr;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
const GIB: usize = 1024 * MIB;

/// Suffixes in match order: longer spellings first so `"MB"` is not read
/// as a byte count ending in `B`.
const SUFFIXES: &[(&str, usize)] = &[
    ("GB", GIB),
    ("MB", MIB),
    ("KB", KIB),
    ("G", GIB),
    ("M", MIB),
    ("K", KIB),
    ("B", 1),
];

/// A byte count with binary-suffix parsing and display.
///
/// # Examples
/// ```
/// use compute_engine::MemorySize;
///
/// assert_eq!(MemorySize::parse("4K").unwrap().as_bytes(), 4096);
/// assert_eq!(MemorySize::parse("64MB").unwrap(), MemorySize::from_mb(64));
/// assert_eq!(MemorySize::from_mb(512).to_string(), "512 MB");
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct MemorySize {
    bytes: usize,
}

impl MemorySize {
    pub const fn from_bytes(bytes: usize) -> Self {
        Self { bytes }
    }

    pub const fn from_kb(kb: usize) -> Self {
        Self { bytes: kb * KIB }
    }

    pub const fn from_mb(mb: usize) -> Self {
        Self { bytes: mb * MIB }
    }

    pub const fn from_gb(gb: usize) -> Self {
        Self { bytes: gb * GIB }
    }

    pub const fn as_bytes(&self) -> usize {
        self.bytes
    }

    /// Megabytes, truncated.
    pub const fn as_mb(&self) -> usize {
        self.bytes / MIB
    }

    /// Parses `"512M"`, `"512MB"`, `"4k"`, `"1G"`, `"100B"` or a plain byte
    /// count. Case-insensitive; zero and negative values are rejected.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(EngineError::validation("empty size string"));
        }
        if trimmed.starts_with('-') {
            return Err(EngineError::validation(format!(
                "size cannot be negative: '{trimmed}'"
            )));
        }

        let upper = trimmed.to_ascii_uppercase();
        let (digits, multiplier) = SUFFIXES
            .iter()
            .find(|(suffix, _)| upper.ends_with(suffix))
            .map(|(suffix, mult)| (&trimmed[..trimmed.len() - suffix.len()], *mult))
            .unwrap_or((trimmed, 1));

        let value: usize = digits.trim().parse().map_err(|_| {
            EngineError::validation(format!(
                "invalid size '{trimmed}': expected a number with an optional K, M or G suffix"
            ))
        })?;
        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| EngineError::validation(format!("size overflow: '{trimmed}'")))?;
        if bytes == 0 {
            return Err(EngineError::validation("size must be greater than zero"));
        }
        Ok(Self { bytes })
    }
}

impl FromStr for MemorySize {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes {
            b if b >= GIB && b % GIB == 0 => write!(f, "{} GB", b / GIB),
            b if b >= MIB && b % MIB == 0 => write!(f, "{} MB", b / MIB),
            b if b >= KIB && b % KIB == 0 => write!(f, "{} KB", b / KIB),
            b => write!(f, "{b} B"),
        }
    }
}
