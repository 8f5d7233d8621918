// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Value types shared by engines and their clients.

use crate::{EngineError, NativeBuffer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Data direction of a buffer with respect to kernel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufDir {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BufDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::WriteOnly => "writeonly",
            Self::ReadWrite => "readwrite",
        }
    }
}

impl FromStr for BufDir {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "readonly" => Ok(Self::ReadOnly),
            "writeonly" => Ok(Self::WriteOnly),
            "readwrite" => Ok(Self::ReadWrite),
            other => Err(EngineError::validation(format!(
                "buffer direction must be one of 'readonly', 'writeonly' or 'readwrite', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BufDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared-virtual-memory flavour of a buffer.
///
/// `None` means a plain device allocation that is copied to and from the
/// host; `Coarse` and `Fine` are host-shared allocations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    None,
    Coarse,
    Fine,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Coarse => "coarse",
            Self::Fine => "fine",
        }
    }
}

impl FromStr for MemoryKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "coarse" => Ok(Self::Coarse),
            "fine" => Ok(Self::Fine),
            other => Err(EngineError::validation(format!(
                "buffer type must be one of 'fine', 'coarse' or 'none', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of host-side access requested on a buffer.
///
/// `None` explicitly withdraws host access.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HostAccess {
    None,
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl HostAccess {
    /// Whether bytes may be copied into the buffer under this access.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

impl From<BufDir> for HostAccess {
    fn from(dir: BufDir) -> Self {
        match dir {
            BufDir::ReadOnly => Self::ReadOnly,
            BufDir::WriteOnly => Self::WriteOnly,
            BufDir::ReadWrite => Self::ReadWrite,
        }
    }
}

impl FromStr for HostAccess {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            other => other.parse::<BufDir>().map(Self::from).map_err(|_| {
                EngineError::validation(format!(
                    "host access must be one of 'none', 'readonly', 'writeonly' or 'readwrite', got '{other}'"
                ))
            }),
        }
    }
}

/// Image shape for buffers bound to image-typed kernel parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl ImageDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: None,
        }
    }

    pub fn with_depth(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth: Some(depth),
        }
    }
}

impl fmt::Display for ImageDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.depth {
            Some(d) => write!(f, "{}x{}x{}", self.width, self.height, d),
            None => write!(f, "{}x{}", self.width, self.height),
        }
    }
}

/// The shape of a device buffer request.
///
/// This is also the buffer cache's lookup key: two requests can share an
/// allocation only when every field is equal, image dimensions included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BufferSpec {
    pub num_bytes: usize,
    pub direction: BufDir,
    #[serde(default)]
    pub memory_kind: MemoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dims: Option<ImageDims>,
}

impl BufferSpec {
    pub fn new(num_bytes: usize, direction: BufDir, memory_kind: MemoryKind) -> Self {
        Self {
            num_bytes,
            direction,
            memory_kind,
            image_dims: None,
        }
    }

    pub fn with_image_dims(mut self, dims: ImageDims) -> Self {
        self.image_dims = Some(dims);
        self
    }

    /// Builds a spec from loosely typed input, as received over an FFI or
    /// command-line boundary. A negative size or unknown enum name is a
    /// validation error.
    pub fn parse(num_bytes: i64, direction: &str, memory_kind: &str) -> Result<Self, EngineError> {
        let num_bytes = usize::try_from(num_bytes).map_err(|_| {
            EngineError::validation(format!("size of the buffer cannot be negative: {num_bytes}"))
        })?;
        let spec = Self::new(num_bytes, direction.parse()?, memory_kind.parse()?);
        spec.validate()?;
        Ok(spec)
    }

    /// Checks the request before any allocation is attempted.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.num_bytes == 0 {
            return Err(EngineError::validation("cannot allocate a zero-sized buffer"));
        }
        if let Some(dims) = self.image_dims {
            if dims.width == 0 || dims.height == 0 || dims.depth == Some(0) {
                return Err(EngineError::validation(format!(
                    "image dimensions must be non-zero, got {dims}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BufferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes {} {}",
            self.num_bytes, self.direction, self.memory_kind
        )?;
        if let Some(dims) = self.image_dims {
            write!(f, " image {dims}")?;
        }
        Ok(())
    }
}

/// Index of a command queue on a context.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct QueueSelector(pub u32);

impl QueueSelector {
    /// Checks the selector against the number of queues on a context.
    pub fn check(self, num_queues: u32) -> Result<Self, EngineError> {
        if self.0 < num_queues {
            Ok(self)
        } else {
            Err(EngineError::validation(format!(
                "queue index {} out of range: context has {num_queues} queue(s)",
                self.0
            )))
        }
    }
}

/// Conventional queue roles for overlapped pipelines: host→device loads,
/// kernel processing, and device→host unloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CommandQueues {
    pub load: QueueSelector,
    pub process: QueueSelector,
    pub unload: QueueSelector,
}

impl CommandQueues {
    /// Queue roles for a context with `num_queues` queues. With fewer than
    /// three, roles share queues and ordering is fully serial.
    pub fn for_queue_count(num_queues: u32) -> Self {
        let pick = |i: u32| QueueSelector(if i < num_queues { i } else { 0 });
        Self {
            load: pick(0),
            process: pick(1),
            unload: pick(2),
        }
    }
}

/// Options for building a program from kernel source.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProgramOptions {
    /// Kernel function to select. Defaults to the first in the source.
    pub name: Option<String>,
    /// Global work items per dimension (1 to 3 entries). Required.
    pub global_work_items: Vec<u32>,
    pub work_items_per_group: Option<u32>,
}

impl ProgramOptions {
    pub fn new(global_work_items: impl Into<Vec<u32>>) -> Self {
        Self {
            name: None,
            global_work_items: global_work_items.into(),
            work_items_per_group: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn work_items_per_group(mut self, n: u32) -> Self {
        self.work_items_per_group = Some(n);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match self.global_work_items.len() {
            0 => Err(EngineError::validation("globalWorkItems must be specified")),
            1..=3 => {
                if self.global_work_items.contains(&0) {
                    return Err(EngineError::validation("globalWorkItems must be non-zero"));
                }
                if self.work_items_per_group == Some(0) {
                    return Err(EngineError::validation("workItemsPerGroup must be non-zero"));
                }
                Ok(())
            }
            n => Err(EngineError::validation(format!(
                "globalWorkItems may have at most 3 dimensions, got {n}"
            ))),
        }
    }
}

/// Timings of a single program run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RunTimings {
    pub data_to_kernel: Duration,
    pub kernel_exec: Duration,
    pub data_from_kernel: Duration,
    pub total_time: Duration,
}

/// A single named kernel argument.
#[derive(Clone)]
pub enum KernelArg {
    Buffer(Arc<dyn NativeBuffer>),
    Int(i32),
    UInt(u32),
    Float(f32),
}

impl fmt::Debug for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(b) => f
                .debug_struct("Buffer")
                .field("num_bytes", &b.num_bytes())
                .finish(),
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::UInt(v) => f.debug_tuple("UInt").field(v).finish(),
            Self::Float(v) => f.debug_tuple("Float").field(v).finish(),
        }
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for KernelArg {
    fn from(v: u32) -> Self {
        Self::UInt(v)
    }
}

impl From<f32> for KernelArg {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

/// Named kernel arguments. Keys must match the program's parameter names.
pub type KernelParams = BTreeMap<String, KernelArg>;
