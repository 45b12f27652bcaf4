// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Global virtual-address (GVA) space manager.
//!
//! This crate keeps the address-space bookkeeping for one process of a
//! multi-rank memory fabric:
//! - Allocated and imported ranges, indexed by GVA, by local address (LVA) and by memory class
//! - Reserved-but-unbound ranges carved out of a configurable reservation window
//! - GVA <-> LVA translation and address -> rank / memory-class classification
//!
//! The registry never touches hardware. Collaborators notify it of new or
//! removed ranges and query it; see [`VaRegistry`].

pub mod config;
pub mod range;
pub mod registry;


pub use config::{GvmConfig, GvmConfigBuilder};
pub use range::{AddressRange, AllocatedRange, GvaRegion, ReservedRange};
pub use registry::{Capability, VaRegistry};

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

/// Result type for address-space operations.
pub type Result<T> = std::result::Result<T, GvmError>;

/// Identifier of one participant in a distributed job.
pub type RankId = u32;

/// Marker for "no rank", used for ranges that were not imported from a peer.
pub const INVALID_RANK: RankId = u32::MAX;

/// Errors that can occur while mutating the address space.
#[derive(Debug, Error)]
pub enum GvmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("address overlap: {requested} conflicts with {existing}")]
    AddressOverlap {
        requested: AllocatedRange,
        existing: AllocatedRange,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Memory class classification.
///
/// Ranges of different classes live in logically separate spaces and may
/// share GVA values without conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
pub enum MemoryClass {
    /// Accelerator device memory (HBM)
    #[strum(serialize = "DEVICE")]
    Device,

    /// Host memory (DRAM)
    #[strum(serialize = "HOST")]
    Host,
}

impl MemoryClass {
    pub fn all() -> [Self; 2] {
        [Self::Device, Self::Host]
    }

    /// Single-letter tag used in compact address descriptions.
    pub fn tag(&self) -> char {
        match self {
            Self::Device => 'D',
            Self::Host => 'H',
        }
    }
}

impl TryFrom<u32> for MemoryClass {
    type Error = GvmError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Device),
            1 => Ok(Self::Host),
            other => Err(GvmError::InvalidArgument(format!(
                "memory class {other} is out of range"
            ))),
        }
    }
}

impl From<MemoryClass> for u32 {
    fn from(class: MemoryClass) -> Self {
        match class {
            MemoryClass::Device => 0,
            MemoryClass::Host => 1,
        }
    }
}

/// Render an address or size as `0x`-prefixed lowercase hex.
pub fn fmt_va(v: u64) -> String {
    format!("{v:#x}")
}
