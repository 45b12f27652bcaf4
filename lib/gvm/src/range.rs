// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Address range data model.
//!
//! - [`GvaRegion`]: the plain `{gva, size, class, lva}` descriptor collaborators hand in.
//! - [`AllocatedRange`]: a region bound to memory, allocated locally or imported from a peer.
//! - [`ReservedRange`]: an address-space placeholder with no memory behind it yet.
//!
//! All ranges are half-open: `[start, start + size)`.

use super::{INVALID_RANK, MemoryClass, RankId, fmt_va};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape shared by allocated and reserved ranges.
pub trait AddressRange: fmt::Debug + Send + Sync {
    /// First address of the range.
    fn start(&self) -> u64;

    /// Length of the range in bytes.
    fn size(&self) -> u64;

    /// Memory class the range belongs to.
    fn memory_class(&self) -> MemoryClass;

    /// One past the last address of the range.
    fn end(&self) -> u64 {
        self.start().saturating_add(self.size())
    }

    /// Returns true if `addr` falls inside `[start, end)`.
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Returns true if `[start, start + size)` intersects this range.
    fn intersects(&self, start: u64, size: u64) -> bool {
        let end = start.saturating_add(size);
        start < self.end() && self.start() < end
    }
}

/// An unowned description of a global address range and its local alias.
///
/// `lva == 0` means the range has no local alias (e.g. a remote import that
/// is only reachable through the fabric).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GvaRegion {
    /// Process-global start address.
    pub gva: u64,

    /// Size of the region in bytes.
    pub size: u64,

    /// Memory class of the region.
    pub class: MemoryClass,

    /// Process-local start address, 0 if none.
    pub lva: u64,
}

impl GvaRegion {
    pub fn new(gva: u64, size: u64, class: MemoryClass, lva: u64) -> Self {
        Self {
            gva,
            size,
            class,
            lva,
        }
    }
}

impl AddressRange for GvaRegion {
    fn start(&self) -> u64 {
        self.gva
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn memory_class(&self) -> MemoryClass {
        self.class
    }
}

/// A range that is bound to memory, tracked by both its GVA and its LVA.
///
/// Equality only considers the region (start, size, class and lva); two
/// registrations of the same region by different ranks compare equal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AllocatedRange {
    region: GvaRegion,
    owner_rank: RankId,
    imported_from: Option<RankId>,
    registered: bool,
}

impl AllocatedRange {
    /// A range allocated or registered by `owner_rank` itself.
    pub fn local(region: GvaRegion, owner_rank: RankId) -> Self {
        Self::imported(region, owner_rank, INVALID_RANK)
    }

    /// A range mapped by `owner_rank` whose memory belongs to `imported_from`.
    ///
    /// Passing [`INVALID_RANK`] as `imported_from` yields a local range.
    pub fn imported(region: GvaRegion, owner_rank: RankId, imported_from: RankId) -> Self {
        let imported_from = (imported_from != INVALID_RANK).then_some(imported_from);
        Self {
            region,
            owner_rank,
            imported_from,
            registered: imported_from.is_none(),
        }
    }

    pub fn region(&self) -> &GvaRegion {
        &self.region
    }

    #[inline]
    pub fn gva(&self) -> u64 {
        self.region.gva
    }

    #[inline]
    pub fn lva(&self) -> u64 {
        self.region.lva
    }

    /// The local rank that registered this range. For imports this is the
    /// importing rank, not the remote owner.
    pub fn owner_rank(&self) -> RankId {
        self.owner_rank
    }

    pub fn imported_from(&self) -> Option<RankId> {
        self.imported_from
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// The rank whose memory backs this range: the peer for imports,
    /// otherwise the owner.
    pub fn rank_id(&self) -> RankId {
        self.imported_from.unwrap_or(self.owner_rank)
    }

    pub fn has_lva(&self) -> bool {
        self.region.lva != 0
    }

    /// Returns true if `addr` falls inside `[lva, lva + size)`. Never matches
    /// ranges without a local alias.
    pub fn contains_lva(&self, addr: u64) -> bool {
        self.has_lva() && addr >= self.region.lva && addr < self.lva_end()
    }

    pub fn lva_end(&self) -> u64 {
        self.region.lva.saturating_add(self.region.size)
    }

    /// Returns true if `other` lies entirely inside this range's GVA interval.
    pub fn covers(&self, other: &AllocatedRange) -> bool {
        other.gva() >= self.gva() && other.end() <= self.end()
    }

    /// Translate a contained GVA to its LVA.
    pub fn gva_to_lva(&self, gva: u64) -> Option<u64> {
        if !self.contains(gva) {
            return None;
        }
        Some(self.region.lva + (gva - self.region.gva))
    }

    /// Translate a contained LVA to its GVA.
    pub fn lva_to_gva(&self, lva: u64) -> Option<u64> {
        if !self.contains_lva(lva) {
            return None;
        }
        Some(self.region.gva + (lva - self.region.lva))
    }

    /// Compact one-line description, e.g. `{gva: 0x1000, LH(0), lva: 0x2000}`.
    ///
    /// `L` marks a range with a local alias, `R` one without.
    pub fn describe(&self) -> String {
        let locality = if self.has_lva() { 'L' } else { 'R' };
        format!(
            "{{gva: {}, {}{}({}), lva: {}}}",
            fmt_va(self.gva()),
            locality,
            self.region.class.tag(),
            self.owner_rank,
            fmt_va(self.lva())
        )
    }
}

impl PartialEq for AllocatedRange {
    fn eq(&self, other: &Self) -> bool {
        self.region == other.region
    }
}

impl Eq for AllocatedRange {}

impl AddressRange for AllocatedRange {
    fn start(&self) -> u64 {
        self.region.gva
    }
    fn size(&self) -> u64 {
        self.region.size
    }
    fn memory_class(&self) -> MemoryClass {
        self.region.class
    }
}

impl fmt::Display for AllocatedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatedRange{{gva: {}, size: {}, rank: {}, registered: {}, class: {}, lva: {}}}",
            fmt_va(self.gva()),
            fmt_va(self.size()),
            self.rank_id(),
            self.registered,
            self.region.class,
            fmt_va(self.lva())
        )
    }
}

/// Address space claimed by a rank before any memory is bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedRange {
    pub start: u64,
    pub size: u64,
    pub class: MemoryClass,
    pub owner_rank: RankId,
}

impl AddressRange for ReservedRange {
    fn start(&self) -> u64 {
        self.start
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn memory_class(&self) -> MemoryClass {
        self.class
    }
}

impl fmt::Display for ReservedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReservedRange{{start: {}, size: {}, class: {}, rank: {}}}",
            fmt_va(self.start),
            fmt_va(self.size),
            self.class,
            self.owner_rank
        )
    }
}
