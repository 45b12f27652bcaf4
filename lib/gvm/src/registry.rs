// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Address Space Registry
//!
//! [`VaRegistry`] is the authoritative record of every address range the
//! current process knows about:
//! - allocated ranges (local allocations, registrations and peer imports), reachable by GVA and LVA
//! - reserved ranges carved out of the reservation window before memory is bound
//!
//! Ranges of one [`MemoryClass`] never overlap; ranges of different classes
//! live in separate spaces and may share addresses. Every index sits behind a
//! single reader/writer lock, so overlap checks and inserts happen atomically.
//!
//! The registry is an ordinary value. Build one per process at startup and
//! hand collaborators an `Arc<VaRegistry>`.

use super::{
    AddressRange, AllocatedRange, GvaRegion, GvmConfig, GvmError, MemoryClass, RankId,
    ReservedRange, Result, fmt_va,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::OnceLock;
use strum::Display;

const MB_SHIFT: u32 = 20;

/// Platform capability presented to [`VaRegistry::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Capability {
    Unknown,
    Ascend910B,
    Ascend910C,
    Ascend950,
}

/// Allocated ranges of a single memory class.
///
/// Neither GVA nor LVA intervals overlap inside one class, so the greatest
/// key not above an address is the only candidate that can contain it.
#[derive(Debug, Default)]
struct ClassIndex {
    by_gva: BTreeMap<u64, AllocatedRange>,
    // lva -> gva, only for ranges with a local alias
    by_lva: BTreeMap<u64, u64>,
}

impl ClassIndex {
    fn find_by_gva(&self, va: u64) -> Option<&AllocatedRange> {
        self.by_gva
            .range(..=va)
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| range.contains(va))
    }

    fn find_by_lva(&self, va: u64) -> Option<&AllocatedRange> {
        self.by_lva
            .range(..=va)
            .next_back()
            .and_then(|(_, gva)| self.by_gva.get(gva))
            .filter(|range| range.contains_lva(va))
    }

    /// First range whose GVA interval intersects `[start, end)`.
    fn gva_conflict(&self, start: u64, end: u64) -> Option<&AllocatedRange> {
        if let Some((_, prev)) = self.by_gva.range(..=start).next_back()
            && prev.end() > start
        {
            return Some(prev);
        }
        self.by_gva.range(start..end).next().map(|(_, range)| range)
    }

    /// First range whose LVA interval intersects `[start, end)`.
    fn lva_conflict(&self, start: u64, end: u64) -> Option<&AllocatedRange> {
        if let Some((_, gva)) = self.by_lva.range(..=start).next_back()
            && let Some(prev) = self.by_gva.get(gva)
            && prev.lva_end() > start
        {
            return Some(prev);
        }
        self.by_lva
            .range(start..end)
            .next()
            .and_then(|(_, gva)| self.by_gva.get(gva))
    }

    fn insert(&mut self, range: AllocatedRange) {
        if range.has_lva() {
            self.by_lva.insert(range.lva(), range.gva());
        }
        self.by_gva.insert(range.gva(), range);
    }

    fn remove(&mut self, gva: u64) -> Option<AllocatedRange> {
        let range = self.by_gva.remove(&gva)?;
        if range.has_lva() && self.by_lva.get(&range.lva()) == Some(&gva) {
            self.by_lva.remove(&range.lva());
        }
        Some(range)
    }

    fn is_empty(&self) -> bool {
        self.by_gva.is_empty()
    }
}

#[derive(Debug, Default)]
struct Indexes {
    classes: BTreeMap<MemoryClass, ClassIndex>,
    reserved: BTreeMap<u64, ReservedRange>,
}

impl Indexes {
    fn find_by_gva(&self, va: u64) -> Option<&AllocatedRange> {
        self.classes.values().find_map(|index| index.find_by_gva(va))
    }

    fn find_by_lva(&self, va: u64) -> Option<&AllocatedRange> {
        self.classes.values().find_map(|index| index.find_by_lva(va))
    }

    fn find_reserved(&self, va: u64) -> Option<&ReservedRange> {
        self.reserved
            .range(..=va)
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| range.contains(va))
    }

    fn alloc_count(&self) -> usize {
        self.classes.values().map(|index| index.by_gva.len()).sum()
    }

    fn allocated(&self) -> impl Iterator<Item = &AllocatedRange> {
        self.classes.values().flat_map(|index| index.by_gva.values())
    }

    /// Insert `range` unless it conflicts with a different range of its class.
    ///
    /// Returns `Ok(false)` when an identical range is already stored.
    fn insert(&mut self, range: AllocatedRange) -> Result<bool> {
        let class = range.memory_class();
        if let Some(index) = self.classes.get(&class) {
            if let Some(existing) = index.gva_conflict(range.gva(), range.end()) {
                if *existing == range {
                    return Ok(false);
                }
                return Err(GvmError::AddressOverlap {
                    requested: range,
                    existing: *existing,
                });
            }
            if range.has_lva()
                && let Some(existing) = index.lva_conflict(range.lva(), range.lva_end())
            {
                return Err(GvmError::AddressOverlap {
                    requested: range,
                    existing: *existing,
                });
            }
        }
        self.classes.entry(class).or_default().insert(range);
        Ok(true)
    }

    /// Remove the range starting exactly at the GVA `va` resolves to.
    ///
    /// `va` is taken as a GVA when it lies inside an allocated GVA interval,
    /// otherwise it is translated as an LVA. `Ok(None)` means `va` is unknown;
    /// an address that resolves but is not a range base is `ObjectNotFound`.
    fn remove(&mut self, va: u64) -> Result<Option<AllocatedRange>> {
        let gva = if self.find_by_gva(va).is_some() {
            va
        } else {
            match self.find_by_lva(va).and_then(|range| range.lva_to_gva(va)) {
                Some(gva) => gva,
                None => return Ok(None),
            }
        };

        for class in MemoryClass::all() {
            let Some(index) = self.classes.get_mut(&class) else {
                continue;
            };
            if let Some(range) = index.remove(gva) {
                if index.is_empty() {
                    self.classes.remove(&class);
                }
                return Ok(Some(range));
            }
        }
        Err(GvmError::ObjectNotFound(format!(
            "{} resolves to gva {}, which is not the base of an allocated range",
            fmt_va(va),
            fmt_va(gva)
        )))
    }

    fn find_free_space(&self, start: u64, end: u64, size: u64) -> Option<u64> {
        if size == 0 || start >= end || size > end - start {
            tracing::error!(
                "invalid free space request: start={}, end={}, size={}",
                fmt_va(start),
                fmt_va(end),
                fmt_va(size)
            );
            return None;
        }

        let mut current = start;
        for used in self.reserved.range(start..end).map(|(_, range)| range) {
            if used.start > current {
                if used.start - current >= size {
                    return Some(current);
                }
                tracing::trace!(
                    "free space at {} too small: {} < {}",
                    fmt_va(current),
                    fmt_va(used.start - current),
                    fmt_va(size)
                );
            }
            current = current.max(used.end());
        }

        (end.saturating_sub(current) >= size).then_some(current)
    }
}

/// Thread-safe registry of allocated and reserved address ranges.
#[derive(Debug)]
pub struct VaRegistry {
    config: GvmConfig,
    capability: OnceLock<Capability>,
    inner: RwLock<Indexes>,
}

impl Default for VaRegistry {
    fn default() -> Self {
        Self::new(GvmConfig::default())
    }
}

impl VaRegistry {
    pub fn new(config: GvmConfig) -> Self {
        Self {
            config,
            capability: OnceLock::new(),
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Build a registry from [`GvmConfig::from_settings`].
    pub fn from_settings() -> Result<Self> {
        let config = GvmConfig::from_settings().map_err(|e| GvmError::Config(e.to_string()))?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &GvmConfig {
        &self.config
    }

    /// Capability recorded by the first successful [`Self::initialize`].
    pub fn capability(&self) -> Option<Capability> {
        self.capability.get().copied()
    }

    /// Validate the platform capability. May be called any number of times;
    /// only the first capability is recorded.
    pub fn initialize(&self, capability: Capability) -> Result<()> {
        if self.config.require_capability && capability == Capability::Unknown {
            tracing::error!("platform capability is unknown");
            return Err(GvmError::InvalidArgument(
                "platform capability is unknown".into(),
            ));
        }
        match self.record_capability(capability) {
            Err(GvmError::AlreadyInitialized) => {
                tracing::debug!(
                    requested = %capability,
                    recorded = ?self.capability(),
                    "va registry already initialized"
                );
                Ok(())
            }
            other => other,
        }
    }

    fn record_capability(&self, capability: Capability) -> Result<()> {
        self.capability
            .set(capability)
            .map_err(|_| GvmError::AlreadyInitialized)
    }

    /// Record a range allocated by `rank` itself.
    pub fn add_va_info(&self, region: GvaRegion, rank: RankId) -> Result<()> {
        let range = AllocatedRange::local(region, rank);
        self.add_range(range)?;
        tracing::info!("add va info success: {range}");
        Ok(())
    }

    /// Record a range registered by `local_rank`, optionally imported from a peer.
    ///
    /// `imported_from` of `None` (or [`crate::INVALID_RANK`]) marks the range
    /// as directly registered.
    pub fn add_va_info_from_external(
        &self,
        region: GvaRegion,
        local_rank: RankId,
        imported_from: Option<RankId>,
    ) -> Result<()> {
        let range = AllocatedRange::imported(
            region,
            local_rank,
            imported_from.unwrap_or(crate::INVALID_RANK),
        );
        self.add_range(range)?;
        tracing::info!("add external va info success: {range}");
        Ok(())
    }

    /// Validate and insert a fully described range.
    ///
    /// A zero-sized range is accepted and ignored. Re-adding an identical
    /// range succeeds without storing a second copy.
    pub fn add_range(&self, range: AllocatedRange) -> Result<()> {
        if range.gva() == 0 {
            tracing::error!(
                "add va info failed: gva={}, lva={}, size={}",
                fmt_va(range.gva()),
                fmt_va(range.lva()),
                fmt_va(range.size())
            );
            return Err(GvmError::InvalidArgument("gva must be non-zero".into()));
        }
        if range.size() == 0 {
            tracing::info!("gva {} has size 0, skip add va info", fmt_va(range.gva()));
            return Ok(());
        }
        if range.gva().checked_add(range.size()).is_none()
            || range.lva().checked_add(range.size()).is_none()
        {
            tracing::error!("add va info failed: range overflows the address space: {range}");
            return Err(GvmError::InvalidArgument(format!(
                "range {range} overflows the address space"
            )));
        }

        let mut inner = self.inner.write();
        match inner.insert(range) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!("va info already present: {range}");
                Ok(())
            }
            Err(e) => {
                tracing::error!("add va info failed: {e}");
                Err(e)
            }
        }
    }

    /// Remove the range whose base is `va`, given either as a GVA or an LVA.
    ///
    /// `va` is treated as a GVA if any allocated range contains it, otherwise
    /// as an LVA. Removal is by base address: an interior address removes
    /// nothing. Unknown addresses are a no-op. When a GVA base is shared by ranges of
    /// both memory classes, one call removes one of them.
    pub fn remove_one_va_info(&self, va: u64) -> Option<AllocatedRange> {
        if va == 0 {
            return None;
        }
        let mut inner = self.inner.write();
        match inner.remove(va) {
            Ok(Some(range)) => {
                tracing::info!("remove va info success: {range}");
                Some(range)
            }
            Ok(None) => {
                tracing::debug!("remove va info: {} is neither a gva nor an lva", fmt_va(va));
                None
            }
            Err(e) => {
                tracing::warn!("remove va info skipped: {e}");
                None
            }
        }
    }

    /// Translate an LVA to its GVA. Returns 0 when `lva` is not mapped.
    pub fn get_gva_by_lva(&self, lva: u64) -> u64 {
        if lva == 0 {
            return 0;
        }
        let inner = self.inner.read();
        match inner.find_by_lva(lva).and_then(|range| range.lva_to_gva(lva)) {
            Some(gva) => {
                tracing::debug!("lva {} -> gva {}", fmt_va(lva), fmt_va(gva));
                gva
            }
            None => {
                tracing::debug!("no gva mapping found for lva {}", fmt_va(lva));
                0
            }
        }
    }

    /// Translate a GVA to its LVA. Returns 0 when `gva` is not mapped.
    pub fn get_lva_by_gva(&self, gva: u64) -> u64 {
        if gva == 0 {
            return 0;
        }
        let inner = self.inner.read();
        match inner.find_by_gva(gva).and_then(|range| range.gva_to_lva(gva)) {
            Some(lva) => {
                tracing::debug!("gva {} -> lva {}", fmt_va(gva), fmt_va(lva));
                lva
            }
            None => {
                tracing::debug!("no lva mapping found for gva {}", fmt_va(gva));
                0
            }
        }
    }

    /// Returns true if `va` falls inside an allocated range's GVA interval.
    pub fn is_gva(&self, va: u64) -> bool {
        va != 0 && self.inner.read().find_by_gva(va).is_some()
    }

    /// Memory class of `va`, looked up as a GVA, then as an LVA, then as a
    /// reserved address.
    pub fn get_mem_type(&self, va: u64) -> Option<MemoryClass> {
        if va == 0 {
            return None;
        }
        let inner = self.inner.read();
        let class = inner
            .find_by_gva(va)
            .or_else(|| inner.find_by_lva(va))
            .map(|range| range.memory_class())
            .or_else(|| inner.find_reserved(va).map(|range| range.class));
        tracing::trace!("memory class of {}: {:?}", fmt_va(va), class);
        class
    }

    /// Local rank that registered the range containing `gva`.
    ///
    /// For imported ranges this is the importing rank, not the remote owner.
    pub fn get_rank(&self, gva: u64) -> Option<RankId> {
        if gva == 0 {
            tracing::warn!("get rank: gva 0 is invalid");
            return None;
        }
        self.inner
            .read()
            .find_by_gva(gva)
            .map(|range| range.owner_rank())
    }

    /// Returns true if `va` is either a known GVA or a mapped LVA.
    pub fn is_valid_addr(&self, va: u64) -> bool {
        self.is_gva(va) || self.get_gva_by_lva(va) != 0
    }

    /// Copy of the allocated range whose GVA interval contains `va`.
    pub fn find_alloc_by_gva(&self, va: u64) -> Option<AllocatedRange> {
        self.inner.read().find_by_gva(va).copied()
    }

    /// Copy of the allocated range whose LVA interval contains `va`.
    pub fn find_alloc_by_lva(&self, va: u64) -> Option<AllocatedRange> {
        self.inner.read().find_by_lva(va).copied()
    }

    /// Copy of the reserved range containing `va`.
    pub fn find_reserved_by_addr(&self, va: u64) -> Option<ReservedRange> {
        self.inner.read().find_reserved(va).copied()
    }

    /// Compact description of the range containing `va` for log messages,
    /// falling back to the bare address.
    pub fn describe_va(&self, va: u64) -> String {
        let inner = self.inner.read();
        inner
            .find_by_gva(va)
            .or_else(|| inner.find_by_lva(va))
            .map(|range| range.describe())
            .unwrap_or_else(|| fmt_va(va))
    }

    /// Claim `size` bytes of the reservation window for `rank`.
    ///
    /// Uses the lowest gap that fits. The window is shared by both memory
    /// classes. Returns `None` for a zero size or when no gap fits.
    pub fn alloc_reserve_gva(
        &self,
        rank: RankId,
        size: u64,
        class: MemoryClass,
    ) -> Option<ReservedRange> {
        if size == 0 {
            tracing::error!("alloc reserve gva failed: size=0");
            return None;
        }

        let mut inner = self.inner.write();
        let (start, end) = (self.config.reserve_start, self.config.reserve_end);
        tracing::debug!("searching reserve window {}-{}", fmt_va(start), fmt_va(end));

        let Some(addr) = inner.find_free_space(start, end, size) else {
            tracing::error!(
                "alloc reserve gva failed: no free space for size={}",
                fmt_va(size)
            );
            return None;
        };

        let reserved = ReservedRange {
            start: addr,
            size,
            class,
            owner_rank: rank,
        };
        inner.reserved.insert(addr, reserved);
        tracing::info!("alloc reserve gva success: {reserved}");
        Some(reserved)
    }

    /// Release the reservation starting exactly at `addr`.
    pub fn free_reserve_gva(&self, addr: u64) -> Option<ReservedRange> {
        if addr == 0 {
            tracing::warn!("free reserve gva failed: invalid addr=0");
            return None;
        }
        let removed = self.inner.write().reserved.remove(&addr);
        match removed {
            Some(reserved) => tracing::info!("free reserve gva success: {reserved}"),
            None => tracing::warn!(
                "free reserve gva failed: {}",
                GvmError::ObjectNotFound(format!("reservation at {}", fmt_va(addr)))
            ),
        }
        removed
    }

    /// Human-readable report of all reservations; also logged at debug level.
    pub fn dump_reserved_gva_info(&self) -> String {
        let inner = self.inner.read();
        let mut report = String::new();
        let _ = writeln!(report, "total reserved spaces: {}", inner.reserved.len());
        if inner.reserved.is_empty() {
            tracing::warn!("no reserved spaces found");
        }

        let mut total_mb = 0u64;
        for (index, reserved) in inner.reserved.values().enumerate() {
            let _ = writeln!(report, "{}. {reserved}", index + 1);
            total_mb += reserved.size >> MB_SHIFT;
        }
        let _ = writeln!(report, "total reserved size: {total_mb}MB");

        tracing::debug!("{report}");
        report
    }

    /// Human-readable report of all allocated ranges with per-class totals;
    /// also logged at debug level.
    pub fn dump_allocated_gva_info(&self) -> String {
        let inner = self.inner.read();
        let mut report = String::new();
        let count = inner.alloc_count();
        let _ = writeln!(report, "total allocated spaces: {count}");
        if count == 0 {
            tracing::warn!("no allocated spaces found");
        }

        let mut total_mb = 0u64;
        let mut by_class: HashMap<MemoryClass, (usize, u64)> = HashMap::new();
        for (index, range) in inner.allocated().enumerate() {
            let _ = writeln!(report, "{}. {range}", index + 1);
            let mb = range.size() >> MB_SHIFT;
            total_mb += mb;
            let entry = by_class.entry(range.memory_class()).or_default();
            entry.0 += 1;
            entry.1 += mb;
        }
        let _ = writeln!(report, "total allocated size: {total_mb}MB");

        for class in MemoryClass::all() {
            if let Some((count, mb)) = by_class.get(&class) {
                let _ = writeln!(report, "{class}: {count} allocations, total size: {mb}MB");
            }
        }

        tracing::debug!("{report}");
        report
    }

    /// Number of allocated ranges.
    pub fn get_alloc_count(&self) -> usize {
        self.inner.read().alloc_count()
    }

    /// Number of reserved ranges.
    pub fn get_reserved_count(&self) -> usize {
        self.inner.read().reserved.len()
    }

    /// Drop every allocated and reserved range.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write();
        tracing::debug!(
            allocated = inner.alloc_count(),
            reserved = inner.reserved.len(),
            "clearing va registry"
        );
        *inner = Indexes::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_RANK;
    use rstest::{fixture, rstest};

    const GVA_HOST: u64 = 0x2800_0100_0000;
    const GVA_DEVICE: u64 = 0x3800_0100_0000;
    const LVA: u64 = 0x1_0000_0000;
    const MB: u64 = 0x10_0000;
    const SIZE_16M: u64 = 16 * MB;

    #[fixture]
    fn registry() -> VaRegistry {
        VaRegistry::default()
    }

    fn host(gva: u64, size: u64, lva: u64) -> GvaRegion {
        GvaRegion::new(gva, size, MemoryClass::Host, lva)
    }

    fn device(gva: u64, size: u64, lva: u64) -> GvaRegion {
        GvaRegion::new(gva, size, MemoryClass::Device, lva)
    }

    #[rstest]
    #[case(Capability::Ascend910B)]
    #[case(Capability::Ascend910C)]
    #[case(Capability::Unknown)]
    fn test_initialize_is_idempotent(registry: VaRegistry, #[case] capability: Capability) {
        assert!(registry.initialize(capability).is_ok());
        assert!(registry.initialize(Capability::Ascend950).is_ok());
        assert_eq!(registry.capability(), Some(capability));
    }

    #[test]
    fn test_initialize_rejects_unknown_when_required() {
        let config = GvmConfig::builder().require_capability(true).build().unwrap();
        let registry = VaRegistry::new(config);
        assert!(matches!(
            registry.initialize(Capability::Unknown),
            Err(GvmError::InvalidArgument(_))
        ));
        assert_eq!(registry.capability(), None);
        assert!(registry.initialize(Capability::Ascend910B).is_ok());
    }

    #[rstest]
    fn test_add_va_info_records_local_range(registry: VaRegistry) {
        registry
            .add_va_info(device(GVA_DEVICE, SIZE_16M, LVA), 1)
            .unwrap();

        let range = registry.find_alloc_by_gva(GVA_DEVICE).unwrap();
        assert!(range.is_registered());
        assert_eq!(range.imported_from(), None);
        assert_eq!(range.owner_rank(), 1);
        assert_eq!(range.memory_class(), MemoryClass::Device);
    }

    #[rstest]
    fn test_add_external_imported_range(registry: VaRegistry) {
        registry
            .add_va_info_from_external(host(GVA_HOST, SIZE_16M, LVA), 0, Some(3))
            .unwrap();

        let range = registry.find_alloc_by_gva(GVA_HOST + MB).unwrap();
        assert!(!range.is_registered());
        assert_eq!(range.imported_from(), Some(3));
        // the local rank, not the remote owner
        assert_eq!(registry.get_rank(GVA_HOST + MB), Some(0));
    }

    #[rstest]
    fn test_add_external_with_invalid_rank_is_registered(registry: VaRegistry) {
        registry
            .add_va_info_from_external(host(GVA_HOST, SIZE_16M, LVA), 2, Some(INVALID_RANK))
            .unwrap();
        let range = registry.find_alloc_by_gva(GVA_HOST).unwrap();
        assert!(range.is_registered());
        assert_eq!(range.imported_from(), None);
    }

    #[rstest]
    fn test_zero_gva_is_rejected(registry: VaRegistry) {
        let result = registry.add_va_info(host(0, SIZE_16M, LVA), 0);
        assert!(matches!(result, Err(GvmError::InvalidArgument(_))));
        assert_eq!(registry.get_alloc_count(), 0);
    }

    #[rstest]
    fn test_zero_size_is_a_noop(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, 0, LVA), 0).unwrap();
        assert_eq!(registry.get_alloc_count(), 0);
        assert!(!registry.is_gva(GVA_HOST));
    }

    #[rstest]
    fn test_overflowing_range_is_rejected(registry: VaRegistry) {
        let result = registry.add_va_info(host(u64::MAX - 0x10, 0x100, LVA), 0);
        assert!(matches!(result, Err(GvmError::InvalidArgument(_))));
    }

    #[rstest]
    fn test_zero_lva_is_accepted_but_not_translatable(registry: VaRegistry) {
        registry
            .add_va_info_from_external(host(GVA_HOST, SIZE_16M, 0), 0, Some(1))
            .unwrap();
        assert!(registry.is_gva(GVA_HOST));
        assert_eq!(registry.get_lva_by_gva(GVA_HOST), 0);
        assert_eq!(registry.get_gva_by_lva(1), 0);
        assert_eq!(
            registry.describe_va(GVA_HOST),
            format!("{{gva: {}, RH(0), lva: 0x0}}", fmt_va(GVA_HOST))
        );
    }

    #[rstest]
    #[case::same_start(GVA_HOST, 4 * MB)]
    #[case::interior(GVA_HOST + MB, MB)]
    #[case::straddles_start(GVA_HOST - MB, 2 * MB)]
    #[case::straddles_end(GVA_HOST + SIZE_16M - MB, 2 * MB)]
    #[case::encloses(GVA_HOST - MB, SIZE_16M + 2 * MB)]
    fn test_overlapping_gva_is_rejected(registry: VaRegistry, #[case] gva: u64, #[case] size: u64) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();

        let result = registry.add_va_info(host(gva, size, LVA + 0x10 * SIZE_16M), 0);
        match result {
            Err(GvmError::AddressOverlap { existing, .. }) => assert_eq!(existing.gva(), GVA_HOST),
            other => panic!("expected AddressOverlap, got {other:?}"),
        }
        assert_eq!(registry.get_alloc_count(), 1);
    }

    #[rstest]
    fn test_adjacent_ranges_do_not_overlap(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info(host(GVA_HOST + SIZE_16M, SIZE_16M, LVA + SIZE_16M), 0)
            .unwrap();
        registry
            .add_va_info(host(GVA_HOST - SIZE_16M, SIZE_16M, LVA - SIZE_16M), 0)
            .unwrap();
        assert_eq!(registry.get_alloc_count(), 3);
    }

    #[rstest]
    fn test_overlapping_lva_is_rejected(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        let result = registry.add_va_info(host(GVA_HOST + SIZE_16M, SIZE_16M, LVA + MB), 0);
        assert!(matches!(result, Err(GvmError::AddressOverlap { .. })));
    }

    #[rstest]
    fn test_identical_readd_is_idempotent(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info_from_external(host(GVA_HOST, SIZE_16M, LVA), 4, Some(5))
            .unwrap();
        assert_eq!(registry.get_alloc_count(), 1);
        // first registration wins
        assert_eq!(registry.get_rank(GVA_HOST), Some(0));
    }

    #[rstest]
    fn test_translation_both_directions(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();

        assert_eq!(registry.get_gva_by_lva(LVA), GVA_HOST);
        assert_eq!(registry.get_lva_by_gva(GVA_HOST), LVA);
        assert_eq!(registry.get_gva_by_lva(LVA + 0x80000), GVA_HOST + 0x80000);
        assert_eq!(registry.get_lva_by_gva(GVA_HOST + 0x80000), LVA + 0x80000);

        assert_eq!(registry.get_gva_by_lva(LVA + SIZE_16M), 0);
        assert_eq!(registry.get_lva_by_gva(GVA_HOST + SIZE_16M), 0);
        assert_eq!(registry.get_gva_by_lva(0), 0);
        assert_eq!(registry.get_lva_by_gva(0), 0);
    }

    #[rstest]
    fn test_queries_on_empty_registry(registry: VaRegistry) {
        assert!(!registry.is_gva(GVA_HOST));
        assert!(!registry.is_valid_addr(GVA_HOST));
        assert_eq!(registry.get_mem_type(GVA_HOST), None);
        assert_eq!(registry.get_rank(GVA_HOST), None);
        assert_eq!(registry.find_reserved_by_addr(GVA_HOST), None);
        assert_eq!(registry.describe_va(0x1234), "0x1234");
    }

    #[rstest]
    fn test_is_gva_boundaries(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        assert!(registry.is_gva(GVA_HOST));
        assert!(registry.is_gva(GVA_HOST + SIZE_16M - 1));
        assert!(!registry.is_gva(GVA_HOST + SIZE_16M));
        assert!(!registry.is_gva(0));
        // an lva is not a gva
        assert!(!registry.is_gva(LVA));
        assert!(registry.is_valid_addr(LVA + 1));
    }

    #[rstest]
    fn test_get_mem_type_by_gva_lva_and_reservation(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info(device(GVA_DEVICE, SIZE_16M, LVA + SIZE_16M), 1)
            .unwrap();
        let reserved = registry
            .alloc_reserve_gva(2, SIZE_16M, MemoryClass::Device)
            .unwrap();

        assert_eq!(registry.get_mem_type(GVA_HOST), Some(MemoryClass::Host));
        assert_eq!(registry.get_mem_type(GVA_DEVICE + MB), Some(MemoryClass::Device));
        assert_eq!(registry.get_mem_type(LVA + SIZE_16M + MB), Some(MemoryClass::Device));
        assert_eq!(registry.get_mem_type(reserved.start + MB), Some(MemoryClass::Device));
        assert_eq!(registry.get_mem_type(0), None);
    }

    #[rstest]
    fn test_remove_by_gva_and_by_lva(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info(host(GVA_HOST + SIZE_16M, SIZE_16M, LVA + SIZE_16M), 0)
            .unwrap();

        let removed = registry.remove_one_va_info(GVA_HOST).unwrap();
        assert_eq!(removed.gva(), GVA_HOST);
        assert!(!registry.is_gva(GVA_HOST));
        assert_eq!(registry.get_gva_by_lva(LVA), 0);

        let removed = registry.remove_one_va_info(LVA + SIZE_16M).unwrap();
        assert_eq!(removed.gva(), GVA_HOST + SIZE_16M);
        assert_eq!(registry.get_alloc_count(), 0);
    }

    #[rstest]
    fn test_remove_requires_base_address(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        assert!(registry.remove_one_va_info(GVA_HOST + MB).is_none());
        assert!(registry.remove_one_va_info(LVA + MB).is_none());
        assert_eq!(registry.get_alloc_count(), 1);
    }

    #[rstest]
    fn test_remove_twice_is_a_noop(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        assert!(registry.remove_one_va_info(GVA_HOST).is_some());
        assert!(registry.remove_one_va_info(GVA_HOST).is_none());
        assert!(registry.remove_one_va_info(0).is_none());
    }

    #[rstest]
    fn test_remove_resolves_gva_before_lva(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        // device range whose lva base sits inside the host range's gva interval
        registry
            .add_va_info(device(GVA_DEVICE, SIZE_16M, GVA_HOST + MB), 1)
            .unwrap();
        assert!(registry.is_gva(GVA_HOST + MB));

        assert!(registry.remove_one_va_info(GVA_HOST + MB).is_none());
        assert_eq!(registry.get_alloc_count(), 2);

        assert!(registry.remove_one_va_info(GVA_HOST).is_some());
        let removed = registry.remove_one_va_info(GVA_HOST + MB).unwrap();
        assert_eq!(removed.gva(), GVA_DEVICE);
        assert_eq!(registry.get_alloc_count(), 0);
    }

    #[test]
    fn test_remove_distinguishes_unknown_from_interior() {
        let mut indexes = Indexes::default();
        indexes
            .insert(AllocatedRange::local(host(GVA_HOST, SIZE_16M, LVA), 0))
            .unwrap();

        assert!(matches!(indexes.remove(GVA_DEVICE), Ok(None)));
        assert!(matches!(
            indexes.remove(GVA_HOST + MB),
            Err(GvmError::ObjectNotFound(_))
        ));
        assert!(matches!(indexes.remove(LVA + MB), Err(GvmError::ObjectNotFound(_))));
        assert!(matches!(indexes.remove(LVA), Ok(Some(_))));
        assert!(matches!(indexes.remove(GVA_HOST), Ok(None)));
        assert_eq!(indexes.alloc_count(), 0);
    }

    #[rstest]
    fn test_remove_shared_base_across_classes(registry: VaRegistry) {
        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info(device(GVA_HOST, SIZE_16M, LVA + SIZE_16M), 0)
            .unwrap();
        assert_eq!(registry.get_alloc_count(), 2);

        assert!(registry.remove_one_va_info(GVA_HOST).is_some());
        assert_eq!(registry.get_alloc_count(), 1);
        assert!(registry.is_gva(GVA_HOST));
        assert!(registry.remove_one_va_info(GVA_HOST).is_some());
        assert_eq!(registry.get_alloc_count(), 0);
    }

    #[rstest]
    fn test_reservations_are_first_fit(registry: VaRegistry) {
        let start = registry.config().reserve_start;
        let a = registry.alloc_reserve_gva(0, SIZE_16M, MemoryClass::Host).unwrap();
        let b = registry.alloc_reserve_gva(0, SIZE_16M, MemoryClass::Host).unwrap();
        let c = registry.alloc_reserve_gva(1, SIZE_16M, MemoryClass::Device).unwrap();
        assert_eq!(a.start, start);
        assert_eq!(b.start, start + SIZE_16M);
        assert_eq!(c.start, start + 2 * SIZE_16M);

        // hole left by b is reused
        registry.free_reserve_gva(b.start).unwrap();
        let d = registry.alloc_reserve_gva(2, MB, MemoryClass::Device).unwrap();
        assert_eq!(d.start, b.start);
        assert_eq!(d.owner_rank, 2);
        assert_eq!(registry.get_reserved_count(), 3);

        // too big for the hole, goes after c
        let e = registry.alloc_reserve_gva(2, SIZE_16M, MemoryClass::Host).unwrap();
        assert_eq!(e.start, c.end());
    }

    #[test]
    fn test_reservation_window_exhaustion() {
        let config = GvmConfig::builder()
            .reserve_start(0x10000)
            .reserve_end(0x30000)
            .build()
            .unwrap();
        let registry = VaRegistry::new(config);

        assert!(registry.alloc_reserve_gva(0, 0x40000, MemoryClass::Host).is_none());
        assert!(registry.alloc_reserve_gva(0, 0x10000, MemoryClass::Host).is_some());
        assert!(registry.alloc_reserve_gva(0, 0x10000, MemoryClass::Host).is_some());
        assert!(registry.alloc_reserve_gva(0, 1, MemoryClass::Host).is_none());
        assert!(registry.alloc_reserve_gva(0, 0, MemoryClass::Host).is_none());
        assert_eq!(registry.get_reserved_count(), 2);
    }

    #[rstest]
    fn test_free_reserve_unknown_address(registry: VaRegistry) {
        let reserved = registry.alloc_reserve_gva(0, SIZE_16M, MemoryClass::Host).unwrap();
        assert!(registry.free_reserve_gva(0).is_none());
        assert!(registry.free_reserve_gva(reserved.start + MB).is_none());
        assert_eq!(registry.get_reserved_count(), 1);
        assert_eq!(registry.find_reserved_by_addr(reserved.start + MB), Some(reserved));
    }

    #[rstest]
    fn test_dump_reports(registry: VaRegistry) {
        assert!(registry.dump_allocated_gva_info().contains("total allocated spaces: 0"));
        assert!(registry.dump_reserved_gva_info().contains("total reserved spaces: 0"));

        registry.add_va_info(host(GVA_HOST, SIZE_16M, LVA), 0).unwrap();
        registry
            .add_va_info(device(GVA_DEVICE, SIZE_16M, LVA + SIZE_16M), 1)
            .unwrap();
        registry.alloc_reserve_gva(0, SIZE_16M, MemoryClass::Host).unwrap();

        let report = registry.dump_allocated_gva_info();
        assert!(report.contains("total allocated spaces: 2"));
        assert!(report.contains("total allocated size: 32MB"));
        assert!(report.contains("HOST: 1 allocations, total size: 16MB"));
        assert!(report.contains("DEVICE: 1 allocations, total size: 16MB"));

        let report = registry.dump_reserved_gva_info();
        assert!(report.contains("total reserved spaces: 1"));
        assert!(report.contains("total reserved size: 16MB"));
    }

    #[rstest]
    fn test_clear_all(registry: VaRegistry) {
        for i in 0..5 {
            registry
                .add_va_info(host(GVA_HOST + i * SIZE_16M, SIZE_16M, LVA + i * SIZE_16M), 0)
                .unwrap();
        }
        for _ in 0..3 {
            registry.alloc_reserve_gva(0, SIZE_16M, MemoryClass::Host).unwrap();
        }
        assert_eq!(registry.get_alloc_count(), 5);
        assert_eq!(registry.get_reserved_count(), 3);

        registry.clear_all();
        assert_eq!(registry.get_alloc_count(), 0);
        assert_eq!(registry.get_reserved_count(), 0);
        assert_eq!(registry.get_gva_by_lva(LVA), 0);
    }

    #[test]
    fn test_from_settings_uses_environment() {
        temp_env::with_vars(
            vec![
                (crate::config::DYN_GVM_CONFIG_PATH, None::<&str>),
                (crate::config::DYN_GVM_RESERVE_START, Some("0x100000")),
                (crate::config::DYN_GVM_RESERVE_END, Some("0x200000")),
                (crate::config::DYN_GVM_REQUIRE_CAPABILITY, None),
            ],
            || {
                let registry = VaRegistry::from_settings().unwrap();
                let reserved = registry.alloc_reserve_gva(0, MB, MemoryClass::Host).unwrap();
                assert_eq!(reserved.start, 0x100000);
            },
        );
    }

    #[test]
    fn test_from_settings_reports_config_error() {
        temp_env::with_vars(
            vec![
                (crate::config::DYN_GVM_CONFIG_PATH, None::<&str>),
                (crate::config::DYN_GVM_RESERVE_START, Some("0x200000")),
                (crate::config::DYN_GVM_RESERVE_END, Some("0x100000")),
                (crate::config::DYN_GVM_REQUIRE_CAPABILITY, None),
            ],
            || {
                let result = VaRegistry::from_settings();
                assert!(matches!(result, Err(GvmError::Config(_))));
            },
        );
    }
}
