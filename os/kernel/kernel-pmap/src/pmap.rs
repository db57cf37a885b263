//! # Maps
//!
//! A [`Pmap`] is the translation state of one address space: the root
//! (PML4) page, the CPUs currently running on it, resident/wired counters,
//! and the per-map spin lock. [`PmapHandle`] is the counted reference the VM
//! layer holds; dropping the last one destroys the map.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::{KERNEL_VA_END, KERNEL_VA_START, USER_VA_END};
use crate::machine::{AtomicCpuSet, CpuSet, Machine};
use crate::system::PhysicalMapSystem;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use kernel_sync::SpinLock;

/// Unique, never reused map identifier. The kernel map is `pmap#0`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PmapId(u64);

impl PmapId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmap#{}", self.0)
    }
}

impl fmt::Display for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Source of fresh [`PmapId`]s.
#[derive(Debug)]
pub(crate) struct PmapIds(AtomicU64);

impl PmapIds {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> PmapId {
        PmapId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Snapshot of a map's counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Valid leaf mappings.
    pub resident_count: usize,
    /// Valid leaf mappings with the wired bit set.
    pub wired_count: usize,
}

#[derive(Debug, Default)]
struct Counters {
    resident: AtomicUsize,
    wired: AtomicUsize,
}

/// One address space's translation state.
///
/// Once its last reference is released the map is destroyed: its page-table
/// pages go back to the frame allocator and every later operation on it
/// panics instead of walking them.
pub struct Pmap {
    id: PmapId,
    root: PhysicalAddress,
    kernel: bool,
    refs: AtomicUsize,
    destroyed: AtomicBool,
    cpus_using: AtomicCpuSet,
    counters: Counters,
    pub(crate) lock: SpinLock<()>,
}

impl Pmap {
    pub(crate) fn new(id: PmapId, root: PhysicalAddress, kernel: bool) -> Self {
        Self {
            id,
            root,
            kernel,
            refs: AtomicUsize::new(1),
            destroyed: AtomicBool::new(false),
            cpus_using: AtomicCpuSet::new(),
            counters: Counters::default(),
            lock: SpinLock::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> PmapId {
        self.id
    }

    /// Physical address of the PML4 page.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.kernel
    }

    #[must_use]
    pub fn statistics(&self) -> Statistics {
        Statistics {
            resident_count: self.counters.resident.load(Ordering::Relaxed),
            wired_count: self.counters.wired.load(Ordering::Relaxed),
        }
    }

    /// CPUs whose current address space is this map.
    #[must_use]
    pub fn cpus_using(&self) -> CpuSet {
        self.cpus_using.load()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Whether the last reference is gone and the page tables are freed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Set with the map lock held, before any page-table page is freed.
    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    /// # Panics
    /// If the map has been destroyed.
    pub(crate) fn assert_live(&self) {
        assert!(!self.is_destroyed(), "pmap: {} used after it was destroyed", self.id);
    }

    pub(crate) const fn cpu_set(&self) -> &AtomicCpuSet {
        &self.cpus_using
    }

    /// `[start, end)` of the half this map translates.
    #[must_use]
    pub const fn va_range(&self) -> (VirtualAddress, VirtualAddress) {
        if self.kernel {
            (
                VirtualAddress::new(KERNEL_VA_START),
                VirtualAddress::new(KERNEL_VA_END),
            )
        } else {
            (VirtualAddress::new(0), VirtualAddress::new(USER_VA_END))
        }
    }

    #[must_use]
    pub const fn covers(&self, va: VirtualAddress) -> bool {
        let (start, end) = self.va_range();
        va.as_u64() >= start.as_u64() && va.as_u64() < end.as_u64()
    }

    /// Page-align `[start, end)` and clamp it to this map's half.
    ///
    /// `None` if nothing of the range lies inside the map.
    pub(crate) fn clamp(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<(VirtualAddress, VirtualAddress)> {
        let (lo, hi) = self.va_range();
        let start = start.trunc_page().max(lo);
        let end = end.round_page().min(hi);
        (start < end).then_some((start, end))
    }

    /// Takes one more reference.
    ///
    /// # Panics
    /// If no reference is left: the map is destroyed or being destroyed.
    pub(crate) fn retain(&self) {
        if self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                (r != 0).then(|| r + 1)
            })
            .is_err()
        {
            panic!("pmap: reference to destroyed map {}", self.id);
        }
    }

    /// Drops one reference and returns how many remain.
    ///
    /// # Panics
    /// On underflow: more releases than references.
    pub(crate) fn drop_ref(&self) -> usize {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => panic!("pmap: reference count underflow on {}", self.id),
        }
    }

    pub(crate) fn mapping_added(&self, wired: bool) {
        self.counters.resident.fetch_add(1, Ordering::Relaxed);
        if wired {
            self.counters.wired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn mapping_removed(&self, wired: bool) {
        self.counters.resident.fetch_sub(1, Ordering::Relaxed);
        if wired {
            self.counters.wired.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Adjust the wired count for a mapping whose wired bit flipped.
    pub(crate) fn wiring_changed(&self, was_wired: bool, wired: bool) {
        match (was_wired, wired) {
            (false, true) => {
                self.counters.wired.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                self.counters.wired.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("kernel", &self.kernel)
            .field("refs", &self.ref_count())
            .field("cpus_using", &self.cpus_using())
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

/// A counted reference to a user map.
///
/// Cloning takes another reference; dropping releases one. When the last
/// reference goes, the map's mappings and page-table pages are torn down.
pub struct PmapHandle<'s, M: Machine> {
    system: &'s PhysicalMapSystem<M>,
    pmap: Arc<Pmap>,
}

impl<'s, M: Machine> PmapHandle<'s, M> {
    /// Wraps an already counted reference.
    pub(crate) const fn adopt(system: &'s PhysicalMapSystem<M>, pmap: Arc<Pmap>) -> Self {
        Self { system, pmap }
    }

    #[must_use]
    pub const fn system(&self) -> &'s PhysicalMapSystem<M> {
        self.system
    }
}

impl<M: Machine> Deref for PmapHandle<'_, M> {
    type Target = Arc<Pmap>;

    fn deref(&self) -> &Arc<Pmap> {
        &self.pmap
    }
}

impl<M: Machine> Clone for PmapHandle<'_, M> {
    fn clone(&self) -> Self {
        self.system.reference(&self.pmap)
    }
}

impl<M: Machine> Drop for PmapHandle<'_, M> {
    fn drop(&mut self) {
        self.system.release_ref(&self.pmap);
    }
}

impl<M: Machine> fmt::Debug for PmapHandle<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PmapHandle").field(&self.pmap).finish()
    }
}
