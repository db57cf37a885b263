//! # Platform boundary
//!
//! The physical-map layer never executes privileged instructions itself.
//! The embedding kernel provides them through these traits:
//!
//! - [`FrameAlloc`]: raw 4 KiB frames for page-table pages.
//! - [`PhysMapper`]: turns a page-table frame into a usable reference
//!   (HHDM offset in the kernel, simulated RAM in tests).
//! - [`Processor`]: per-CPU operations (current CPU, TLB flushes, `CR3`
//!   loads, update IPIs) plus interrupt priority.
//!
//! [`Machine`] bundles all of them; anything implementing the three (and
//! `Sync`) is a `Machine`.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::MAX_CPUS;
use crate::pte::PageTable;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::InterruptPriority;

/// Frame allocator for page-table pages.
pub trait FrameAlloc {
    /// Allocate one 4 KiB, 4 KiB-aligned frame. Contents are unspecified.
    ///
    /// `None` signals a resource shortage; the call must not block.
    fn alloc_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_frame`](Self::alloc_frame).
    fn free_frame(&self, pa: PhysicalAddress);
}

/// Access to page-table frames by physical address.
pub trait PhysMapper {
    /// # Safety
    /// `pa` must be a 4 KiB-aligned frame holding a page table that stays
    /// allocated for as long as the returned reference is used.
    unsafe fn table(&self, pa: PhysicalAddress) -> &PageTable;
}

/// Per-CPU machine operations. Each call acts on the calling CPU.
pub trait Processor: InterruptPriority {
    fn current_cpu(&self) -> CpuId;

    /// Invalidate translations for `[start, end)`.
    fn flush_tlb_range(&self, start: VirtualAddress, end: VirtualAddress);

    /// Invalidate all non-global translations.
    fn flush_tlb_all(&self);

    /// Switch to the address space rooted at `root` (`CR3` write).
    fn load_root(&self, root: PhysicalAddress);

    /// Raise the TLB update interrupt on `cpu`.
    fn send_update_interrupt(&self, cpu: CpuId);
}

/// Everything the physical-map layer needs from the platform.
pub trait Machine: FrameAlloc + PhysMapper + Processor + Sync {}

impl<T: FrameAlloc + PhysMapper + Processor + Sync> Machine for T {}

/// Logical CPU number, `0..MAX_CPUS`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u8);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(id: usize) -> Option<Self> {
        if id < MAX_CPUS {
            Some(Self(id as u8))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A set of CPUs as a 64-bit mask.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.0)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.0) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu.0))
    }

    #[inline]
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu.0))
    }

    #[inline]
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let bit = rest.trailing_zeros() as u8;
            rest &= rest - 1;
            Some(CpuId(bit))
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuSet`] updated concurrently by many CPUs.
#[derive(Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }

    /// Adds `cpu`; returns whether it was already present.
    #[inline]
    pub fn insert(&self, cpu: CpuId) -> bool {
        self.0.fetch_or(1 << cpu.0, Ordering::SeqCst) & (1 << cpu.0) != 0
    }

    /// Removes `cpu`; returns whether it was present.
    #[inline]
    pub fn remove(&self, cpu: CpuId) -> bool {
        self.0.fetch_and(!(1 << cpu.0), Ordering::SeqCst) & (1 << cpu.0) != 0
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
