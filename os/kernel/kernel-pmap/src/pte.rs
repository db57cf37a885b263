//! # x86-64 page-table entries and tables
//!
//! - [`PageTableEntry`]: bitfield view over one 64-bit entry, common to all
//!   four levels. Only 4 KiB leaves are used, so `PS`/`PAT` stays clear.
//! - [`PageTable`]: a 4 KiB-aligned array of 512 entries, stored as
//!   [`AtomicU64`] because the hardware walker sets `A`/`D` bits concurrently
//!   with software updates.
//! - [`Level`]: PML4 → PDPT → PD → PT and the VA bits that index each.
//!
//! ## Invariants
//!
//! - Leaf updates that may race with the hardware walker go through
//!   [`PageTable::swap`] or [`PageTable::update`], so a concurrently set
//!   `A`/`D` bit is either returned to the caller or preserved.
//! - After modifying a present entry the caller performs TLB maintenance.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::{ENTRIES_PER_TABLE, PAGE_SHIFT};
use crate::prot::VmProt;
use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU64, Ordering};

/// A single 64-bit x86-64 page-table entry.
///
/// ### Bit layout
///
/// | Bits   | Name          | Meaning |
/// |--------|---------------|---------|
/// | 0      | `P`           | Present |
/// | 1      | `RW`          | Writable |
/// | 2      | `US`          | User accessible |
/// | 3      | `PWT`         | Write-through |
/// | 4      | `PCD`         | Cache disable |
/// | 5      | `A`           | Accessed (set by hardware) |
/// | 6      | `D`           | Dirty (leaf, set by hardware) |
/// | 7      | `PS`/`PAT`    | Unused here, always 0 |
/// | 8      | `G`           | Global |
/// | 9      | wired         | OS-available; marks a wired mapping |
/// | 10–11  |               | OS-available, unused |
/// | 12–51  | `addr`        | Physical frame bits [51:12] |
/// | 52–58  |               | OS-available, unused |
/// | 59–62  | `PKU`         | Protection key, unused |
/// | 63     | `NX`          | Execute disable |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    /// Software bit: the mapping may not be evicted and its page-table page
    /// is never collected.
    pub wired: bool,
    #[bits(2)]
    __os_low: u8,
    #[bits(40)]
    frame_bits: u64,
    #[bits(7)]
    __os_high: u8,
    #[bits(4)]
    __protection_key: u8,
    pub no_execute: bool,
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Whether the entry maps something (a table or a page).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.present()
    }

    /// Physical frame the entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, pa: PhysicalAddress) -> Self {
        self.with_frame_bits(pa.as_u64() >> PAGE_SHIFT)
    }

    /// Leaf entry mapping `pa` with `prot`.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, prot: VmProt, user: bool, wired: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(prot.contains(VmProt::WRITE))
            .with_no_execute(!prot.contains(VmProt::EXECUTE))
            .with_user(user)
            .with_wired(wired)
            .with_frame(pa)
    }

    /// Entry pointing to the next-level table at `pa`.
    ///
    /// Intermediate entries are permissive; the leaf decides access.
    #[inline]
    #[must_use]
    pub const fn table(pa: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(pa)
    }

    /// Effective protection of a leaf.
    #[must_use]
    pub fn protection(self) -> VmProt {
        if !self.present() {
            return VmProt::NONE;
        }
        let mut prot = VmProt::READ;
        prot.set(VmProt::WRITE, self.writable());
        prot.set(VmProt::EXECUTE, !self.no_execute());
        prot
    }

    /// Narrow the leaf to at most `prot`. Never grants access.
    #[inline]
    #[must_use]
    pub const fn restricted(self, prot: VmProt) -> Self {
        let mut e = self;
        if !prot.contains(VmProt::WRITE) {
            e = e.with_writable(false);
        }
        if !prot.contains(VmProt::EXECUTE) {
            e = e.with_no_execute(true);
        }
        e
    }

    /// Same entry with the hardware-maintained `A`/`D` bits cleared, for
    /// comparing software state.
    #[inline]
    #[must_use]
    pub const fn without_hardware_bits(self) -> Self {
        self.with_accessed(false).with_dirty(false)
    }
}

/// Paging level, top first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Levels that hold pointers to further tables.
    pub const DIRECTORIES: [Self; 3] = [Self::Pml4, Self::Pdpt, Self::Pd];

    /// Bit position of this level's index in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// Table index for `va` at this level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// The level below, or `None` for a leaf table.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

/// One page-table page: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, index: usize, e: PageTableEntry) {
        self.entries[index].store(e.into_bits(), Ordering::Release);
    }

    /// Replace the entry, returning the previous value including any `A`/`D`
    /// bits the hardware set up to this instant.
    #[inline]
    pub fn swap(&self, index: usize, e: PageTableEntry) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[index].swap(e.into_bits(), Ordering::AcqRel))
    }

    /// Clear the entry; returns the previous value.
    #[inline]
    pub fn clear(&self, index: usize) -> PageTableEntry {
        self.swap(index, PageTableEntry::zero())
    }

    /// Atomically apply `f`, retrying if the hardware changed the entry in
    /// between. Returns the previous value.
    #[inline]
    pub fn update(
        &self,
        index: usize,
        mut f: impl FnMut(PageTableEntry) -> PageTableEntry,
    ) -> PageTableEntry {
        let mut cur = self.entries[index].load(Ordering::Acquire);
        loop {
            let new = f(PageTableEntry::from_bits(cur)).into_bits();
            match self.entries[index].compare_exchange_weak(
                cur,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return PageTableEntry::from_bits(prev),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Zero every entry.
    pub fn zero(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
        core::sync::atomic::fence(Ordering::Release);
    }

    /// Indices and values of all present entries.
    pub fn valid_entries(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        (0..ENTRIES_PER_TABLE)
            .map(|i| (i, self.load(i)))
            .filter(|(_, e)| e.is_valid())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.valid_entries().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wired_lives_in_bit_nine() {
        let e = PageTableEntry::new().with_wired(true);
        assert_eq!(e.into_bits(), 1 << 9);
        let e = PageTableEntry::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }

    #[test]
    fn leaf_encodes_protection() {
        let pa = PhysicalAddress::new(0x1234_5000);
        let e = PageTableEntry::leaf(pa, VmProt::READ_WRITE, true, false);
        assert!(e.is_valid() && e.writable() && e.user() && e.no_execute());
        assert_eq!(e.frame(), pa);
        assert_eq!(e.protection(), VmProt::READ_WRITE);

        let x = PageTableEntry::leaf(pa, VmProt::READ | VmProt::EXECUTE, false, true);
        assert!(!x.writable() && !x.no_execute() && x.wired());
        assert_eq!(x.protection(), VmProt::READ | VmProt::EXECUTE);
        assert_eq!(PageTableEntry::zero().protection(), VmProt::NONE);
    }

    #[test]
    fn restricted_never_grants() {
        let pa = PhysicalAddress::new(0x5000);
        let ro = PageTableEntry::leaf(pa, VmProt::READ, false, false);
        assert_eq!(ro.restricted(VmProt::ALL), ro);
        let rw = PageTableEntry::leaf(pa, VmProt::ALL, false, false);
        let r = rw.restricted(VmProt::READ);
        assert!(!r.writable() && r.no_execute() && r.is_valid());
    }

    #[test]
    fn level_indices() {
        let va = VirtualAddress::new(0xFFFF_8000_4020_3000);
        assert_eq!(Level::Pml4.index(va), 256);
        assert_eq!(Level::Pdpt.index(va), 1);
        assert_eq!(Level::Pd.index(va), 1);
        assert_eq!(Level::Pt.index(va), 3);
        assert_eq!(Level::Pd.span(), 2 * 1024 * 1024);
        assert_eq!(Level::Pd.next(), Some(Level::Pt));
    }

    #[test]
    fn table_swap_and_update() {
        let t = PageTable::new();
        assert!(t.is_empty());
        let e = PageTableEntry::leaf(PhysicalAddress::new(0x3000), VmProt::READ_WRITE, false, false);
        assert_eq!(t.swap(7, e), PageTableEntry::zero());
        let prev = t.update(7, |cur| cur.with_dirty(true));
        assert_eq!(prev, e);
        assert!(t.load(7).dirty());
        assert_eq!(t.valid_entries().map(|(i, _)| i).collect::<Vec<_>>(), vec![7]);
        assert!(t.clear(7).dirty());
        assert!(t.is_empty());
    }
}
