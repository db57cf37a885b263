//! # Page-table walker
//!
//! Finds, and on demand creates, the leaf PTE for a virtual address. Walks
//! start at the map's root and descend PML4 → PDPT → PD → PT; a missing
//! intermediate table ends a lookup but is allocated by [`ensure`].
//!
//! Every function here expects the map's lock to be held.
//!
//! [`ensure`]: PhysicalMapSystem::ensure

use crate::addresses::{PhysicalAddress, VirtualAddress, align_down};
use crate::config::PAGE_SIZE;
use crate::error::PmapError;
use crate::locking::MapGuard;
use crate::machine::Machine;
use crate::pmap::Pmap;
use crate::pte::{Level, PageTable, PageTableEntry};
use crate::system::PhysicalMapSystem;
use core::ops::Range;
use log::trace;

/// One leaf entry.
#[derive(Copy, Clone)]
pub(crate) struct PteSlot<'a> {
    table: &'a PageTable,
    index: usize,
}

impl<'a> PteSlot<'a> {
    pub(crate) const fn new(table: &'a PageTable, index: usize) -> Self {
        Self { table, index }
    }

    #[inline]
    pub(crate) fn load(&self) -> PageTableEntry {
        self.table.load(self.index)
    }

    #[inline]
    pub(crate) fn swap(&self, e: PageTableEntry) -> PageTableEntry {
        self.table.swap(self.index, e)
    }

    #[inline]
    pub(crate) fn clear(&self) -> PageTableEntry {
        self.table.clear(self.index)
    }

    #[inline]
    pub(crate) fn update(&self, f: impl FnMut(PageTableEntry) -> PageTableEntry) -> PageTableEntry {
        self.table.update(self.index, f)
    }
}

impl<M: Machine> PhysicalMapSystem<M> {
    /// Leaf table covering `va`, or the level whose entry is missing.
    pub(crate) fn leaf_table(&self, pmap: &Pmap, va: VirtualAddress) -> Result<&PageTable, Level> {
        let mut table = self.table(pmap.root());
        for level in Level::DIRECTORIES {
            let entry = table.load(level.index(va));
            if !entry.is_valid() {
                return Err(level);
            }
            table = self.table(entry.frame());
        }
        Ok(table)
    }

    /// Leaf entry for `va` if every table above it exists.
    pub(crate) fn translate(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PteSlot<'_>> {
        self.leaf_table(pmap, va)
            .ok()
            .map(|table| PteSlot::new(table, Level::Pt.index(va)))
    }

    /// Leaf entry for `va`, allocating missing tables on the way down.
    ///
    /// The map lock is let go around each allocation. Another CPU may
    /// install or collect a table meanwhile, so the walk restarts from the
    /// root afterwards with the new page in hand; a page that turns out
    /// not to be needed is freed again.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if a table page cannot be allocated.
    /// Tables installed before the failure stay, empty.
    pub(crate) fn ensure(
        &self,
        pmap: &Pmap,
        map: &mut MapGuard<'_>,
        va: VirtualAddress,
    ) -> Result<PteSlot<'_>, PmapError> {
        let user = !pmap.is_kernel();
        let mut spare: Option<PhysicalAddress> = None;

        'walk: loop {
            let mut table = self.table(pmap.root());
            for level in Level::DIRECTORIES {
                let index = level.index(va);
                let mut entry = table.load(index);
                if !entry.is_valid() {
                    let Some(page) = spare.take() else {
                        spare = Some(map.unlocked(|| self.alloc_pt_page())?);
                        continue 'walk;
                    };
                    entry = PageTableEntry::table(page, user);
                    table.store(index, entry);
                    trace!("pmap: {} new {:?} table {page} for {va:?}", pmap.id(), level.next());
                }
                table = self.table(entry.frame());
            }

            if let Some(page) = spare {
                self.free_pt_page(page);
            }
            return Ok(PteSlot::new(table, Level::Pt.index(va)));
        }
    }

    /// Call `f(table, start, end)` for every existing leaf table that covers
    /// part of `[start, end)`, clipped to the part it covers. Gaps with no
    /// table are skipped a whole missing level at a time.
    pub(crate) fn for_each_leaf_table(
        &self,
        pmap: &Pmap,
        start: VirtualAddress,
        end: VirtualAddress,
        mut f: impl FnMut(&PageTable, VirtualAddress, VirtualAddress),
    ) {
        let mut va = start;
        while va < end {
            let (span, table) = match self.leaf_table(pmap, va) {
                Ok(table) => (Level::Pd.span(), Some(table)),
                Err(level) => (level.span(), None),
            };
            let next = VirtualAddress::new(align_down(va.as_u64(), span))
                .checked_add(span)
                .map_or(end, |n| n.min(end));
            if let Some(table) = table {
                f(table, va, next);
            }
            va = next;
        }
    }
}

/// Leaf indices of `[start, end)`, a range within one leaf table.
pub(crate) fn leaf_indices(start: VirtualAddress, end: VirtualAddress) -> Range<usize> {
    let first = Level::Pt.index(start);
    #[allow(clippy::cast_possible_truncation)]
    let count = ((end - start) / PAGE_SIZE) as usize;
    first..first + count
}
