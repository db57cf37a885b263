//! # Per-mapping operations
//!
//! Operations on one map and a virtual range: enter, remove, protect,
//! extract, change wiring, collect. Each takes the map-system lock for
//! reading and then the target map's lock; a PV lock bit is held only while
//! one physical page's PTE and reverse mapping change together.
//!
//! Every change to a valid PTE is followed by a shootdown before the call
//! returns, so no CPU keeps a stale translation past it.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::attributes::PageAttributes;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_PML4_START, PAGE_SIZE};
use crate::error::PmapError;
use crate::locking::{CriticalSection, MapGuard};
use crate::machine::Machine;
use crate::pmap::Pmap;
use crate::prot::VmProt;
use crate::pte::{Level, PageTable, PageTableEntry};
use crate::pv::{PvEntry, PvList};
use crate::system::PhysicalMapSystem;
use crate::walker::{PteSlot, leaf_indices};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// What a valid leaf entry says about one virtual page.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// Physical address, including the page offset of the query.
    pub pa: PhysicalAddress,
    pub prot: VmProt,
    pub wired: bool,
    /// Hardware dirty bit of this mapping.
    pub modified: bool,
    /// Hardware accessed bit of this mapping.
    pub referenced: bool,
}

impl<M: Machine> PhysicalMapSystem<M> {
    /// Map `va` to `pa` with `prot` in `pmap`.
    ///
    /// Re-entering the mapping that is already there updates its protection
    /// and wiring in place. A different `pa` replaces the old mapping, whose
    /// modified/referenced bits are salvaged into the old page's attributes.
    /// `VmProt::NONE` removes the page instead.
    ///
    /// # Errors
    /// - [`PmapError::InvalidAddress`] if `va` lies outside the map's half.
    /// - [`PmapError::ResourceShortage`] if a page-table page or a PV entry
    ///   could not be allocated. No mapping has changed in that case.
    pub fn enter(
        &self,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        wired: bool,
    ) -> Result<(), PmapError> {
        let va = va.trunc_page();
        let pa = pa.trunc_page();
        if !pmap.covers(va) {
            debug!("pmap: enter {va:?} rejected for {}", pmap.id());
            return Err(PmapError::InvalidAddress(va));
        }
        if prot.is_empty() {
            self.remove(pmap, va, va + PAGE_SIZE);
            return Ok(());
        }
        trace!("pmap: {} enter {va:?} -> {pa} {prot:?} wired={wired}", pmap.id());

        let locked = self.read_lock();
        let mut map = MapGuard::lock(pmap);
        let slot = self.ensure(pmap, &mut map, va)?;
        let new = PageTableEntry::leaf(pa, prot, !pmap.is_kernel(), wired);

        let current = slot.load();
        if current.is_valid() && current.frame() == pa {
            let old = slot.update(|e| new.with_accessed(e.accessed()).with_dirty(e.dirty()));
            pmap.wiring_changed(old.wired(), wired);
            if old.without_hardware_bits().with_wired(false) != new.with_wired(false) {
                self.shootdown(locked.cs(), pmap, va, va + PAGE_SIZE);
            }
            return Ok(());
        }

        let old = match self.managed.index(pa) {
            Some(index) => self.install_managed(index, pmap, va, slot, new)?,
            None => slot.swap(new),
        };
        if old.is_valid() {
            self.unlink(pmap, va, old);
            self.shootdown(locked.cs(), pmap, va, va + PAGE_SIZE);
        }
        pmap.mapping_added(wired);
        Ok(())
    }

    /// Store `new` at `slot` and record `(pmap, va)` for managed page
    /// `index`, returning the entry it replaced.
    ///
    /// Overflow storage for the PV list is allocated with the page's lock
    /// bit released. The bit is then retaken and the room checked again,
    /// since another map may have recorded a mapping of the page meanwhile.
    fn install_managed(
        &self,
        index: usize,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        slot: PteSlot<'_>,
        new: PageTableEntry,
    ) -> Result<PageTableEntry, PmapError> {
        let mut storage: Option<Vec<PvEntry>> = None;
        loop {
            let mut pv = self.managed.lock(index);
            let retired = match pv.needed_capacity() {
                None => None,
                Some(needed) if storage.as_ref().is_some_and(|s| s.capacity() >= needed) => {
                    storage.take().map(|s| pv.adopt_storage(s))
                }
                Some(needed) => {
                    drop(pv);
                    storage = Some(PvList::storage(needed)?);
                    continue;
                }
            };

            let old = slot.swap(new);
            pv.record(pmap, va);
            drop(pv);
            drop(retired);
            return Ok(old);
        }
    }

    /// Forget the reverse mapping of a PTE that was just overwritten.
    fn unlink(&self, pmap: &Pmap, va: VirtualAddress, old: PageTableEntry) {
        if let Some(index) = self.managed.index(old.frame()) {
            let mut pv = self.managed.lock(index);
            pv.forget(pmap.id(), va);
            self.managed.merge_attributes(index, PageAttributes::of(old));
        }
        pmap.mapping_removed(old.wired());
    }

    /// Clear the leaf at `slot` if valid, with its reverse mapping.
    fn remove_pte(&self, pmap: &Pmap, slot: PteSlot<'_>, va: VirtualAddress) -> bool {
        let entry = slot.load();
        if !entry.is_valid() {
            return false;
        }
        let old = match self.managed.index(entry.frame()) {
            Some(index) => {
                let mut pv = self.managed.lock(index);
                let old = slot.clear();
                pv.forget(pmap.id(), va);
                self.managed.merge_attributes(index, PageAttributes::of(old));
                old
            }
            None => slot.clear(),
        };
        pmap.mapping_removed(old.wired());
        true
    }

    /// Remove the leaves of `[start, end)` from one leaf table. Returns how
    /// many were valid. The caller shoots down.
    pub(crate) fn remove_leaves(
        &self,
        pmap: &Pmap,
        table: &PageTable,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> usize {
        let mut removed = 0;
        let mut va = start;
        for index in leaf_indices(start, end) {
            if self.remove_pte(pmap, PteSlot::new(table, index), va) {
                removed += 1;
            }
            va += PAGE_SIZE;
        }
        removed
    }

    /// Remove every leaf in `[start, end)`. The caller holds the map lock
    /// and shoots down.
    pub(crate) fn remove_range(
        &self,
        pmap: &Pmap,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> usize {
        let mut removed = 0;
        self.for_each_leaf_table(pmap, start, end, |table, a, b| {
            removed += self.remove_leaves(pmap, table, a, b);
        });
        removed
    }

    /// Remove every mapping in `[start, end)`. Unmapped parts are skipped.
    pub fn remove(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        let Some((start, end)) = pmap.clamp(start, end) else {
            debug!("pmap: remove {start:?}..{end:?} is outside {}", pmap.id());
            return;
        };

        let locked = self.read_lock();
        let _map = MapGuard::lock(pmap);
        let removed = self.remove_range(pmap, start, end);
        if removed != 0 {
            trace!("pmap: {} removed {removed} page(s) in {start:?}..{end:?}", pmap.id());
            self.shootdown(locked.cs(), pmap, start, end);
        }
    }

    /// Narrow every mapping in `[start, end)` to at most `prot`.
    ///
    /// Never grants access: permissions `prot` adds are ignored. Without
    /// [`VmProt::READ`] this is [`remove`](Self::remove).
    pub fn protect(&self, pmap: &Pmap, start: VirtualAddress, end: VirtualAddress, prot: VmProt) {
        if !prot.contains(VmProt::READ) {
            self.remove(pmap, start, end);
            return;
        }
        if prot.contains(VmProt::ALL) {
            return;
        }
        let Some((start, end)) = pmap.clamp(start, end) else {
            debug!("pmap: protect {start:?}..{end:?} is outside {}", pmap.id());
            return;
        };

        let locked = self.read_lock();
        let _map = MapGuard::lock(pmap);
        let mut changed = false;
        self.for_each_leaf_table(pmap, start, end, |table, a, b| {
            for index in leaf_indices(a, b) {
                if !table.load(index).is_valid() {
                    continue;
                }
                let old = table.update(index, |e| e.restricted(prot));
                changed |= old.restricted(prot) != old;
            }
        });
        if changed {
            trace!("pmap: {} protect {start:?}..{end:?} to {prot:?}", pmap.id());
            self.shootdown(locked.cs(), pmap, start, end);
        }
    }

    /// Physical address `va` translates to in `pmap`.
    #[must_use]
    pub fn extract(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translation(pmap, va).map(|t| t.pa)
    }

    /// Full translation of `va` in `pmap`, if mapped.
    #[must_use]
    pub fn translation(&self, pmap: &Pmap, va: VirtualAddress) -> Option<Translation> {
        if !pmap.covers(va) {
            return None;
        }
        let _locked = self.read_lock();
        let _map = MapGuard::lock(pmap);
        let e = self.translate(pmap, va.trunc_page())?.load();
        e.is_valid().then(|| Translation {
            pa: e.frame() + va.page_offset(),
            prot: e.protection(),
            wired: e.wired(),
            modified: e.dirty(),
            referenced: e.accessed(),
        })
    }

    /// Set or clear the wired flag of an existing mapping.
    ///
    /// # Errors
    /// [`PmapError::InvalidAddress`] if `va` lies outside the map's half.
    ///
    /// # Panics
    /// If no page table covers `va`: the mapping was never entered.
    pub fn change_wiring(
        &self,
        pmap: &Pmap,
        va: VirtualAddress,
        wired: bool,
    ) -> Result<(), PmapError> {
        let va = va.trunc_page();
        if !pmap.covers(va) {
            return Err(PmapError::InvalidAddress(va));
        }

        let _locked = self.read_lock();
        let _map = MapGuard::lock(pmap);
        let Some(slot) = self.translate(pmap, va) else {
            panic!("pmap: change_wiring on {} {va:?} with no page table", pmap.id());
        };
        if !slot.load().is_valid() {
            warn!("pmap: change_wiring on unmapped {va:?} in {}", pmap.id());
            return Ok(());
        }
        let old = slot.update(|e| e.with_wired(wired));
        pmap.wiring_changed(old.wired(), wired);
        trace!("pmap: {} {va:?} wired={wired}", pmap.id());
        Ok(())
    }

    /// Free page-table pages of a user map that hold no wired mapping.
    ///
    /// Leaf tables without wired entries lose their mappings and are freed;
    /// directories left empty follow. Returns the number of pages freed.
    /// The kernel map is never collected.
    pub fn collect(&self, pmap: &Pmap) -> usize {
        if pmap.is_kernel() {
            return 0;
        }

        let locked = self.read_lock();
        let cs = locked.cs();
        let _map = MapGuard::lock(pmap);
        let root = self.table(pmap.root());
        let mut freed = 0;

        for i4 in 0..KERNEL_PML4_START {
            let pml4e = root.load(i4);
            if !pml4e.is_valid() {
                continue;
            }
            let pdpt = self.table(pml4e.frame());
            for i3 in 0..ENTRIES_PER_TABLE {
                let pdpte = pdpt.load(i3);
                if !pdpte.is_valid() {
                    continue;
                }
                let pd = self.table(pdpte.frame());
                for i2 in 0..ENTRIES_PER_TABLE {
                    let pde = pd.load(i2);
                    if !pde.is_valid() {
                        continue;
                    }
                    let pt = self.table(pde.frame());
                    if pt.valid_entries().any(|(_, e)| e.wired()) {
                        continue;
                    }
                    let start = table_base(i4, i3, i2);
                    let end = start + Level::Pd.span();
                    self.remove_leaves(pmap, pt, start, end);
                    pd.clear(i2);
                    self.release_table(cs, pmap, pde.frame(), start, Level::Pd);
                    freed += 1;
                }

                if pd.is_empty() {
                    pdpt.clear(i3);
                    let base = table_base(i4, i3, 0);
                    self.release_table(cs, pmap, pdpte.frame(), base, Level::Pdpt);
                    freed += 1;
                }
            }

            if pdpt.is_empty() {
                root.clear(i4);
                let base = table_base(i4, 0, 0);
                self.release_table(cs, pmap, pml4e.frame(), base, Level::Pml4);
                freed += 1;
            }
        }

        debug!("pmap: collected {freed} page-table page(s) from {}", pmap.id());
        freed
    }

    /// Shoot down the range a just-unlinked table covered, then free it.
    fn release_table(
        &self,
        cs: &CriticalSection<'_, M>,
        pmap: &Pmap,
        page: PhysicalAddress,
        start: VirtualAddress,
        parent: Level,
    ) {
        self.shootdown(cs, pmap, start, start + parent.span());
        self.free_pt_page(page);
    }
}

/// First address translated through PML4 slot `i4`, PDPT slot `i3`, PD
/// slot `i2`. User half only.
const fn table_base(i4: usize, i3: usize, i2: usize) -> VirtualAddress {
    VirtualAddress::new(
        ((i4 as u64) << Level::Pml4.shift())
            | ((i3 as u64) << Level::Pdpt.shift())
            | ((i2 as u64) << Level::Pd.shift()),
    )
}
