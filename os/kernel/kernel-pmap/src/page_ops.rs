//! # Whole-page operations
//!
//! Operations keyed by a physical page rather than a map: they walk the
//! page's PV list and touch the PTE of every mapping it names. They hold the
//! map-system lock for writing, which keeps every per-mapping operation out,
//! then the page's PV lock, then each visited map's lock in turn.
//!
//! Unmanaged physical addresses have no PV list and no attributes; every
//! operation here treats them as unmapped.

use crate::addresses::PhysicalAddress;
use crate::attributes::PageAttributes;
use crate::config::PAGE_SIZE;
use crate::locking::MapGuard;
use crate::machine::Machine;
use crate::prot::VmProt;
use crate::pte::PageTableEntry;
use crate::pv::PvEntry;
use crate::system::PhysicalMapSystem;
use crate::walker::PteSlot;
use log::{debug, trace, warn};

impl<M: Machine> PhysicalMapSystem<M> {
    /// Leaf entry named by a PV entry.
    ///
    /// # Panics
    /// If the entry's map has no page table there or the PTE does not name
    /// `pa`: the PTE and PV state disagree.
    fn pv_slot(&self, entry: &PvEntry, pa: PhysicalAddress) -> PteSlot<'_> {
        let Some(slot) = self.translate(&entry.pmap, entry.va) else {
            panic!("pmap: reverse mapping {entry:?} of {pa} has no page table");
        };
        let pte = slot.load();
        assert!(
            pte.is_valid() && pte.frame() == pa,
            "pmap: reverse mapping {entry:?} does not map {pa}"
        );
        slot
    }

    /// Narrow every mapping of `pa` to at most `prot`.
    ///
    /// Without [`VmProt::READ`] every mapping is removed. Mappings in the
    /// kernel map are removed rather than narrowed. A `prot` that allows
    /// everything changes nothing.
    pub fn page_protect(&self, pa: PhysicalAddress, prot: VmProt) {
        let pa = pa.trunc_page();
        let Some(index) = self.managed.index(pa) else {
            debug!("pmap: page_protect on unmanaged {pa}");
            return;
        };
        if prot.contains(VmProt::ALL) {
            return;
        }
        let remove = !prot.contains(VmProt::READ);

        let locked = self.write_lock();
        let mut pv = self.managed.lock(index);
        trace!("pmap: page_protect {pa} to {prot:?} ({} mapping(s))", pv.len());
        pv.retain(|entry| {
            let pmap = &entry.pmap;
            let _map = MapGuard::lock(pmap);
            let slot = self.pv_slot(entry, pa);
            let (start, end) = (entry.va, entry.va + PAGE_SIZE);

            if remove || pmap.is_kernel() {
                let old = slot.clear();
                if old.wired() {
                    warn!("pmap: removing wired mapping {entry:?} of {pa}");
                }
                self.managed.merge_attributes(index, PageAttributes::of(old));
                pmap.mapping_removed(old.wired());
                self.shootdown(locked.cs(), pmap, start, end);
                false
            } else {
                let old = slot.update(|e| e.restricted(prot));
                if old.restricted(prot) != old {
                    self.shootdown(locked.cs(), pmap, start, end);
                }
                true
            }
        });
    }

    /// Whether `pa` has been written through any mapping since its modified
    /// state was last cleared.
    #[must_use]
    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.test_attribute(pa, PageAttributes::MODIFIED)
    }

    /// Whether `pa` has been accessed through any mapping since its
    /// referenced state was last cleared.
    #[must_use]
    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.test_attribute(pa, PageAttributes::REFERENCED)
    }

    pub fn clear_modified(&self, pa: PhysicalAddress) {
        self.clear_attribute(pa, PageAttributes::MODIFIED);
    }

    pub fn clear_referenced(&self, pa: PhysicalAddress) {
        self.clear_attribute(pa, PageAttributes::REFERENCED);
    }

    fn test_attribute(&self, pa: PhysicalAddress, attr: PageAttributes) -> bool {
        let Some(index) = self.managed.index(pa.trunc_page()) else {
            return false;
        };
        if self.managed.attributes(index).contains(attr) {
            return true;
        }

        let _locked = self.write_lock();
        let pv = self.managed.lock(index);
        pv.iter().any(|entry| {
            let _map = MapGuard::lock(&entry.pmap);
            PageAttributes::of(self.pv_slot(entry, pa.trunc_page()).load()).contains(attr)
        })
    }

    fn clear_attribute(&self, pa: PhysicalAddress, attr: PageAttributes) {
        let pa = pa.trunc_page();
        let Some(index) = self.managed.index(pa) else {
            return;
        };
        let clear = |e: PageTableEntry| {
            if attr == PageAttributes::MODIFIED {
                e.with_dirty(false)
            } else {
                e.with_accessed(false)
            }
        };

        let locked = self.write_lock();
        let pv = self.managed.lock(index);
        for entry in pv.iter() {
            let _map = MapGuard::lock(&entry.pmap);
            let old = self.pv_slot(entry, pa).update(clear);
            if PageAttributes::of(old).contains(attr) {
                self.shootdown(locked.cs(), &entry.pmap, entry.va, entry.va + PAGE_SIZE);
            }
        }
        self.managed.clear_attributes(index, attr);
    }

    /// Every `(map, va)` mapping `pa`.
    #[cfg(test)]
    pub(crate) fn mappings_of(
        &self,
        pa: PhysicalAddress,
    ) -> alloc::vec::Vec<(crate::PmapId, crate::VirtualAddress)> {
        let Some(index) = self.managed.index(pa) else {
            return alloc::vec::Vec::new();
        };
        let _locked = self.write_lock();
        let pv = self.managed.lock(index);
        pv.iter().map(|e| (e.pmap.id(), e.va)).collect()
    }
}
