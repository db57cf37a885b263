//! # Page-table pages
//!
//! Every PDPT, PD and PT page (and every map root) is allocated here and
//! recorded in a small arena so it can be found again by physical address
//! when it is freed. Slots carry a generation so a stale handle, or a second
//! free of the same frame, is caught instead of corrupting the allocator.

use crate::addresses::PhysicalAddress;
use crate::error::{PmapError, Shortage};
use crate::machine::Machine;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Generation-checked reference to an arena slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PtPageHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    page: Option<PhysicalAddress>,
}

/// The pseudo-object owning all page-table pages.
#[derive(Debug, Default)]
pub struct PageTablePages {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    by_address: BTreeMap<PhysicalAddress, PtPageHandle>,
}

impl PageTablePages {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_address: BTreeMap::new(),
        }
    }

    /// Pages currently allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.by_address.contains_key(&pa)
    }

    /// Frame recorded in `handle`'s slot, if the handle is still current.
    #[must_use]
    pub fn get(&self, handle: PtPageHandle) -> Option<PhysicalAddress> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation)
            .then_some(slot.page)
            .flatten()
    }

    /// Allocate a zero-filled page-table page.
    ///
    /// # Errors
    /// [`Shortage::PageTablePage`] if the frame allocator or the arena's
    /// bookkeeping ran out of memory. Nothing is leaked in that case.
    pub fn alloc<M: Machine>(&mut self, machine: &M) -> Result<PhysicalAddress, PmapError> {
        let pa = Self::frame(machine)?;
        self.adopt(machine, pa)
    }

    /// One raw frame for a page-table page, taken without touching the
    /// arena.
    ///
    /// # Errors
    /// [`Shortage::PageTablePage`] if the frame allocator is empty.
    pub fn frame<M: Machine>(machine: &M) -> Result<PhysicalAddress, PmapError> {
        machine.alloc_frame().ok_or_else(|| {
            log::warn!("pmap: out of frames for page-table pages");
            PmapError::ResourceShortage(Shortage::PageTablePage)
        })
    }

    /// Zero `pa`, a frame from [`frame`](Self::frame), and record it as a
    /// page-table page.
    ///
    /// # Errors
    /// [`Shortage::PageTablePage`] if the arena's bookkeeping ran out of
    /// memory. The frame is returned to `machine` in that case.
    pub fn adopt<M: Machine>(
        &mut self,
        machine: &M,
        pa: PhysicalAddress,
    ) -> Result<PhysicalAddress, PmapError> {
        let shortage = PmapError::ResourceShortage(Shortage::PageTablePage);
        if self.free_slots.is_empty() && self.slots.try_reserve(1).is_err() {
            machine.free_frame(pa);
            return Err(shortage);
        }

        // Safety: freshly allocated frame, owned by us from here on.
        unsafe { machine.table(pa) }.zero();

        let handle = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.page = Some(pa);
                PtPageHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    machine.free_frame(pa);
                    return Err(shortage);
                };
                self.slots.push(Slot {
                    generation: 0,
                    page: Some(pa),
                });
                PtPageHandle {
                    index,
                    generation: 0,
                }
            }
        };

        if let Some(previous) = self.by_address.insert(pa, handle) {
            panic!("pmap: frame {pa} handed out twice as a page-table page ({previous:?})");
        }
        Ok(pa)
    }

    /// Free a page-table page by physical address.
    ///
    /// The caller has already removed every mapping through it and cleared
    /// its parent entry.
    ///
    /// # Panics
    /// If `pa` is not a live page-table page (double free).
    pub fn free<M: Machine>(&mut self, machine: &M, pa: PhysicalAddress) {
        let Some(handle) = self.by_address.remove(&pa) else {
            panic!("pmap: page-table page {pa} freed twice or never allocated");
        };
        assert!(
            self.get(handle) == Some(pa),
            "pmap: page-table page arena out of sync for {pa}"
        );
        let slot = &mut self.slots[handle.index as usize];
        slot.page = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(handle.index);
        machine.free_frame(pa);
    }

    /// Free every recorded page. Used to unwind a failed bootstrap.
    pub fn release_all<M: Machine>(&mut self, machine: &M) {
        while let Some((pa, _)) = self.by_address.pop_first() {
            machine.free_frame(pa);
        }
        self.slots.clear();
        self.free_slots.clear();
    }

    /// Handle for a live page, used by tests to check generations.
    #[cfg(test)]
    pub(crate) fn handle_of(&self, pa: PhysicalAddress) -> Option<PtPageHandle> {
        self.by_address.get(&pa).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::PhysMapper;
    use crate::testing::SimMachine;

    #[test]
    fn alloc_zero_fills_and_records() {
        let m = SimMachine::new(1);
        let mut pages = PageTablePages::new();
        let pa = pages.alloc(&m).unwrap();
        assert!(pages.contains(pa));
        assert!(unsafe { m.table(pa) }.is_empty());
        pages.free(&m, pa);
        assert!(pages.is_empty());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let m = SimMachine::new(1);
        let mut pages = PageTablePages::new();
        let pa = pages.alloc(&m).unwrap();
        let h = pages.handle_of(pa).unwrap();
        assert_eq!(pages.get(h), Some(pa));
        pages.free(&m, pa);
        assert_eq!(pages.get(h), None);

        // The slot is reused with a new generation.
        let pb = pages.alloc(&m).unwrap();
        let h2 = pages.handle_of(pb).unwrap();
        assert_ne!(h, h2);
        assert_eq!(pages.get(h2), Some(pb));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let m = SimMachine::new(1);
        let mut pages = PageTablePages::new();
        let pa = pages.alloc(&m).unwrap();
        pages.free(&m, pa);
        pages.free(&m, pa);
    }

    #[test]
    fn shortage_is_reported() {
        let m = SimMachine::new(1);
        m.set_frame_budget(Some(0));
        let mut pages = PageTablePages::new();
        assert_eq!(
            pages.alloc(&m),
            Err(PmapError::ResourceShortage(Shortage::PageTablePage))
        );
        assert!(pages.is_empty());
    }
}
