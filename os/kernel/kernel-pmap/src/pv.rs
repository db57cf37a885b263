//! # Reverse mappings (PV lists)
//!
//! For every managed physical page, the set of `(map, virtual address)`
//! pairs currently mapping it. The first entry lives inline in the per-page
//! slot, so the common single-mapping case never allocates; further entries
//! spill into a vector and are removed with `swap_remove`.
//!
//! ## Invariants
//!
//! - A list holds at most one entry per `(map, va)`.
//! - If the list is non-empty, `head` is occupied.
//! - A valid PTE in map `M` at `va` naming managed page `P` exists exactly
//!   when `(M, va)` is in `P`'s list. Callers keep both in step while holding
//!   the page's lock bit.

use crate::addresses::VirtualAddress;
use crate::error::{PmapError, Shortage};
use crate::pmap::{Pmap, PmapId};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

/// One mapping of a physical page.
#[derive(Clone)]
pub struct PvEntry {
    pub pmap: Arc<Pmap>,
    pub va: VirtualAddress,
}

impl PvEntry {
    #[inline]
    fn is(&self, id: PmapId, va: VirtualAddress) -> bool {
        self.pmap.id() == id && self.va == va
    }
}

impl fmt::Debug for PvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.pmap.id(), self.va)
    }
}

/// All mappings of one physical page.
#[derive(Debug, Default)]
pub struct PvList {
    head: Option<PvEntry>,
    overflow: Vec<PvEntry>,
}

impl PvList {
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.head.is_some()) + self.overflow.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PvEntry> {
        self.head.iter().chain(self.overflow.iter())
    }

    #[must_use]
    pub fn contains(&self, id: PmapId, va: VirtualAddress) -> bool {
        self.iter().any(|e| e.is(id, va))
    }

    /// Overflow capacity needed before one more entry can be recorded
    /// without allocating, or `None` if there is room already.
    #[must_use]
    pub fn needed_capacity(&self) -> Option<usize> {
        (self.head.is_some() && self.overflow.len() == self.overflow.capacity())
            .then(|| self.overflow.len() + 1)
    }

    /// Empty overflow storage with room for at least `capacity` entries.
    /// Allocated with no lock held.
    ///
    /// # Errors
    /// [`Shortage::PvEntry`] if the allocator cannot provide it.
    pub fn storage(capacity: usize) -> Result<Vec<PvEntry>, PmapError> {
        let mut storage = Vec::new();
        storage
            .try_reserve(capacity.next_power_of_two())
            .map_err(|_| PmapError::ResourceShortage(Shortage::PvEntry))?;
        Ok(storage)
    }

    /// Move the overflow entries into `storage` and return the old, now
    /// empty, vector for the caller to free once the page is unlocked.
    pub fn adopt_storage(&mut self, mut storage: Vec<PvEntry>) -> Vec<PvEntry> {
        debug_assert!(storage.is_empty() && storage.capacity() > self.overflow.len());
        storage.append(&mut self.overflow);
        core::mem::replace(&mut self.overflow, storage)
    }

    /// Insert `(pmap, va)`. Allocates only if
    /// [`needed_capacity`](Self::needed_capacity) asked for storage that was
    /// not provided.
    ///
    /// # Panics
    /// If the mapping is already recorded.
    pub fn record(&mut self, pmap: &Arc<Pmap>, va: VirtualAddress) {
        assert!(
            !self.contains(pmap.id(), va),
            "pmap: duplicate reverse mapping ({}, {va:?})",
            pmap.id()
        );
        let entry = PvEntry {
            pmap: Arc::clone(pmap),
            va,
        };
        if self.head.is_none() {
            self.head = Some(entry);
        } else {
            self.overflow.push(entry);
        }
    }

    /// Remove exactly the `(id, va)` entry and return it.
    ///
    /// A removed head is refilled from the overflow, so `head` stays the
    /// occupied slot.
    ///
    /// # Panics
    /// If no such entry exists: the PTE and PV state disagree.
    pub fn forget(&mut self, id: PmapId, va: VirtualAddress) -> PvEntry {
        if let Some(e) = self.head.take_if(|h| h.is(id, va)) {
            self.head = self.overflow.pop();
            return e;
        }
        match self.overflow.iter().position(|e| e.is(id, va)) {
            Some(i) => self.overflow.swap_remove(i),
            None => panic!("pmap: reverse mapping ({id}, {va:?}) not found"),
        }
    }

    /// Remove and return any one entry.
    #[cfg(test)]
    pub fn pop(&mut self) -> Option<PvEntry> {
        match self.overflow.pop() {
            Some(e) => Some(e),
            None => self.head.take(),
        }
    }

    /// Keep only the entries for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&PvEntry) -> bool) {
        self.overflow.retain(&mut keep);
        if let Some(head) = &self.head
            && !keep(head)
        {
            self.head = self.overflow.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PhysicalAddress;
    use crate::pmap::PmapIds;

    fn maps(n: usize) -> Vec<Arc<Pmap>> {
        let ids = PmapIds::new();
        (0..n)
            .map(|_| Arc::new(Pmap::new(ids.next(), PhysicalAddress::zero(), false)))
            .collect()
    }

    fn va(n: u64) -> VirtualAddress {
        VirtualAddress::new(n * 0x1000)
    }

    #[test]
    fn first_mapping_lives_inline() {
        let m = maps(1);
        let mut list = PvList::default();
        assert_eq!(list.needed_capacity(), None);
        list.record(&m[0], va(1));
        assert_eq!(list.len(), 1);
        assert!(list.overflow.capacity() == 0, "head must not allocate");
        assert!(list.contains(m[0].id(), va(1)));
    }

    #[test]
    fn forgetting_the_head_promotes_an_overflow_entry() {
        let m = maps(3);
        let mut list = PvList::default();
        for p in &m {
            list.record(p, va(7));
        }
        let gone = list.forget(m[0].id(), va(7));
        assert_eq!(gone.pmap.id(), m[0].id());
        assert_eq!(list.len(), 2);
        assert!(list.head.is_some());
        assert!(!list.contains(m[0].id(), va(7)));

        list.forget(m[2].id(), va(7));
        list.forget(m[1].id(), va(7));
        assert!(list.is_empty());
    }

    #[test]
    fn overflow_storage_is_supplied_from_outside() {
        let m = maps(1);
        let mut list = PvList::default();
        list.record(&m[0], va(0));

        let needed = list.needed_capacity().unwrap();
        assert_eq!(needed, 1);
        let storage = PvList::storage(needed).unwrap();
        let capacity = storage.capacity();
        assert!(list.adopt_storage(storage).is_empty());
        assert_eq!(list.needed_capacity(), None);

        for n in 1..=capacity as u64 {
            list.record(&m[0], va(n));
        }
        assert_eq!(list.overflow.capacity(), capacity, "record must not grow");
        assert_eq!(list.needed_capacity(), Some(capacity + 1));

        // Entries survive a second move.
        let retired = list.adopt_storage(PvList::storage(capacity + 1).unwrap());
        assert_eq!(retired.capacity(), capacity);
        assert_eq!(list.len(), capacity + 1);
        assert!((0..=capacity as u64).all(|n| list.contains(m[0].id(), va(n))));
    }

    #[test]
    fn forgetting_a_middle_entry() {
        let m = maps(1);
        let mut list = PvList::default();
        for n in 0..5 {
            list.record(&m[0], va(n));
        }
        list.forget(m[0].id(), va(2));
        let mut left: Vec<_> = list.iter().map(|e| e.va.as_u64()).collect();
        left.sort_unstable();
        assert_eq!(left, vec![0, 0x1000, 0x3000, 0x4000]);
    }

    #[test]
    #[should_panic(expected = "duplicate reverse mapping")]
    fn duplicate_record_panics() {
        let m = maps(1);
        let mut list = PvList::default();
        list.record(&m[0], va(1));
        list.record(&m[0], va(1));
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn forgetting_a_missing_entry_panics() {
        let m = maps(2);
        let mut list = PvList::default();
        list.record(&m[0], va(1));
        list.forget(m[1].id(), va(1));
    }

    #[test]
    fn retain_keeps_head_occupied() {
        let m = maps(3);
        let mut list = PvList::default();
        for p in &m {
            list.record(p, va(3));
        }
        let drop_id = m[0].id();
        list.retain(|e| e.pmap.id() != drop_id);
        assert_eq!(list.len(), 2);
        assert!(list.head.is_some());

        list.retain(|_| false);
        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }

    #[test]
    fn entries_keep_their_map_alive() {
        let m = maps(1);
        let mut list = PvList::default();
        list.record(&m[0], va(1));
        assert_eq!(Arc::strong_count(&m[0]), 2);
        drop(list.pop());
        assert_eq!(Arc::strong_count(&m[0]), 1);
    }
}
