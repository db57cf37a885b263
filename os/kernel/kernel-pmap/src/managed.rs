//! # Managed physical pages
//!
//! The per-page state of every physical page the VM system manages: its PV
//! list, its PV lock bit and its attribute byte. All three are indexed by
//! the same page index, `(pa - first) / PAGE_SIZE`, and are sized together
//! at bootstrap.

use crate::addresses::PhysicalAddress;
use crate::attributes::{AttributeTable, PageAttributes};
use crate::config::{PAGE_SHIFT, PmapConfig};
use crate::pv::PvList;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use kernel_sync::{LockBitGuard, LockBits};

pub(crate) struct ManagedPages {
    first: PhysicalAddress,
    last: PhysicalAddress,
    pv: Box<[UnsafeCell<PvList>]>,
    locks: LockBits,
    attributes: AttributeTable,
}

// Safety: a PV list is only reached through `lock`, which holds its bit.
unsafe impl Sync for ManagedPages {}

impl ManagedPages {
    pub(crate) fn new(config: &PmapConfig) -> Self {
        let pages = config.managed_pages();
        let this = Self {
            first: config.first_managed,
            last: config.last_managed,
            pv: (0..pages).map(|_| UnsafeCell::new(PvList::default())).collect(),
            locks: LockBits::new(pages),
            attributes: AttributeTable::new(pages),
        };
        debug_assert!(this.pv.len() == this.locks.len() && this.pv.len() == this.attributes.len());
        this
    }

    pub(crate) const fn first(&self) -> PhysicalAddress {
        self.first
    }

    pub(crate) const fn last(&self) -> PhysicalAddress {
        self.last
    }

    pub(crate) fn len(&self) -> usize {
        self.pv.len()
    }

    /// Page index of `pa`, or `None` for unmanaged memory (MMIO, firmware).
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn index(&self, pa: PhysicalAddress) -> Option<usize> {
        (pa >= self.first && pa < self.last)
            .then(|| ((pa - self.first) >> PAGE_SHIFT) as usize)
    }

    /// Take page `index`'s PV lock. Never blocks on anything but the bit.
    pub(crate) fn lock(&self, index: usize) -> PvGuard<'_> {
        let bit = self.locks.lock(index);
        PvGuard {
            list: &self.pv[index],
            _bit: bit,
        }
    }

    pub(crate) fn attributes(&self, index: usize) -> PageAttributes {
        self.attributes.get(index)
    }

    pub(crate) fn merge_attributes(&self, index: usize, attrs: PageAttributes) {
        self.attributes.merge(index, attrs);
    }

    pub(crate) fn clear_attributes(&self, index: usize, attrs: PageAttributes) {
        self.attributes.clear(index, attrs);
    }
}

impl fmt::Debug for ManagedPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedPages")
            .field("first", &self.first)
            .field("last", &self.last)
            .field("pages", &self.len())
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

/// A locked PV list.
pub(crate) struct PvGuard<'a> {
    list: &'a UnsafeCell<PvList>,
    _bit: LockBitGuard<'a>,
}

impl Deref for PvGuard<'_> {
    type Target = PvList;
    fn deref(&self) -> &PvList {
        unsafe { &*self.list.get() }
    }
}

impl DerefMut for PvGuard<'_> {
    fn deref_mut(&mut self) -> &mut PvList {
        unsafe { &mut *self.list.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages() -> ManagedPages {
        ManagedPages::new(&PmapConfig::new(
            PhysicalAddress::new(0x10_0000),
            PhysicalAddress::new(0x20_0000),
        ))
    }

    #[test]
    fn indices_follow_offset_from_first() {
        let m = pages();
        assert_eq!(m.len(), 256);
        assert_eq!(m.index(PhysicalAddress::new(0x10_0000)), Some(0));
        assert_eq!(m.index(PhysicalAddress::new(0x10_1fff)), Some(1));
        assert_eq!(m.index(PhysicalAddress::new(0x1f_f000)), Some(255));
        assert_eq!(m.index(PhysicalAddress::new(0x20_0000)), None);
        assert_eq!(m.index(PhysicalAddress::new(0x0f_f000)), None);
    }

    #[test]
    fn guard_holds_the_bit() {
        let m = pages();
        {
            let g = m.lock(3);
            assert!(g.is_empty());
            assert!(m.locks.is_locked(3));
            assert!(m.locks.try_lock(3).is_none());
        }
        assert!(!m.locks.is_locked(3));
    }
}
