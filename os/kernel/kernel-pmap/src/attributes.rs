use crate::pte::PageTableEntry;
use alloc::boxed::Box;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    /// Hardware status bits salvaged from PTEs of one physical page.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct PageAttributes: u8 {
        const MODIFIED = 1 << 0;
        const REFERENCED = 1 << 1;
    }
}

impl PageAttributes {
    /// The `D`/`A` bits of `pte` as attributes.
    #[must_use]
    pub fn of(pte: PageTableEntry) -> Self {
        let mut attrs = Self::empty();
        attrs.set(Self::MODIFIED, pte.dirty());
        attrs.set(Self::REFERENCED, pte.accessed());
        attrs
    }
}

/// One attribute byte per managed page.
pub(crate) struct AttributeTable {
    bytes: Box<[AtomicU8]>,
}

impl AttributeTable {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            bytes: (0..pages).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn get(&self, index: usize) -> PageAttributes {
        PageAttributes::from_bits_truncate(self.bytes[index].load(Ordering::Acquire))
    }

    pub(crate) fn merge(&self, index: usize, attrs: PageAttributes) {
        if !attrs.is_empty() {
            self.bytes[index].fetch_or(attrs.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn clear(&self, index: usize, attrs: PageAttributes) {
        self.bytes[index].fetch_and(!attrs.bits(), Ordering::AcqRel);
    }
}
