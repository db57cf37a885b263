use alloc::boxed::Box;
use core::{
    fmt,
    hint::spin_loop,
    sync::atomic::{AtomicU64, Ordering},
};

/// A packed array of one-bit spin locks.
///
/// Used where one lock per element of a large table would be too costly,
/// e.g. one lock per managed physical page. Bit `i` lives in word `i / 64`.
pub struct LockBits {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl LockBits {
    /// Creates `len` unlocked bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn slot(&self, index: usize) -> (&AtomicU64, u64) {
        assert!(
            index < self.len,
            "lock bit {index} out of range ({})",
            self.len
        );
        (&self.words[index / 64], 1 << (index % 64))
    }

    /// Try to set bit `index` once.
    #[inline]
    pub fn try_lock(&self, index: usize) -> Option<LockBitGuard<'_>> {
        let (word, mask) = self.slot(index);
        if word.fetch_or(mask, Ordering::Acquire) & mask == 0 {
            Some(LockBitGuard { bits: self, index })
        } else {
            None
        }
    }

    /// Spin until bit `index` is acquired.
    #[inline]
    pub fn lock(&self, index: usize) -> LockBitGuard<'_> {
        let (word, mask) = self.slot(index);
        while word.fetch_or(mask, Ordering::Acquire) & mask != 0 {
            while word.load(Ordering::Relaxed) & mask != 0 {
                spin_loop();
            }
        }
        LockBitGuard { bits: self, index }
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self, index: usize) -> bool {
        let (word, mask) = self.slot(index);
        word.load(Ordering::Relaxed) & mask != 0
    }

    #[inline]
    fn unlock(&self, index: usize) {
        let (word, mask) = self.slot(index);
        word.fetch_and(!mask, Ordering::Release);
    }
}

impl fmt::Debug for LockBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held: u32 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum();
        f.debug_struct("LockBits")
            .field("len", &self.len)
            .field("held", &held)
            .finish()
    }
}

/// Holds one bit of a [`LockBits`] array; clears it on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockBitGuard<'a> {
    bits: &'a LockBits,
    index: usize,
}

impl LockBitGuard<'_> {
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for LockBitGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockBitGuard").field(&self.index).finish()
    }
}

impl Drop for LockBitGuard<'_> {
    fn drop(&mut self) {
        self.bits.unlock(self.index);
    }
}
