use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// Top bit of `state`: a writer holds the lock.
const WRITER: usize = 1 << (usize::BITS - 1);

/// Writer-preferring reader/writer spin lock.
///
/// Any number of readers may hold the lock at once; a writer is exclusive.
/// Once a writer starts waiting, new readers back off until it has been
/// served, so a steady stream of readers cannot starve a writer.
///
/// ### Notes
/// - The lock is not re-entrant. A reader that tries to take the write side
///   deadlocks.
/// - Holders must never sleep.
pub struct RwSpinLock<T> {
    /// * `WRITER` bit: write-held
    /// * remaining bits: reader count
    state: AtomicUsize,
    /// Writers currently spinning in [`write`](Self::write).
    writers_waiting: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: readers share &T across threads, writers get &mut T.
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> RwSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            writers_waiting: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try to take a shared hold once.
    ///
    /// Fails if a writer holds the lock or is waiting for it.
    #[inline]
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        if self.writers_waiting.load(Ordering::Relaxed) != 0 {
            return None;
        }
        let s = self.state.load(Ordering::Relaxed);
        if s & WRITER != 0 {
            return None;
        }
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    /// Spin until a shared hold is acquired.
    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            spin_loop();
        }
    }

    /// Try to take the exclusive hold once.
    #[inline]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    /// Spin until the exclusive hold is acquired.
    ///
    /// Announces the writer first, which blocks new readers.
    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        self.writers_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }
        self.writers_waiting.fetch_sub(1, Ordering::Relaxed);
        RwSpinWriteGuard { lock: self }
    }

    /// Whether a writer currently holds the lock.
    #[inline]
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Number of readers currently holding the lock.
    #[inline]
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) & !WRITER
    }
}

impl<T> fmt::Debug for RwSpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("write_locked", &self.is_write_locked())
            .field("readers", &self.reader_count())
            .finish_non_exhaustive()
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}
