//! # Layout constants and bootstrap configuration

use crate::addresses::PhysicalAddress;
use crate::error::ConfigError;

/// Size of a base page (and of every page-table page).
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page-table page at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Upper bound on CPUs; one bit each in a [`CpuSet`](crate::CpuSet).
pub const MAX_CPUS: usize = 64;

/// Pending TLB update requests a CPU can queue before the queue degrades to
/// a full flush.
pub const UPDATE_LIST_SIZE: usize = 4;

/// Ranges spanning more pages than this flush the whole TLB.
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 16;

/// End (exclusive) of the user half.
pub const USER_VA_END: u64 = 0x0000_8000_0000_0000;

/// Start of the kernel half.
pub const KERNEL_VA_START: u64 = 0xffff_8000_0000_0000;

/// End (exclusive) of the kernel half. The topmost page is never mapped so
/// that range ends stay representable.
pub const KERNEL_VA_END: u64 = 0xffff_ffff_ffff_f000;

/// First PML4 slot owned by the kernel; slots from here on are shared by
/// every map.
pub const KERNEL_PML4_START: usize = 256;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(MAX_CPUS <= u64::BITS as usize);
    assert!(UPDATE_LIST_SIZE > 0);
    assert!(USER_VA_END == (KERNEL_PML4_START as u64) << 39);
    assert!(KERNEL_VA_START > USER_VA_END);
    assert!(KERNEL_VA_END.is_multiple_of(PAGE_SIZE));
};

/// Bootstrap parameters of the physical-map system.
///
/// ```rust
/// # use kernel_pmap::{PhysicalAddress, PmapConfig};
/// let cfg = PmapConfig::new(PhysicalAddress::new(0), PhysicalAddress::new(0x40_0000))
///     .with_cpu_count(4)
///     .with_flush_threshold(32);
/// assert!(cfg.validate().is_ok());
/// assert_eq!(cfg.managed_pages(), 1024);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PmapConfig {
    /// Lowest managed physical address (inclusive).
    pub first_managed: PhysicalAddress,
    /// Highest managed physical address (exclusive).
    pub last_managed: PhysicalAddress,
    pub cpu_count: usize,
    /// See [`DEFAULT_FLUSH_THRESHOLD`].
    pub flush_threshold_pages: u64,
}

impl PmapConfig {
    #[must_use]
    pub const fn new(first_managed: PhysicalAddress, last_managed: PhysicalAddress) -> Self {
        Self {
            first_managed,
            last_managed,
            cpu_count: 1,
            flush_threshold_pages: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    #[must_use]
    pub const fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    #[must_use]
    pub const fn with_flush_threshold(mut self, pages: u64) -> Self {
        self.flush_threshold_pages = pages;
        self
    }

    /// Number of managed physical pages.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn managed_pages(&self) -> usize {
        (self.last_managed.as_u64().saturating_sub(self.first_managed.as_u64()) / PAGE_SIZE)
            as usize
    }

    /// # Errors
    /// Returns the first violated constraint.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if !self.first_managed.is_page_aligned() {
            return Err(ConfigError::MisalignedManagedRange(self.first_managed));
        }
        if !self.last_managed.is_page_aligned() {
            return Err(ConfigError::MisalignedManagedRange(self.last_managed));
        }
        if self.last_managed.as_u64() <= self.first_managed.as_u64() {
            return Err(ConfigError::EmptyManagedRange);
        }
        if self.cpu_count == 0 || self.cpu_count > MAX_CPUS {
            return Err(ConfigError::CpuCount(self.cpu_count));
        }
        if self.flush_threshold_pages == 0 {
            return Err(ConfigError::ZeroFlushThreshold);
        }
        Ok(())
    }
}
