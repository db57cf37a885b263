//! # Physical and virtual addresses
//!
//! Thin `u64` wrappers that keep the two address spaces apart at the type
//! level. All page arithmetic is in 4 KiB units ([`PAGE_SIZE`]).

use crate::config::{KERNEL_VA_START, PAGE_SIZE, USER_VA_END};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address (host RAM or MMIO).
///
/// ### Examples
/// ```rust
/// # use kernel_pmap::PhysicalAddress;
/// let pa = PhysicalAddress::new(0x2042);
/// assert_eq!(pa.trunc_page().as_u64(), 0x2000);
/// assert_eq!(pa.page_offset(), 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// Virtual memory address.
///
/// No canonicality check is performed on construction; the map operations
/// decide which half an address belongs to (see [`VirtualAddress::is_user`]
/// and [`VirtualAddress::is_kernel`]).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page.
    #[inline]
    #[must_use]
    pub const fn trunc_page(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the containing page.
    #[inline]
    #[must_use]
    pub const fn trunc_page(self) -> Self {
        Self(align_down(self.0, PAGE_SIZE))
    }

    /// Round up to the next page boundary, saturating at the last page.
    #[inline]
    #[must_use]
    pub const fn round_page(self) -> Self {
        match self.0.checked_add(PAGE_SIZE - 1) {
            Some(v) => Self(align_down(v, PAGE_SIZE)),
            None => Self(align_down(u64::MAX, PAGE_SIZE)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Lower (user) canonical half.
    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0 < USER_VA_END
    }

    /// Upper (kernel) canonical half.
    #[inline]
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_VA_START
    }

    /// Adds `bytes`, returning `None` on wrap-around.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

/// Align `x` down to `align` (power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

/// Align `x` up to `align` (power of two). Wraps on overflow.
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}
