//! # Interrupt priority levels
//!
//! Software interrupt priority ("SPL") for code that must not be preempted
//! by a given class of interrupts while it holds a spin lock.
//!
//! The level itself is owned by the platform: [`InterruptPriority`] reads and
//! writes the calling CPU's current level. [`SplGuard`] raises the level for
//! a scope and restores the previous one on drop, the same way an IRQ guard
//! saves and restores the interrupt flag.
//!
//! ```
//! use core::cell::Cell;
//! use kernel_sync::{InterruptPriority, Spl, SplGuard};
//!
//! struct OneCpu(Cell<Spl>);
//! impl InterruptPriority for OneCpu {
//!     fn spl(&self) -> Spl { self.0.get() }
//!     fn set_spl(&self, level: Spl) -> Spl { self.0.replace(level) }
//! }
//!
//! let cpu = OneCpu(Cell::new(Spl::Zero));
//! {
//!     let _g = SplGuard::raise(&cpu, Spl::Vm);
//!     assert_eq!(cpu.spl(), Spl::Vm);
//! }
//! assert_eq!(cpu.spl(), Spl::Zero);
//! ```

use core::fmt;

/// Interrupt priority levels, lowest first.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Spl {
    /// Everything is deliverable.
    #[default]
    Zero = 0,
    /// Soft interrupts blocked.
    Soft = 1,
    /// Blocks interrupts that may touch the VM system, including TLB update
    /// requests from other CPUs.
    Vm = 2,
    /// Everything blocked.
    High = 3,
}

impl fmt::Display for Spl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zero => "spl0",
            Self::Soft => "splsoft",
            Self::Vm => "splvm",
            Self::High => "splhigh",
        })
    }
}

/// Access to the calling CPU's interrupt priority level.
pub trait InterruptPriority {
    /// Current level of the calling CPU.
    fn spl(&self) -> Spl;

    /// Sets the calling CPU's level and returns the previous one.
    fn set_spl(&self, level: Spl) -> Spl;
}

/// RAII guard that raises the interrupt priority and restores it on drop.
///
/// Raising never lowers: if the CPU already runs at or above the requested
/// level, the guard leaves it unchanged.
#[must_use = "dropping the guard restores the previous priority immediately"]
pub struct SplGuard<'a, P: InterruptPriority + ?Sized> {
    prio: &'a P,
    previous: Spl,
}

impl<'a, P: InterruptPriority + ?Sized> SplGuard<'a, P> {
    #[inline]
    pub fn raise(prio: &'a P, level: Spl) -> Self {
        let current = prio.spl();
        let previous = if level > current {
            prio.set_spl(level)
        } else {
            current
        };
        Self { prio, previous }
    }

    /// The level that will be restored on drop.
    #[inline]
    #[must_use]
    pub const fn previous(&self) -> Spl {
        self.previous
    }
}

impl<P: InterruptPriority + ?Sized> Drop for SplGuard<'_, P> {
    fn drop(&mut self) {
        self.prio.set_spl(self.previous);
    }
}

impl<P: InterruptPriority + ?Sized> fmt::Debug for SplGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplGuard")
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}
