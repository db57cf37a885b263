//! # Lock acquisition helpers
//!
//! Three lock granularities, always taken in this order:
//!
//! 1. the map-system lock ([`RwSpinLock`](kernel_sync::RwSpinLock)): **read**
//!    for per-mapping operations, **write** for whole-page operations;
//! 2. one map's lock;
//! 3. one physical page's PV lock bit.
//!
//! Whole-page operations hold the system write lock, which excludes every
//! per-mapping operation, and then take the PV bit of their page followed by
//! each visited map's lock in turn.
//!
//! No path holds two map locks or two PV bits at once. Every acquisition
//! happens inside a [`CriticalSection`]: interrupt priority raised to
//! [`Spl::Vm`] and the CPU out of the active set, so a shootdown initiated
//! elsewhere never waits on a CPU that is itself spinning here.

use crate::machine::{CpuId, Machine};
use crate::pmap::Pmap;
use crate::system::PhysicalMapSystem;
use kernel_sync::{RwSpinReadGuard, RwSpinWriteGuard, Spl, SplGuard, SpinLockGuard};

/// Non-blocking region at [`Spl::Vm`] with the CPU marked inactive.
///
/// On exit the CPU rejoins the active set and drains any TLB updates posted
/// while it was away, before the interrupt priority drops again.
#[must_use]
pub(crate) struct CriticalSection<'s, M: Machine> {
    system: &'s PhysicalMapSystem<M>,
    cpu: CpuId,
    was_active: bool,
    _spl: SplGuard<'s, M>,
}

impl<'s, M: Machine> CriticalSection<'s, M> {
    pub(crate) fn enter(system: &'s PhysicalMapSystem<M>) -> Self {
        let spl = SplGuard::raise(&system.machine, Spl::Vm);
        let cpu = system.machine.current_cpu();
        let was_active = system.cpus_active.remove(cpu);
        Self {
            system,
            cpu,
            was_active,
            _spl: spl,
        }
    }

    #[inline]
    pub(crate) const fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<M: Machine> Drop for CriticalSection<'_, M> {
    fn drop(&mut self) {
        if self.was_active {
            self.system.cpus_active.insert(self.cpu);
            self.system.process_updates(self.cpu);
        }
    }
}

/// Map-system lock held for reading.
pub(crate) struct ReadLocked<'s, M: Machine> {
    // Released before the critical section ends.
    _system: RwSpinReadGuard<'s, ()>,
    cs: CriticalSection<'s, M>,
}

impl<M: Machine> ReadLocked<'_, M> {
    pub(crate) const fn cs(&self) -> &CriticalSection<'_, M> {
        &self.cs
    }
}

/// Map-system lock held for writing.
pub(crate) struct WriteLocked<'s, M: Machine> {
    _system: RwSpinWriteGuard<'s, ()>,
    cs: CriticalSection<'s, M>,
}

impl<M: Machine> WriteLocked<'_, M> {
    pub(crate) const fn cs(&self) -> &CriticalSection<'_, M> {
        &self.cs
    }
}

impl<M: Machine> PhysicalMapSystem<M> {
    pub(crate) fn read_lock(&self) -> ReadLocked<'_, M> {
        let cs = CriticalSection::enter(self);
        ReadLocked {
            _system: self.system_lock.read(),
            cs,
        }
    }

    pub(crate) fn write_lock(&self) -> WriteLocked<'_, M> {
        let cs = CriticalSection::enter(self);
        WriteLocked {
            _system: self.system_lock.write(),
            cs,
        }
    }
}

/// A map's lock, which can be let go around an allocation.
pub(crate) struct MapGuard<'a> {
    pmap: &'a Pmap,
    guard: Option<SpinLockGuard<'a, ()>>,
}

impl<'a> MapGuard<'a> {
    /// # Panics
    /// If `pmap` has been destroyed.
    pub(crate) fn lock(pmap: &'a Pmap) -> Self {
        Self {
            pmap,
            guard: Some(Self::acquire(pmap)),
        }
    }

    fn acquire(pmap: &'a Pmap) -> SpinLockGuard<'a, ()> {
        let guard = pmap.lock.lock();
        pmap.assert_live();
        guard
    }

    /// Run `f` with the map unlocked, then take the lock again. Anything
    /// read from the map before the call must be re-checked after it.
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.guard = None;
        let r = f();
        self.guard = Some(Self::acquire(self.pmap));
        r
    }
}
