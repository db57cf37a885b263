//! # TLB shootdown
//!
//! After a valid PTE is changed, every CPU that may cache the old
//! translation must drop it before the changing call returns.
//!
//! ## Protocol
//!
//! 1. The initiator (inside a [`CriticalSection`]) posts an
//!    [`UpdateRequest`] to the mailbox of every *other* CPU in the map's
//!    `cpus_using` set. Each post bumps that mailbox's request generation.
//! 2. Targets that are active get an update interrupt. Inactive targets (idle,
//!    or inside their own critical section) drain their mailbox before they
//!    become active again, so they are not interrupted.
//! 3. A [`ShootdownBarrier`] spins until every target has acknowledged the
//!    generation it was given, or is no longer active.
//! 4. The initiator flushes its own TLB if it runs the map.
//!
//! With a single CPU the target set is empty and only step 4 runs.
//!
//! Mailboxes hold [`UPDATE_LIST_SIZE`] requests. When full, the last slot is
//! replaced by [`UpdateRequest::Everything`]: the queue never grows and no
//! request is lost, at the price of a full flush on the target.

use crate::addresses::VirtualAddress;
use crate::config::{MAX_CPUS, PAGE_SIZE, UPDATE_LIST_SIZE};
use crate::locking::CriticalSection;
use crate::machine::{CpuId, CpuSet, Machine};
use crate::pmap::{Pmap, PmapId};
use crate::system::PhysicalMapSystem;
use alloc::sync::Arc;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{Spl, SplGuard, SpinLock};
use log::{trace, warn};

/// A pending invalidation for one CPU.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpdateRequest {
    /// Drop translations of `pmap` for `[start, end)`.
    Range {
        pmap: PmapId,
        start: VirtualAddress,
        end: VirtualAddress,
    },
    /// Drop all translations.
    Everything,
}

/// Bounded per-CPU queue of [`UpdateRequest`]s.
#[derive(Debug)]
pub(crate) struct UpdateQueue {
    items: [UpdateRequest; UPDATE_LIST_SIZE],
    len: usize,
    /// Bumped on every post; the value a drain acknowledges.
    generation: u64,
}

impl UpdateQueue {
    pub(crate) const fn new() -> Self {
        Self {
            items: [UpdateRequest::Everything; UPDATE_LIST_SIZE],
            len: 0,
            generation: 0,
        }
    }

    /// Queue `request` and return the generation that covers it.
    pub(crate) fn post(&mut self, request: UpdateRequest) -> u64 {
        if self.len < UPDATE_LIST_SIZE {
            self.items[self.len] = request;
            self.len += 1;
        } else if self.items[UPDATE_LIST_SIZE - 1] != UpdateRequest::Everything {
            warn!("pmap: TLB update queue full, degrading to a full flush");
            self.items[UPDATE_LIST_SIZE - 1] = UpdateRequest::Everything;
        }
        self.generation += 1;
        self.generation
    }

    /// Empty the queue, returning its requests and current generation.
    pub(crate) fn take(&mut self) -> (Drained, u64) {
        let drained = Drained {
            items: self.items,
            len: self.len,
        };
        self.len = 0;
        (drained, self.generation)
    }

    #[cfg(test)]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }
}

/// Requests taken out of an [`UpdateQueue`].
pub(crate) struct Drained {
    items: [UpdateRequest; UPDATE_LIST_SIZE],
    len: usize,
}

impl Drained {
    pub(crate) fn iter(&self) -> impl Iterator<Item = &UpdateRequest> {
        self.items[..self.len].iter()
    }
}

/// Per-CPU shootdown state.
#[derive(Debug)]
pub(crate) struct CpuState {
    pub(crate) queue: SpinLock<UpdateQueue>,
    /// Highest generation this CPU has drained.
    pub(crate) acknowledged: AtomicU64,
    /// Map whose root is loaded, if a user map.
    pub(crate) current: SpinLock<Option<Arc<Pmap>>>,
    /// Id of the loaded map, readable from the interrupt handler.
    pub(crate) current_id: AtomicU64,
}

impl CpuState {
    pub(crate) const fn new() -> Self {
        Self {
            queue: SpinLock::new(UpdateQueue::new()),
            acknowledged: AtomicU64::new(0),
            current: SpinLock::new(None),
            current_id: AtomicU64::new(PmapId::KERNEL.as_u64()),
        }
    }
}

/// Waits for every armed CPU to acknowledge its update.
pub(crate) struct ShootdownBarrier {
    waiting: CpuSet,
    generations: [u64; MAX_CPUS],
}

impl ShootdownBarrier {
    pub(crate) const fn new() -> Self {
        Self {
            waiting: CpuSet::EMPTY,
            generations: [0; MAX_CPUS],
        }
    }

    pub(crate) const fn arm(&mut self, cpu: CpuId, generation: u64) {
        self.waiting = self.waiting.with(cpu);
        self.generations[cpu.index()] = generation;
    }

    /// Spin until every armed CPU has acknowledged or left the active set.
    ///
    /// Never sleeps; the caller holds only spin locks.
    pub(crate) fn wait<M: Machine>(mut self, system: &PhysicalMapSystem<M>) {
        while !self.waiting.is_empty() {
            let active = system.cpus_active.load();
            for cpu in self.waiting.iter() {
                let acked = system.cpu_state(cpu).acknowledged.load(Ordering::Acquire);
                if acked >= self.generations[cpu.index()] || !active.contains(cpu) {
                    self.waiting = self.waiting.without(cpu);
                }
            }
            spin_loop();
        }
    }
}

impl<M: Machine> PhysicalMapSystem<M> {
    /// Make the change to `[start, end)` of `pmap` visible on every CPU.
    pub(crate) fn shootdown(
        &self,
        cs: &CriticalSection<'_, M>,
        pmap: &Pmap,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        let me = cs.cpu();
        let using = pmap.cpus_using();
        let targets = using.without(me);

        let mut barrier = ShootdownBarrier::new();
        for cpu in targets.iter() {
            let generation = self.cpu_state(cpu).queue.with_lock(|q| {
                q.post(UpdateRequest::Range {
                    pmap: pmap.id(),
                    start,
                    end,
                })
            });
            barrier.arm(cpu, generation);
            if self.cpus_active.contains(cpu) {
                trace!("pmap: {} shootdown {start:?}..{end:?} -> {cpu}", pmap.id());
                self.machine.send_update_interrupt(cpu);
            }
        }
        barrier.wait(self);

        if using.contains(me) {
            self.flush_local(start, end);
        }
    }

    fn flush_local(&self, start: VirtualAddress, end: VirtualAddress) {
        let pages = (end - start).div_ceil(PAGE_SIZE);
        if pages > self.config.flush_threshold_pages {
            self.machine.flush_tlb_all();
        } else {
            self.machine.flush_tlb_range(start, end);
        }
    }

    /// Drain `cpu`'s mailbox on that CPU and acknowledge it.
    pub(crate) fn process_updates(&self, cpu: CpuId) {
        let state = self.cpu_state(cpu);
        let (requests, generation) = state.queue.with_lock(UpdateQueue::take);
        let current = state.current_id.load(Ordering::Acquire);
        for request in requests.iter() {
            match *request {
                UpdateRequest::Everything => {
                    self.machine.flush_tlb_all();
                    break;
                }
                UpdateRequest::Range { pmap, start, end } => {
                    // Another root has been loaded since; that load flushed.
                    if pmap == PmapId::KERNEL || pmap.as_u64() == current {
                        self.flush_local(start, end);
                    }
                }
            }
        }
        state.acknowledged.store(generation, Ordering::Release);
    }

    /// Entry point for the TLB update interrupt. Drains the calling CPU's
    /// pending requests.
    pub fn update_interrupt(&self) {
        let _spl = SplGuard::raise(&self.machine, Spl::Vm);
        self.process_updates(self.machine.current_cpu());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(n: u64) -> UpdateRequest {
        UpdateRequest::Range {
            pmap: PmapId::KERNEL,
            start: VirtualAddress::new(n * PAGE_SIZE),
            end: VirtualAddress::new((n + 1) * PAGE_SIZE),
        }
    }

    #[test]
    fn generations_count_posts() {
        let mut q = UpdateQueue::new();
        assert_eq!(q.post(range(0)), 1);
        assert_eq!(q.post(range(1)), 2);
        let (drained, generation) = q.take();
        assert_eq!(generation, 2);
        assert_eq!(drained.iter().count(), 2);
        assert_eq!(q.len(), 0);
        assert_eq!(q.post(range(2)), 3);
    }

    #[test]
    fn overflow_degrades_last_slot() {
        let mut q = UpdateQueue::new();
        for n in 0..UPDATE_LIST_SIZE as u64 + 3 {
            q.post(range(n));
        }
        assert_eq!(q.len(), UPDATE_LIST_SIZE);
        let (drained, generation) = q.take();
        assert_eq!(generation, UPDATE_LIST_SIZE as u64 + 3);
        let items: Vec<_> = drained.iter().copied().collect();
        assert_eq!(items[0], range(0));
        assert_eq!(items[UPDATE_LIST_SIZE - 1], UpdateRequest::Everything);
    }
}
