//! Simulated multiprocessor for tests.
//!
//! Page-table frames live in a block of RAM above the managed range. Each
//! CPU has a software TLB that caches translations the way the hardware
//! walker does: a cached entry is used until flushed, the walker sets `A`
//! on every fill and `D` on the first write, and a write through a cached
//! writable entry that is already dirty touches no PTE at all. The current
//! CPU is per test thread.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::config::{PAGE_SHIFT, PAGE_SIZE, PmapConfig};
use crate::machine::{CpuId, FrameAlloc, PhysMapper, Processor};
use crate::pte::{Level, PageTable, PageTableEntry};
use crate::system::PhysicalMapSystem;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use kernel_sync::{InterruptPriority, Spl};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// First page-table frame.
pub(crate) const PT_BASE: u64 = 0x1000_0000;
pub(crate) const PT_FRAMES: usize = 1024;
/// End of managed memory; managed pages are `page(0)..page(1024)`.
pub(crate) const MANAGED_END: u64 = 0x40_0000;

thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn set_current_cpu(cpu: usize) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

pub(crate) fn current_cpu() -> usize {
    CURRENT_CPU.with(Cell::get)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct TlbEntry {
    pub pa: PhysicalAddress,
    pub writable: bool,
    pub dirty: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Fault {
    NotPresent,
    Protection,
}

#[derive(Default)]
pub(crate) struct SimCpu {
    tlb: Mutex<HashMap<u64, TlbEntry>>,
    root: AtomicU64,
    spl: AtomicU8,
    ipi_pending: AtomicBool,
    pub(crate) range_flushes: AtomicUsize,
    pub(crate) full_flushes: AtomicUsize,
    pub(crate) ipis: AtomicUsize,
}

pub(crate) struct SimMachine {
    ram: Box<[PageTable]>,
    free: Mutex<Vec<PhysicalAddress>>,
    live: Mutex<HashSet<PhysicalAddress>>,
    budget: Mutex<Option<usize>>,
    alloc_hook: Mutex<Option<AllocHook>>,
    cpus: Box<[SimCpu]>,
}

type AllocHook = Box<dyn FnOnce() + Send>;

impl SimMachine {
    pub(crate) fn new(cpus: usize) -> Self {
        Self {
            ram: (0..PT_FRAMES).map(|_| PageTable::new()).collect(),
            free: Mutex::new(
                (0..PT_FRAMES as u64)
                    .rev()
                    .map(|i| PhysicalAddress::new(PT_BASE + i * PAGE_SIZE))
                    .collect(),
            ),
            live: Mutex::new(HashSet::new()),
            budget: Mutex::new(None),
            alloc_hook: Mutex::new(None),
            cpus: (0..cpus).map(|_| SimCpu::default()).collect(),
        }
    }

    /// Frames still allowed to be handed out; `None` for no limit.
    pub(crate) fn set_frame_budget(&self, budget: Option<usize>) {
        *self.budget.lock().unwrap() = budget;
    }

    /// Run `f` at the start of the next frame allocation, on the allocating
    /// thread.
    pub(crate) fn on_next_alloc(&self, f: impl FnOnce() + Send + 'static) {
        *self.alloc_hook.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn frames_in_use(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub(crate) fn cpu(&self, cpu: usize) -> &SimCpu {
        &self.cpus[cpu]
    }

    fn me(&self) -> &SimCpu {
        &self.cpus[current_cpu()]
    }

    /// Clears and returns `cpu`'s pending update interrupt.
    pub(crate) fn take_ipi(&self, cpu: usize) -> bool {
        self.cpus[cpu].ipi_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn cached(&self, cpu: usize, va: VirtualAddress) -> Option<TlbEntry> {
        let vpn = va.as_u64() >> PAGE_SHIFT;
        self.cpus[cpu].tlb.lock().unwrap().get(&vpn).copied()
    }

    /// Leaf entry for `va` under `root`, read without side effects.
    pub(crate) fn walk(&self, root: PhysicalAddress, va: VirtualAddress) -> Option<PageTableEntry> {
        let mut table = unsafe { self.table(root) };
        for level in Level::DIRECTORIES {
            let e = table.load(level.index(va));
            if !e.is_valid() {
                return None;
            }
            table = unsafe { self.table(e.frame()) };
        }
        Some(table.load(Level::Pt.index(va))).filter(|e| e.is_valid())
    }

    /// A load (`write == false`) or store by the current CPU.
    pub(crate) fn access(&self, va: VirtualAddress, write: bool) -> Result<PhysicalAddress, Fault> {
        let cpu = self.me();
        let vpn = va.as_u64() >> PAGE_SHIFT;
        let mut tlb = cpu.tlb.lock().unwrap();

        if let Some(e) = tlb.get(&vpn).copied() {
            if !write || (e.writable && e.dirty) {
                return Ok(e.pa + va.page_offset());
            }
            if !e.writable {
                tlb.remove(&vpn);
                return Err(Fault::Protection);
            }
        }

        let root = PhysicalAddress::new(cpu.root.load(Ordering::Acquire));
        let mut table = unsafe { self.table(root) };
        for level in Level::DIRECTORIES {
            let e = table.load(level.index(va));
            if !e.is_valid() {
                tlb.remove(&vpn);
                return Err(Fault::NotPresent);
            }
            table = unsafe { self.table(e.frame()) };
        }

        let prev = table.update(Level::Pt.index(va), |e| {
            if !e.is_valid() || (write && !e.writable()) {
                e
            } else {
                e.with_accessed(true).with_dirty(e.dirty() || write)
            }
        });
        if !prev.is_valid() {
            tlb.remove(&vpn);
            return Err(Fault::NotPresent);
        }
        if write && !prev.writable() {
            tlb.remove(&vpn);
            return Err(Fault::Protection);
        }
        tlb.insert(
            vpn,
            TlbEntry {
                pa: prev.frame(),
                writable: prev.writable(),
                dirty: prev.dirty() || write,
            },
        );
        Ok(prev.frame() + va.page_offset())
    }

    /// Cached translations of `cpu` that disagree with its page tables.
    pub(crate) fn stale_entries(&self, cpu: usize) -> Vec<(VirtualAddress, TlbEntry)> {
        let c = &self.cpus[cpu];
        let root = PhysicalAddress::new(c.root.load(Ordering::Acquire));
        let tlb = c.tlb.lock().unwrap();
        tlb.iter()
            .map(|(vpn, e)| (VirtualAddress::new(vpn << PAGE_SHIFT), *e))
            .filter(|(va, e)| match self.walk(root, *va) {
                None => true,
                Some(pte) => {
                    pte.frame() != e.pa
                        || (e.writable && !pte.writable())
                        || (e.dirty && !pte.dirty())
                }
            })
            .collect()
    }
}

impl FrameAlloc for SimMachine {
    fn alloc_frame(&self) -> Option<PhysicalAddress> {
        let hook = self.alloc_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(budget) = self.budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let pa = self.free.lock().unwrap().pop()?;
        assert!(self.live.lock().unwrap().insert(pa));
        Some(pa)
    }

    fn free_frame(&self, pa: PhysicalAddress) {
        assert!(
            self.live.lock().unwrap().remove(&pa),
            "sim: frame {pa} freed but not allocated"
        );
        // Freed frames hold garbage until reallocated.
        let table = unsafe { self.table(pa) };
        for i in 0..crate::config::ENTRIES_PER_TABLE {
            table.store(i, PageTableEntry::from_bits(u64::MAX));
        }
        self.free.lock().unwrap().push(pa);
    }
}

impl PhysMapper for SimMachine {
    unsafe fn table(&self, pa: PhysicalAddress) -> &PageTable {
        let offset = pa.as_u64().checked_sub(PT_BASE).expect("not a page-table frame");
        &self.ram[usize::try_from(offset / PAGE_SIZE).unwrap()]
    }
}

impl InterruptPriority for SimMachine {
    fn spl(&self) -> Spl {
        match self.me().spl.load(Ordering::Relaxed) {
            0 => Spl::Zero,
            1 => Spl::Soft,
            2 => Spl::Vm,
            _ => Spl::High,
        }
    }

    fn set_spl(&self, level: Spl) -> Spl {
        let previous = self.spl();
        self.me().spl.store(level as u8, Ordering::Relaxed);
        previous
    }
}

impl Processor for SimMachine {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(current_cpu()).unwrap()
    }

    fn flush_tlb_range(&self, start: VirtualAddress, end: VirtualAddress) {
        let cpu = self.me();
        cpu.range_flushes.fetch_add(1, Ordering::Relaxed);
        let (first, last) = (start.as_u64() >> PAGE_SHIFT, end.as_u64() >> PAGE_SHIFT);
        cpu.tlb
            .lock()
            .unwrap()
            .retain(|vpn, _| *vpn < first || *vpn >= last);
    }

    fn flush_tlb_all(&self) {
        let cpu = self.me();
        cpu.full_flushes.fetch_add(1, Ordering::Relaxed);
        cpu.tlb.lock().unwrap().clear();
    }

    fn load_root(&self, root: PhysicalAddress) {
        let cpu = self.me();
        cpu.root.store(root.as_u64(), Ordering::Release);
        cpu.tlb.lock().unwrap().clear();
    }

    fn send_update_interrupt(&self, cpu: CpuId) {
        let target = &self.cpus[cpu.index()];
        target.ipis.fetch_add(1, Ordering::Relaxed);
        target.ipi_pending.store(true, Ordering::Release);
    }
}

pub(crate) type SimSystem = PhysicalMapSystem<SimMachine>;

/// A started system with `cpus` CPUs; CPU 0 is current and active, the
/// others are started and idle.
pub(crate) fn boot(cpus: usize) -> SimSystem {
    let config = PmapConfig::new(PhysicalAddress::zero(), PhysicalAddress::new(MANAGED_END))
        .with_cpu_count(cpus);
    let system = PhysicalMapSystem::bootstrap(SimMachine::new(cpus), config).unwrap();
    for cpu in (0..cpus).rev() {
        set_current_cpu(cpu);
        system.cpu_start();
        if cpu != 0 {
            system.cpu_idle();
        }
    }
    system
}

/// Run `f` on `cpu` while the current CPU idles. Updates posted to either
/// CPU while it was idle are applied when it wakes.
pub(crate) fn run_on<R>(system: &SimSystem, cpu: usize, f: impl FnOnce() -> R) -> R {
    let previous = current_cpu();
    system.cpu_idle();
    set_current_cpu(cpu);
    system.cpu_wake();
    let r = f();
    system.cpu_idle();
    set_current_cpu(previous);
    system.cpu_wake();
    r
}

/// Managed physical page `n`.
pub(crate) const fn page(n: u64) -> PhysicalAddress {
    PhysicalAddress::new(n * PAGE_SIZE)
}

/// User virtual page `n`.
pub(crate) const fn va(n: u64) -> VirtualAddress {
    VirtualAddress::new(n * PAGE_SIZE)
}

/// Kernel virtual page `n`.
pub(crate) const fn kva(n: u64) -> VirtualAddress {
    VirtualAddress::new(crate::config::KERNEL_VA_START + n * PAGE_SIZE)
}

pub(crate) fn assert_tlb_coherent(system: &SimSystem, cpu: usize) {
    let stale = system.machine().stale_entries(cpu);
    assert!(stale.is_empty(), "cpu{cpu} caches stale translations: {stale:?}");
}
