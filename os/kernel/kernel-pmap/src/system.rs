//! # The map system
//!
//! [`PhysicalMapSystem`] owns everything shared between maps: the managed-page
//! tables (PV lists, lock bits, attribute bytes), the page-table-page arena,
//! the kernel map, the per-CPU shootdown mailboxes and the map-system lock.
//! It is created once by [`bootstrap`](PhysicalMapSystem::bootstrap) and
//! lives for the rest of the kernel's lifetime.
//!
//! ## Kernel half
//!
//! PML4 slots `256..512` belong to the kernel. Their PDPT pages are allocated
//! at bootstrap and never freed, so copying those 256 slots into a new root is
//! all it takes for a user map to see every present and future kernel
//! mapping.

use crate::addresses::PhysicalAddress;
use crate::config::{ENTRIES_PER_TABLE, KERNEL_PML4_START, PmapConfig};
use crate::error::PmapError;
use crate::locking::{CriticalSection, MapGuard};
use crate::machine::{AtomicCpuSet, CpuId, CpuSet, Machine};
use crate::managed::ManagedPages;
use crate::pmap::{Pmap, PmapHandle, PmapId, PmapIds};
use crate::pt_pages::PageTablePages;
use crate::pte::{PageTable, PageTableEntry};
use crate::tlb::CpuState;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;
use kernel_sync::{RwSpinLock, Spl, SplGuard, SpinLock};
use log::{debug, info, trace, warn};

/// Shared state of the physical-map layer.
pub struct PhysicalMapSystem<M: Machine> {
    pub(crate) machine: M,
    pub(crate) config: PmapConfig,
    /// Read for per-mapping operations, write for whole-page operations.
    pub(crate) system_lock: RwSpinLock<()>,
    pub(crate) managed: ManagedPages,
    pub(crate) pt_pages: SpinLock<PageTablePages>,
    kernel: Arc<Pmap>,
    cpus: Box<[CpuState]>,
    /// CPUs that will take an update interrupt. A CPU outside this set
    /// drains its mailbox before it rejoins.
    pub(crate) cpus_active: AtomicCpuSet,
    cpus_started: AtomicCpuSet,
    ids: PmapIds,
}

impl<M: Machine> PhysicalMapSystem<M> {
    /// Set up the layer: managed-page tables, the kernel map with its
    /// upper-half PDPT pages, and one mailbox per configured CPU.
    ///
    /// # Errors
    /// - [`PmapError::Config`] for an invalid `config`.
    /// - [`PmapError::ResourceShortage`] if the kernel's page-table pages
    ///   cannot be allocated. Frames taken so far are returned.
    pub fn bootstrap(machine: M, config: PmapConfig) -> Result<Self, PmapError> {
        config.validate()?;

        let mut pages = PageTablePages::new();
        let root = match Self::kernel_tables(&machine, &mut pages) {
            Ok(root) => root,
            Err(e) => {
                pages.release_all(&machine);
                return Err(e);
            }
        };

        let managed = ManagedPages::new(&config);
        info!(
            "pmap: bootstrap: {} managed pages in {}..{}, {} cpu(s), kernel root {root}",
            managed.len(),
            config.first_managed,
            config.last_managed,
            config.cpu_count,
        );

        Ok(Self {
            machine,
            config,
            system_lock: RwSpinLock::new(()),
            managed,
            pt_pages: SpinLock::new(pages),
            kernel: Arc::new(Pmap::new(PmapId::KERNEL, root, true)),
            cpus: (0..config.cpu_count).map(|_| CpuState::new()).collect(),
            cpus_active: AtomicCpuSet::new(),
            cpus_started: AtomicCpuSet::new(),
            ids: PmapIds::new(),
        })
    }

    fn kernel_tables(
        machine: &M,
        pages: &mut PageTablePages,
    ) -> Result<PhysicalAddress, PmapError> {
        let root = pages.alloc(machine)?;
        // Safety: just allocated, recorded in `pages`.
        let pml4 = unsafe { machine.table(root) };
        for slot in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            let pdpt = pages.alloc(machine)?;
            pml4.store(slot, PageTableEntry::table(pdpt, false));
        }
        Ok(root)
    }

    #[must_use]
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    #[must_use]
    pub const fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// The kernel map. Never destroyed.
    #[must_use]
    pub const fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    /// `[first, last)` of managed physical memory.
    #[must_use]
    pub const fn managed_range(&self) -> (PhysicalAddress, PhysicalAddress) {
        (self.managed.first(), self.managed.last())
    }

    /// Page-table pages currently allocated, roots included.
    #[must_use]
    pub fn pt_page_count(&self) -> usize {
        self.pt_pages.with_lock(|p| p.len())
    }

    /// CPUs that will take an update interrupt right now.
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        self.cpus_active.load()
    }

    pub(crate) fn cpu_state(&self, cpu: CpuId) -> &CpuState {
        self.cpus
            .get(cpu.index())
            .unwrap_or_else(|| panic!("pmap: {cpu} is not a configured CPU"))
    }

    /// Page-table page at `pa`.
    ///
    /// Only called for roots and for pages reached through a valid entry of
    /// a map whose lock the caller holds (or which no one else can reach),
    /// so the page stays allocated while the reference lives.
    pub(crate) fn table(&self, pa: PhysicalAddress) -> &PageTable {
        debug_assert!(
            self.pt_pages.with_lock(|p| p.contains(pa)),
            "pmap: {pa} is not a page-table page"
        );
        // Safety: see above; every such frame came from `pt_pages`.
        unsafe { self.machine.table(pa) }
    }

    /// The frame comes from the allocator before the arena lock is taken.
    pub(crate) fn alloc_pt_page(&self) -> Result<PhysicalAddress, PmapError> {
        let pa = PageTablePages::frame(&self.machine)?;
        self.pt_pages.with_lock(|p| p.adopt(&self.machine, pa))
    }

    pub(crate) fn free_pt_page(&self, pa: PhysicalAddress) {
        self.pt_pages.with_lock(|p| p.free(&self.machine, pa));
    }

    /// Create an empty user map sharing the kernel half.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if no frame is left for the root.
    pub fn create(&self) -> Result<PmapHandle<'_, M>, PmapError> {
        let root = self.alloc_pt_page()?;
        let template = self.table(self.kernel.root());
        let pml4 = self.table(root);
        for slot in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            pml4.store(slot, template.load(slot));
        }

        let pmap = Arc::new(Pmap::new(self.ids.next(), root, false));
        debug!("pmap: created {} with root {root}", pmap.id());
        Ok(PmapHandle::adopt(self, pmap))
    }

    /// Create a map for the VM layer. Software-only maps (`size != 0`) are
    /// not supported and yield `None`.
    ///
    /// # Errors
    /// As [`create`](Self::create).
    pub fn create_map(&self, size: u64) -> Result<Option<PmapHandle<'_, M>>, PmapError> {
        if size != 0 {
            debug!("pmap: refusing software-only map of {size:#x} bytes");
            return Ok(None);
        }
        self.create().map(Some)
    }

    /// Take another reference to `pmap`.
    ///
    /// # Panics
    /// If the last reference to `pmap` is already gone.
    pub fn reference(&self, pmap: &Arc<Pmap>) -> PmapHandle<'_, M> {
        pmap.retain();
        PmapHandle::adopt(self, Arc::clone(pmap))
    }

    /// Drop a reference. The last one destroys the map.
    pub fn release(&self, map: PmapHandle<'_, M>) {
        drop(map);
    }

    pub(crate) fn release_ref(&self, pmap: &Pmap) {
        if pmap.drop_ref() == 0 {
            assert!(!pmap.is_kernel(), "pmap: last reference to the kernel map released");
            self.destroy(pmap);
        }
    }

    /// Tear down a user map whose last reference is gone: remove what is
    /// still mapped, then free every page-table page below the kernel half
    /// and the root.
    fn destroy(&self, pmap: &Pmap) {
        let stats = pmap.statistics();
        debug!(
            "pmap: destroying {} ({} resident, {} wired)",
            pmap.id(),
            stats.resident_count,
            stats.wired_count
        );
        if stats.wired_count != 0 {
            warn!(
                "pmap: {} destroyed with {} wired mapping(s)",
                pmap.id(),
                stats.wired_count
            );
        }
        if !pmap.cpus_using().is_empty() {
            warn!("pmap: {} destroyed while in use on {:?}", pmap.id(), pmap.cpus_using());
        }

        let locked = self.read_lock();
        let _map = MapGuard::lock(pmap);
        pmap.mark_destroyed();

        let (start, end) = pmap.va_range();
        if self.remove_range(pmap, start, end) != 0 {
            self.shootdown(locked.cs(), pmap, start, end);
        }

        let root = self.table(pmap.root());
        for slot in 0..KERNEL_PML4_START {
            let pml4e = root.clear(slot);
            if !pml4e.is_valid() {
                continue;
            }
            let pdpt = self.table(pml4e.frame());
            for (_, pdpte) in pdpt.valid_entries() {
                let pd = self.table(pdpte.frame());
                for (_, pde) in pd.valid_entries() {
                    self.free_pt_page(pde.frame());
                }
                self.free_pt_page(pdpte.frame());
            }
            self.free_pt_page(pml4e.frame());
        }
        self.free_pt_page(pmap.root());
    }

    /// Make `pmap` the current address space of the calling CPU.
    ///
    /// # Panics
    /// If `pmap` has been destroyed.
    pub fn activate(&self, pmap: &Arc<Pmap>) {
        pmap.assert_live();
        let cs = CriticalSection::enter(self);
        let cpu = cs.cpu();
        let state = self.cpu_state(cpu);
        let mut current = state.current.lock();

        if state.current_id.load(Ordering::Acquire) == pmap.id().as_u64() {
            return;
        }
        if let Some(previous) = current.take() {
            previous.cpu_set().remove(cpu);
        }
        if !pmap.is_kernel() {
            pmap.cpu_set().insert(cpu);
            *current = Some(Arc::clone(pmap));
        }
        state.current_id.store(pmap.id().as_u64(), Ordering::Release);
        self.machine.load_root(pmap.root());
        trace!("pmap: {cpu} now runs {}", pmap.id());
    }

    /// Stop running `pmap` on the calling CPU, falling back to the kernel
    /// map. No-op if `pmap` is not current here.
    pub fn deactivate(&self, pmap: &Pmap) {
        let cs = CriticalSection::enter(self);
        let cpu = cs.cpu();
        let state = self.cpu_state(cpu);
        let mut current = state.current.lock();

        if current.as_ref().is_none_or(|c| c.id() != pmap.id()) {
            return;
        }
        if let Some(previous) = current.take() {
            previous.cpu_set().remove(cpu);
        }
        state.current_id.store(PmapId::KERNEL.as_u64(), Ordering::Release);
        self.machine.load_root(self.kernel.root());
        trace!("pmap: {cpu} left {}", pmap.id());
    }

    /// Bring the calling CPU into the layer: it runs the kernel map and
    /// takes part in shootdowns from here on.
    pub fn cpu_start(&self) {
        let _spl = SplGuard::raise(&self.machine, Spl::Vm);
        let cpu = self.machine.current_cpu();
        let state = self.cpu_state(cpu);
        if self.cpus_started.insert(cpu) {
            warn!("pmap: {cpu} started twice");
        }

        state.current_id.store(PmapId::KERNEL.as_u64(), Ordering::Release);
        self.kernel.cpu_set().insert(cpu);
        self.machine.load_root(self.kernel.root());
        self.cpus_active.insert(cpu);
        self.process_updates(cpu);
        info!("pmap: {cpu} started");
    }

    /// The calling CPU goes idle and stops taking update interrupts.
    pub fn cpu_idle(&self) {
        let cpu = self.machine.current_cpu();
        self.cpus_active.remove(cpu);
    }

    /// The calling CPU leaves idle. Updates posted meanwhile are applied
    /// before this returns.
    pub fn cpu_wake(&self) {
        let _spl = SplGuard::raise(&self.machine, Spl::Vm);
        let cpu = self.machine.current_cpu();
        self.cpus_active.insert(cpu);
        self.process_updates(cpu);
    }
}

impl<M: Machine> fmt::Debug for PhysicalMapSystem<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMapSystem")
            .field("config", &self.config)
            .field("managed", &self.managed)
            .field("kernel", &self.kernel)
            .field("cpus_active", &self.cpus_active)
            .field("cpus_started", &self.cpus_started)
            .finish_non_exhaustive()
    }
}
