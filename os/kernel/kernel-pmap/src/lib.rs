//! # Physical maps
//!
//! The machine-dependent half of a Mach-style virtual-memory system: it
//! keeps x86-64 page tables, reverse mappings and every CPU's TLB in step
//! with what the machine-independent VM layer asks for.
//!
//! ## Pieces
//!
//! - A [`Pmap`] is one address space: a PML4 root, the CPUs running on it,
//!   resident/wired counters and a lock. User maps are created by
//!   [`PhysicalMapSystem::create`] and reference counted through
//!   [`PmapHandle`]; the kernel map is created at bootstrap and never dies.
//! - The **walker** finds or allocates the leaf PTE for a virtual address.
//! - The **PV store** records, for every managed physical page, each
//!   `(map, va)` that maps it, so whole-page operations
//!   ([`page_protect`](PhysicalMapSystem::page_protect),
//!   [`is_modified`](PhysicalMapSystem::is_modified), ...) can find all of
//!   them.
//! - **Attribute bytes** keep the modified/referenced bits of PTEs that
//!   have been torn down.
//! - **TLB shootdown** makes every PTE change visible on all CPUs before the
//!   changing call returns.
//!
//! ## Locking
//!
//! A map-system reader/writer lock, one lock per map and one lock bit per
//! physical page. Per-mapping operations take the system lock for reading;
//! whole-page operations take it for writing. No path ever holds two map
//! locks or two page locks at once.
//!
//! ## Platform
//!
//! Nothing here executes privileged instructions. The embedding kernel
//! implements [`Machine`] (frame allocation, physical-to-table mapping, TLB
//! flushes, `CR3` loads, IPIs, interrupt priority).
//!
//! ```text
//!  VM layer ──► enter / remove / protect ──► walker ──► PTE
//!                        │                               │
//!                        ├──► PV store ◄── page_protect  │
//!                        └──► shootdown ──► other CPUs' TLBs
//! ```

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod addresses;
mod attributes;
mod config;
mod error;
mod locking;
mod machine;
mod managed;
mod mapping;
mod page_ops;
mod pmap;
mod prot;
mod pt_pages;
mod pte;
mod pv;
mod system;
mod tlb;
mod walker;

#[cfg(test)]
mod testing;

pub use crate::addresses::{PhysicalAddress, VirtualAddress};
pub use crate::attributes::PageAttributes;
pub use crate::config::{
    DEFAULT_FLUSH_THRESHOLD, ENTRIES_PER_TABLE, KERNEL_PML4_START, KERNEL_VA_END,
    KERNEL_VA_START, MAX_CPUS, PAGE_SHIFT, PAGE_SIZE, PmapConfig, UPDATE_LIST_SIZE, USER_VA_END,
};
pub use crate::error::{ConfigError, PmapError, Shortage};
pub use crate::machine::{
    AtomicCpuSet, CpuId, CpuSet, FrameAlloc, Machine, PhysMapper, Processor,
};
pub use crate::mapping::Translation;
pub use crate::pmap::{Pmap, PmapHandle, PmapId, Statistics};
pub use crate::prot::VmProt;
pub use crate::pte::{Level, PageTable, PageTableEntry};
pub use crate::system::PhysicalMapSystem;
pub use crate::tlb::UpdateRequest;
