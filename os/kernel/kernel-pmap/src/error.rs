use crate::addresses::{PhysicalAddress, VirtualAddress};

/// Which allocation ran dry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Shortage {
    #[error("page-table page")]
    PageTablePage,
    #[error("PV entry")]
    PvEntry,
}

/// Errors returned to the VM layer.
///
/// An operation that returns one of these has changed no mapping: every
/// leaf entry, reverse mapping and TLB is as it was. Intermediate tables
/// installed before a shortage stay, empty, until [`collect`] frees them.
///
/// [`collect`]: crate::PhysicalMapSystem::collect
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmapError {
    /// Memory ran out; reclaim and retry.
    #[error("resource shortage: out of {0}")]
    ResourceShortage(Shortage),
    /// The address lies outside the half of the address space the map covers.
    #[error("address {0} is outside the map's address range")]
    InvalidAddress(VirtualAddress),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<Shortage> for PmapError {
    fn from(value: Shortage) -> Self {
        Self::ResourceShortage(value)
    }
}

/// Invalid [`PmapConfig`](crate::PmapConfig).
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("managed physical range is empty")]
    EmptyManagedRange,
    #[error("managed range bound {0} is not page aligned")]
    MisalignedManagedRange(PhysicalAddress),
    #[error("cpu count {0} is not in 1..=64")]
    CpuCount(usize),
    #[error("TLB flush threshold must be nonzero")]
    ZeroFlushThreshold,
}
