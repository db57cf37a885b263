use bitflags::bitflags;

bitflags! {
    /// Access rights requested by the VM layer.
    ///
    /// On x86-64 every valid mapping is readable; [`VmProt::WRITE`] maps to the
    /// writable bit and the absence of [`VmProt::EXECUTE`] to the NX bit.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl VmProt {
    pub const NONE: Self = Self::empty();
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const ALL: Self = Self::all();
}
