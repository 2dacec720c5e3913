use vm_memory::ByteValued;

/// Environment record the host writes into the guest on `HC_GET_INFO`.
///
/// Packed, little-endian, identical layout on both sides.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Guest-physical base of RAM.
    pub mem_base: u64,
    /// Length of guest RAM in bytes.
    pub mem_len: u64,
    /// Initial program break chosen by the host loader.
    pub brk: u64,
    /// Entry point of the loaded binary, after rebasing.
    pub entry: u64,
    /// Program header table as seen by the guest, for auxv.
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
    /// Argument count and the user-stack offsets of the argv/envp string
    /// tables the host materialized.
    pub argc: u64,
    pub argv_off: u64,
    pub envp_off: u64,
}

// SAFETY: plain integers, no padding between u64 fields, packed layout.
unsafe impl ByteValued for VmInfo {}

/// Classification of an unrecoverable guest fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u64)]
pub enum FaultKind {
    Read = 0,
    Write = 1,
    Exec = 2,
    Uncategorized = 3,
    BadAddress = 4,
    AssertFailed = 5,
}

impl FaultKind {
    pub fn from_raw(raw: u64) -> FaultKind {
        match raw {
            0 => FaultKind::Read,
            1 => FaultKind::Write,
            2 => FaultKind::Exec,
            4 => FaultKind::BadAddress,
            5 => FaultKind::AssertFailed,
            _ => FaultKind::Uncategorized,
        }
    }
}

/// Payload of the `HC_FAULT` hypercall: the guest's dying words.
#[repr(C, packed)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    pub kind: u64,
    pub faulting_rip: u64,
    pub faulting_address: u64,
    pub extra: u64,
}

// SAFETY: plain integers, no padding between u64 fields, packed layout.
unsafe impl ByteValued for FaultInfo {}

impl FaultInfo {
    pub fn new(kind: FaultKind, faulting_rip: u64, faulting_address: u64) -> FaultInfo {
        FaultInfo {
            kind: kind as u64,
            faulting_rip,
            faulting_address,
            extra: 0,
        }
    }

    pub fn kind(&self) -> FaultKind {
        FaultKind::from_raw(self.kind)
    }
}
