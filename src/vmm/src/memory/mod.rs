//! Guest memory management: the frame pool, the hardware page table the
//! guest runs on, and the per-process address space that keeps the two
//! consistent with the region bookkeeping.

pub mod address_space;
pub mod frames;
pub mod page_table;
pub mod regions;

use bitflags::bitflags;

pub use address_space::AddressSpace;
pub use frames::{FramePool, FramePoolHandle};
pub use page_table::{PageTable, PteFlags};
pub use regions::RegionManager;

/// Memory-management failures visible to callers. Disagreements between the
/// region manager and the page table are not errors; they are bugs and abort
/// the hypervisor.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("address range is already mapped")]
    AlreadyMapped,
    #[error("address is not mapped")]
    NotMapped,
    #[error("address range is outside the user window or misaligned")]
    NotUserRange,
    #[error("out of guest physical frames")]
    OutOfMemory,
    #[error("bad guest address {0:#x}")]
    BadAddress(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Page access permissions. `empty()` is a valid mapped state (a page
    /// that exists but traps on any access), distinct from "unmapped".
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PagePerms: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

impl PagePerms {
    pub const RW: PagePerms = PagePerms::READ.union(PagePerms::WRITE);
    pub const RX: PagePerms = PagePerms::READ.union(PagePerms::EXEC);
}

bitflags! {
    /// Caller-selected mapping behavior, combined with [`PagePerms`] into the
    /// final page-table entry options.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// Frame is refcounted in the pool and shared across `clone`.
        const SHARED = 1;
        /// Atomically replace an existing mapping instead of failing.
        const DISCARD = 2;
    }
}
