//! The wire contract between the guest kernel and the hypervisor.
//!
//! Everything in this crate is shared bit-exactly with in-guest code. The
//! hypercall numbers, the I/O ports and the `VmInfo`/`FaultInfo` layouts are
//! frozen: changing any of them is a breaking ABI change.

pub mod hypercalls;
pub mod info;
pub mod print;
#[cfg(target_arch = "x86_64")]
pub mod stubs;

pub use hypercalls::*;
pub use info::{FaultInfo, FaultKind, VmInfo};
pub use print::{LineBuffer, PrintSink, PRINT_BUF_SIZE};
