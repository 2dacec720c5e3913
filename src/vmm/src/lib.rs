//! Core of a user-mode hypervisor that runs unmodified position-independent
//! ELF binaries as guest processes inside a KVM container.
//!
//! The host keeps authority over memory, file-backed inputs and fault
//! classification; the guest talks back over two fixed I/O ports: the
//! hypercall ABI in [`hyper`] and the Linux-syscall emulation in [`syscall`].
//! Guest memory is managed per process by [`memory::AddressSpace`], which
//! drives the hardware page tables in [`memory::page_table`] and the region
//! bookkeeping in [`memory::regions`].

pub mod config;
pub mod files;
pub mod hyper;
pub mod memory;
pub mod process;
pub mod regs;
pub mod sched;
pub mod stacktrace;
pub mod syscall;
#[cfg(target_os = "linux")]
pub mod vstate;

pub use config::VmConfig;
pub use hyper::{handle_hypercall, HostEnv, RunExit};
pub use syscall::handle_syscall;
