//! Hypercall dispatch numbers and ports.
//!
//! A hypercall is an 8-bit OUT to `HYPERCALL_PORT` from the low byte of the
//! result register; the host reads the full result register for the dispatch
//! number and the SysV argument registers (rdi, rsi, rdx, rcx, r8, r9) for
//! arguments. The return value replaces the result register before resume.

/// Port that carries hypercalls from the guest kernel and runtime.
pub const HYPERCALL_PORT: u16 = 16;

/// Port that forwards guest `syscall` traps to the host-side Linux dispatcher.
/// Same register convention as hypercalls, with the syscall number in the
/// result register.
pub const SYSCALL_PORT: u16 = 17;

// kernel code refers to these as HC_*
pub const HC_TEST: u64 = 0;
pub const HC_PRINT: u64 = 1;
pub const HC_GET_MEM_INFO: u64 = 2;
pub const HC_GET_KERNEL_BRK: u64 = 3;
pub const HC_GET_INFO: u64 = 4;
pub const HC_GET_FILE_LEN: u64 = 5;
pub const HC_GET_FILE_NAME: u64 = 6;
pub const HC_SET_FILE_BUF: u64 = 7;
pub const HC_FAULT: u64 = 8;
pub const HC_PRINT_STACKTRACE: u64 = 9;
pub const HC_END_RUN: u64 = 10;

/// Host writes at most this many bytes (terminator included) when the guest
/// hands it a string buffer, and reads at most this many when the guest hands
/// it a string pointer.
pub const MAX_STRING_LEN: usize = 4096;

pub const HC_RET_SUCCESS: i64 = 0;
pub const HC_RET_BAD_INDEX: i64 = -1;
