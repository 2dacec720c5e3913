//! Guest-side hypercall stubs.
//!
//! Arguments already sit in the SysV argument registers when a C-ABI call
//! lands here, so each stub is exactly three instructions: load the dispatch
//! number into the result register, trap to the host with the port OUT, and
//! return the value the host wrote back. A prologue would clobber the
//! bare-register contract, hence the naked functions.

use core::ffi::{c_char, c_void};

use crate::hypercalls::*;
use crate::info::{FaultInfo, VmInfo};

macro_rules! hypercall_stub {
    ($(#[$meta:meta])* $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty = $nr:expr) => {
        $(#[$meta])*
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name($($arg: $ty),*) -> $ret {
            core::arch::naked_asm!(
                "mov eax, {nr}",
                "out {port}, al",
                "ret",
                nr = const $nr,
                port = const HYPERCALL_PORT,
            )
        }
    };
}

hypercall_stub! {
    /// Host-side debug echo.
    hc_test(arg: u64) -> u64 = HC_TEST
}

hypercall_stub! {
    /// Print a NUL-terminated string from guest memory.
    hc_print(s: *const c_char) -> i64 = HC_PRINT
}

hypercall_stub! {
    /// Receive the guest-physical memory base and length.
    hc_get_mem_info(base: *mut *mut c_void, len: *mut u64) -> i64 = HC_GET_MEM_INFO
}

hypercall_stub! {
    /// Initial program break chosen by the host loader.
    hc_get_kernel_brk() -> u64 = HC_GET_KERNEL_BRK
}

hypercall_stub! {
    /// Receive the `VmInfo` environment record.
    hc_get_info(info: *mut VmInfo) -> i64 = HC_GET_INFO
}

hypercall_stub! {
    /// Length of the Nth file-backed input, or `HC_RET_BAD_INDEX`.
    hc_get_file_len(n: u64) -> i64 = HC_GET_FILE_LEN
}

hypercall_stub! {
    /// Name of the Nth file-backed input, written NUL-terminated.
    hc_get_file_name(n: u64, buf: *mut c_char) -> i64 = HC_GET_FILE_NAME
}

hypercall_stub! {
    /// Bind a guest buffer the host will stage the Nth file's bytes into.
    hc_set_file_buf(n: u64, buf: *mut c_void) -> i64 = HC_SET_FILE_BUF
}

hypercall_stub! {
    /// Report an unrecoverable fault. The host ends the run; this does not
    /// return.
    hc_fault(info: *const FaultInfo) -> i64 = HC_FAULT
}

hypercall_stub! {
    /// Ask the host to unwind and symbolize the guest stack.
    hc_print_stacktrace(rsp: u64, rip: u64) -> i64 = HC_PRINT_STACKTRACE
}

hypercall_stub! {
    /// Signal normal termination of the run.
    hc_end_run() -> i64 = HC_END_RUN
}
