//! The vCPU register frame the bridges operate on.

#[cfg(target_os = "linux")]
pub use kvm_bindings::kvm_regs;

#[cfg(not(target_os = "linux"))]
#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[allow(non_camel_case_types)]
pub struct kvm_regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Hypercall arguments: the C calling convention's argument registers, in
/// SysV order.
pub fn hypercall_args(regs: &kvm_regs) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.rcx, regs.r8, regs.r9]
}

/// Syscall arguments: same ordering except r10 replaces rcx, as the kernel
/// ABI has it.
pub fn syscall_args(regs: &kvm_regs) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
}
