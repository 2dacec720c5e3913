//! The hypercall bridge: host-side dispatch for the frozen port-16 ABI.
//!
//! Every guest pointer crossing this boundary is validated against the
//! calling process's address space before it is touched; a violation does not
//! kill the hypervisor, it ends the run with a `BadAddress` fault, which is
//! exactly what a fuzzing harness wants to hear about.

use guest_abi::{
    FaultInfo, FaultKind, VmInfo, HC_END_RUN, HC_FAULT, HC_GET_FILE_LEN, HC_GET_FILE_NAME,
    HC_GET_INFO, HC_GET_KERNEL_BRK, HC_GET_MEM_INFO, HC_PRINT, HC_PRINT_STACKTRACE,
    HC_RET_BAD_INDEX, HC_SET_FILE_BUF, HC_TEST, MAX_STRING_LEN,
};
use tracing::{debug, warn};

use crate::files::FileTable;
use crate::memory;
use crate::regs::{hypercall_args, kvm_regs};
use crate::sched::Scheduler;
use crate::stacktrace;

/// How a bridge call left the run.
#[derive(Debug, PartialEq, Eq)]
pub enum RunExit {
    /// Write back the register frame and resume the guest.
    Continue,
    /// Guest signalled normal termination.
    EndRun,
    /// Guest reported (or provoked) an unrecoverable fault.
    Fault(FaultInfo),
}

/// Host-side state shared by every process in the run.
pub struct HostEnv {
    pub mem_base: u64,
    pub mem_len: u64,
    pub files: FileTable,
    /// Everything the guest printed; the harness's second observable after
    /// the exit classification.
    pub output: Vec<u8>,
    /// How much of input 0 the guest has drained over fd 0.
    pub stdin_pos: usize,
}

impl HostEnv {
    pub fn new(mem_base: u64, mem_len: u64, files: FileTable) -> HostEnv {
        HostEnv {
            mem_base,
            mem_len,
            files,
            output: Vec::new(),
            stdin_pos: 0,
        }
    }
}

pub fn handle_hypercall(
    sched: &mut Scheduler,
    env: &mut HostEnv,
    regs: &mut kvm_regs,
) -> RunExit {
    let nr = regs.rax;
    let [a0, a1, ..] = hypercall_args(regs);
    let proc = sched.current_mut();

    let result: memory::Result<i64> = match nr {
        HC_TEST => {
            debug!("test hypercall from {}: {a0:#x}", proc.pid);
            Ok(a0 as i64)
        }
        HC_PRINT => proc.vm.read_user_cstr(a0, MAX_STRING_LEN).map(|bytes| {
            env.output.extend_from_slice(&bytes);
            0
        }),
        HC_GET_MEM_INFO => proc
            .vm
            .write_user_obj(a0, env.mem_base)
            .and_then(|()| proc.vm.write_user_obj(a1, env.mem_len))
            .map(|()| 0),
        HC_GET_KERNEL_BRK => Ok(proc.image.brk as i64),
        HC_GET_INFO => {
            let info = VmInfo {
                mem_base: env.mem_base,
                mem_len: env.mem_len,
                brk: proc.image.brk,
                entry: proc.image.entry,
                phdr: proc.image.phdr,
                phent: proc.image.phent,
                phnum: proc.image.phnum,
                argc: proc.image.argc,
                argv_off: proc.image.argv_off,
                envp_off: proc.image.envp_off,
            };
            proc.vm.write_user_obj(a0, info).map(|()| 0)
        }
        HC_GET_FILE_LEN => Ok(env
            .files
            .data_len(a0 as usize)
            .map(|len| len as i64)
            .unwrap_or(HC_RET_BAD_INDEX)),
        HC_GET_FILE_NAME => match env.files.name(a0 as usize) {
            None => Ok(HC_RET_BAD_INDEX),
            Some(name) => {
                let mut bytes = name.as_bytes()[..name.len().min(MAX_STRING_LEN - 1)].to_vec();
                bytes.push(0);
                proc.vm.write_user(a1, &bytes).map(|()| 0)
            }
        },
        HC_SET_FILE_BUF => match env.files.bind(a0 as usize, a1) {
            None => Ok(HC_RET_BAD_INDEX),
            Some(data) => proc.vm.write_user(a1, data).map(|()| 0),
        },
        HC_FAULT => match proc.vm.read_user_obj::<FaultInfo>(a0) {
            Ok(info) => {
                warn!(
                    "guest fault: {:?} rip={:#x} addr={:#x}",
                    info.kind(),
                    { info.faulting_rip },
                    { info.faulting_address },
                );
                return RunExit::Fault(info);
            }
            Err(err) => Err(err),
        },
        HC_PRINT_STACKTRACE => {
            stacktrace::write_stacktrace(proc, a0, a1, &mut env.output);
            Ok(0)
        }
        HC_END_RUN => return RunExit::EndRun,
        other => {
            warn!("unknown hypercall {other} from process {}", proc.pid);
            Ok(-(libc::ENOSYS as i64))
        }
    };

    match result {
        Ok(ret) => {
            regs.rax = ret as u64;
            RunExit::Continue
        }
        Err(memory::Error::BadAddress(addr)) => {
            RunExit::Fault(FaultInfo::new(FaultKind::BadAddress, regs.rip, addr))
        }
        Err(_) => RunExit::Fault(FaultInfo::new(FaultKind::Uncategorized, regs.rip, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AddressSpace, FramePool, MapFlags, PagePerms};
    use crate::process::{Process, ProcessImage};
    use vm_memory::{GuestAddress, GuestMemoryMmap};

    const MEM_LEN: u64 = 0x400000;

    fn setup() -> (Scheduler, HostEnv) {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_LEN as usize)]).unwrap();
        let pool = FramePool::new(mem.clone(), 0x100000..MEM_LEN).into_handle();
        let mut vm = AddressSpace::new(mem, pool).unwrap();
        vm.map_range(0x10000, 0x4000, PagePerms::RW, MapFlags::empty())
            .unwrap();

        let image = ProcessImage {
            entry: 0x401050,
            brk: 0x403000,
            ..Default::default()
        };
        let proc = Process::new(1, vm, image, None);
        let mut files = FileTable::new();
        files.add("input.bin".into(), vec![0x11, 0x22, 0x33, 0x44, 0x55]);
        (Scheduler::new(proc), HostEnv::new(0, MEM_LEN, files))
    }

    fn call(sched: &mut Scheduler, env: &mut HostEnv, regs: &mut kvm_regs) -> RunExit {
        handle_hypercall(sched, env, regs)
    }

    #[test]
    fn test_echoes_argument() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_TEST,
            rdi: 0xdead_1234,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        assert_eq!(regs.rax, 0xdead_1234);
    }

    #[test]
    fn print_copies_guest_string() {
        let (mut sched, mut env) = setup();
        sched
            .current()
            .vm
            .write_user(0x10000, b"hello from the guest\n\0")
            .unwrap();
        let mut regs = kvm_regs {
            rax: HC_PRINT,
            rdi: 0x10000,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        assert_eq!(env.output, b"hello from the guest\n");
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn mem_info_round_trip() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_GET_MEM_INFO,
            rdi: 0x10000,
            rsi: 0x10008,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        let vm = &sched.current().vm;
        assert_eq!(vm.read_user_obj::<u64>(0x10000).unwrap(), 0);
        assert_eq!(vm.read_user_obj::<u64>(0x10008).unwrap(), MEM_LEN);
    }

    #[test]
    fn info_blob_matches_image() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_GET_INFO,
            rdi: 0x11000,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        let info: VmInfo = sched.current().vm.read_user_obj(0x11000).unwrap();
        assert_eq!({ info.entry }, 0x401050);
        assert_eq!({ info.brk }, 0x403000);
        assert_eq!({ info.mem_len }, MEM_LEN);
    }

    #[test]
    fn kernel_brk() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_GET_KERNEL_BRK,
            ..Default::default()
        };
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0x403000);
    }

    #[test]
    fn file_hypercalls() {
        let (mut sched, mut env) = setup();

        let mut regs = kvm_regs {
            rax: HC_GET_FILE_LEN,
            rdi: 0,
            ..Default::default()
        };
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 5);

        regs = kvm_regs {
            rax: HC_GET_FILE_LEN,
            rdi: 3,
            ..Default::default()
        };
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, HC_RET_BAD_INDEX);

        regs = kvm_regs {
            rax: HC_GET_FILE_NAME,
            rdi: 0,
            rsi: 0x10000,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        assert_eq!(
            sched.current().vm.read_user_cstr(0x10000, 64).unwrap(),
            b"input.bin"
        );

        regs = kvm_regs {
            rax: HC_SET_FILE_BUF,
            rdi: 0,
            rsi: 0x12000,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        let mut staged = [0u8; 5];
        sched.current().vm.read_user(0x12000, &mut staged).unwrap();
        assert_eq!(staged, [0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(env.files.binding(0), Some((0x12000, &[0x11u8, 0x22, 0x33, 0x44, 0x55][..])));
    }

    #[test]
    fn fault_ends_run_with_classification() {
        let (mut sched, mut env) = setup();
        let info = FaultInfo::new(FaultKind::Write, 0x401064, 0xdead_beef);
        sched.current().vm.write_user_obj(0x10000, info).unwrap();

        let mut regs = kvm_regs {
            rax: HC_FAULT,
            rdi: 0x10000,
            ..Default::default()
        };
        match call(&mut sched, &mut env, &mut regs) {
            RunExit::Fault(fault) => {
                assert_eq!(fault.kind(), FaultKind::Write);
                assert_eq!({ fault.faulting_address }, 0xdead_beef);
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn bad_pointer_becomes_bad_address_fault() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_GET_INFO,
            rdi: 0x300000, // unmapped
            rip: 0x401060,
            ..Default::default()
        };
        match call(&mut sched, &mut env, &mut regs) {
            RunExit::Fault(fault) => {
                assert_eq!(fault.kind(), FaultKind::BadAddress);
                assert_eq!({ fault.faulting_rip }, 0x401060);
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn end_run() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: HC_END_RUN,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::EndRun);
    }

    #[test]
    fn unknown_number_is_enosys() {
        let (mut sched, mut env) = setup();
        let mut regs = kvm_regs {
            rax: 999,
            ..Default::default()
        };
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        assert_eq!(regs.rax as i64, -(libc::ENOSYS as i64));
    }
}
