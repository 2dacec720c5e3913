//! The syscall bridge: Linux-ABI emulation for guest `syscall` traps
//! forwarded on the syscall port.
//!
//! Same register convention as the hypercall bridge, with the kernel's r10
//! quirk. Handlers run against the calling process's address space; blocking
//! handlers park the caller and hand the register frame to whoever runs
//! next. Coverage is deliberately partial: anything a fuzz target does not
//! need gets `-ENOSYS`.

use tracing::{debug, warn};
use utils::{align_up, PAGE_SIZE};

use crate::hyper::{HostEnv, RunExit};
use crate::memory::{Error as MemError, MapFlags, PagePerms};
use crate::process::{ProcState, Process, WaitReason};
use crate::regs::{kvm_regs, syscall_args};
use crate::sched::Scheduler;

const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;
const SYS_MMAP: u64 = 9;
const SYS_MPROTECT: u64 = 10;
const SYS_MUNMAP: u64 = 11;
const SYS_BRK: u64 = 12;
const SYS_GETPID: u64 = 39;
const SYS_FORK: u64 = 57;
const SYS_EXIT: u64 = 60;
const SYS_WAIT4: u64 = 61;
const SYS_EXIT_GROUP: u64 = 231;

const PROT_READ: u64 = 1;
const PROT_WRITE: u64 = 2;
const PROT_EXEC: u64 = 4;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

// bounded so a corrupt length cannot make the host allocate wildly
const MAX_IO_LEN: usize = 1 << 20;

fn errno(code: i32) -> i64 {
    -(code as i64)
}

fn prot_to_perms(prot: u64) -> PagePerms {
    let mut perms = PagePerms::empty();
    if prot & PROT_READ != 0 {
        perms |= PagePerms::READ;
    }
    if prot & PROT_WRITE != 0 {
        perms |= PagePerms::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        perms |= PagePerms::EXEC;
    }
    perms
}

pub fn handle_syscall(sched: &mut Scheduler, env: &mut HostEnv, regs: &mut kvm_regs) -> RunExit {
    let nr = regs.rax;
    let args = syscall_args(regs);

    let ret: i64 = match nr {
        SYS_READ => sys_read(sched.current_mut(), env, args),
        SYS_WRITE => sys_write(sched.current_mut(), env, args),
        SYS_MMAP => sys_mmap(sched.current_mut(), args),
        SYS_MPROTECT => sys_mprotect(sched.current_mut(), args),
        SYS_MUNMAP => sys_munmap(sched.current_mut(), args),
        SYS_BRK => sys_brk(sched.current_mut(), args),
        SYS_GETPID => sched.current().pid as i64,
        SYS_FORK => sys_fork(sched, regs),
        SYS_EXIT | SYS_EXIT_GROUP => return do_exit(sched, regs, args[0] as i32),
        SYS_WAIT4 => return do_wait4(sched, regs, args),
        other => {
            warn!("unimplemented syscall {other} from process {}", sched.current().pid);
            errno(libc::ENOSYS)
        }
    };

    regs.rax = ret as u64;
    RunExit::Continue
}

/// fd 0 drains input file 0, which is how a target that reads stdin gets its
/// fuzz case. Other descriptors do not exist here.
fn sys_read(proc: &mut Process, env: &mut HostEnv, args: [u64; 6]) -> i64 {
    let [fd, buf, len, ..] = args;
    if fd != 0 {
        return errno(libc::EBADF);
    }
    let len = (len as usize).min(MAX_IO_LEN);
    let data = env.files.data(0).unwrap_or(&[]);
    let pos = env.stdin_pos.min(data.len());
    let take = (data.len() - pos).min(len);
    if take == 0 {
        return 0; // EOF
    }
    match proc.vm.write_user(buf, &data[pos..pos + take]) {
        Ok(()) => {
            env.stdin_pos = pos + take;
            take as i64
        }
        Err(_) => errno(libc::EFAULT),
    }
}

fn sys_write(proc: &mut Process, env: &mut HostEnv, args: [u64; 6]) -> i64 {
    let [fd, buf, len, ..] = args;
    if fd != 1 && fd != 2 {
        return errno(libc::EBADF);
    }
    let len = (len as usize).min(MAX_IO_LEN);
    let mut bytes = vec![0u8; len];
    match proc.vm.read_user(buf, &mut bytes) {
        Ok(()) => {
            env.output.extend_from_slice(&bytes);
            len as i64
        }
        Err(_) => errno(libc::EFAULT),
    }
}

fn sys_mmap(proc: &mut Process, args: [u64; 6]) -> i64 {
    let [addr, len, prot, flags, fd, _off] = args;
    if len == 0 {
        return errno(libc::EINVAL);
    }
    if flags & MAP_ANONYMOUS == 0 || fd as i64 != -1 {
        // file-backed inputs reach the guest through the file hypercalls,
        // not mmap
        return errno(libc::ENODEV);
    }
    let len = align_up(len, PAGE_SIZE);
    let perms = prot_to_perms(prot);

    if flags & MAP_FIXED != 0 {
        // MAP_FIXED replaces whatever was there
        let _ = proc.vm.unmap_range(addr, len);
        match proc.vm.map_range(addr, len, perms, MapFlags::empty()) {
            Ok(()) => addr as i64,
            Err(MemError::NotUserRange) => errno(libc::EINVAL),
            Err(MemError::AlreadyMapped) => errno(libc::EEXIST),
            Err(_) => errno(libc::ENOMEM),
        }
    } else {
        match proc.vm.map_range_anywhere(len, perms, MapFlags::empty()) {
            Ok(addr) => addr as i64,
            Err(MemError::NotUserRange) => errno(libc::EINVAL),
            Err(_) => errno(libc::ENOMEM),
        }
    }
}

fn sys_mprotect(proc: &mut Process, args: [u64; 6]) -> i64 {
    let [addr, len, prot, ..] = args;
    match proc.vm.set_range_perms(addr, len, prot_to_perms(prot)) {
        Ok(()) => 0,
        Err(MemError::NotUserRange) => errno(libc::EINVAL),
        Err(_) => errno(libc::ENOMEM),
    }
}

fn sys_munmap(proc: &mut Process, args: [u64; 6]) -> i64 {
    let [addr, len, ..] = args;
    match proc.vm.unmap_range(addr, len) {
        // Linux munmap does not complain about holes either
        Ok(()) | Err(MemError::NotMapped) => 0,
        Err(_) => errno(libc::EINVAL),
    }
}

fn sys_brk(proc: &mut Process, args: [u64; 6]) -> i64 {
    let target = args[0];
    if target == 0 || target < proc.image.brk {
        return proc.brk as i64;
    }

    let mapped_top = align_up(proc.brk, PAGE_SIZE);
    let target_top = align_up(target, PAGE_SIZE);
    let grown = if target_top > mapped_top {
        proc.vm
            .map_range(
                mapped_top,
                target_top - mapped_top,
                PagePerms::RW,
                MapFlags::empty(),
            )
            .is_ok()
    } else {
        if target_top < mapped_top {
            let _ = proc.vm.unmap_range(target_top, mapped_top - target_top);
        }
        true
    };

    if grown {
        proc.brk = target;
    }
    proc.brk as i64
}

fn sys_fork(sched: &mut Scheduler, regs: &mut kvm_regs) -> i64 {
    let child_pid = sched.alloc_pid();
    let parent = sched.current_mut();
    let parent_pid = parent.pid;
    // the child resumes from the same frame with rax = 0
    let mut child_regs = *regs;
    child_regs.rax = 0;

    let vm = match parent.vm.fork() {
        Ok(vm) => vm,
        Err(err) => {
            debug!("fork failed for {parent_pid}: {err}");
            return errno(libc::ENOMEM);
        }
    };

    let mut child = Process::new(child_pid, vm, parent.image, parent.symbols.clone());
    child.parent = Some(parent_pid);
    child.brk = parent.brk;
    child.regs = child_regs;
    parent.children.push(child_pid);
    sched.add(child);
    child_pid as i64
}

fn do_exit(sched: &mut Scheduler, regs: &mut kvm_regs, status: i32) -> RunExit {
    sched.current_mut().regs = *regs;
    sched.exit_current(status);
    if !sched.any_runnable() {
        return RunExit::EndRun;
    }
    let next = sched.schedule();
    *regs = sched.get(next).expect("scheduled process exists").regs;
    RunExit::Continue
}

fn do_wait4(sched: &mut Scheduler, regs: &mut kvm_regs, args: [u64; 6]) -> RunExit {
    let filter = args[0] as i64;
    let status_ptr = args[1];

    // The child may already be a zombie; we park anyway and let the
    // scheduler's deadlock check catch the case where nothing can ever wake
    // us. Known wart, kept on purpose.
    let proc = sched.current_mut();
    proc.regs = *regs;
    proc.state = ProcState::Waiting(WaitReason::Child { filter, status_ptr });

    let next = sched.schedule();
    *regs = sched.get(next).expect("scheduled process exists").regs;
    RunExit::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileTable;
    use crate::memory::{AddressSpace, FramePool};
    use crate::process::ProcessImage;
    use vm_memory::{GuestAddress, GuestMemoryMmap};

    const MEM_LEN: u64 = 0x800000;

    fn space() -> AddressSpace {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), MEM_LEN as usize)]).unwrap();
        let pool = FramePool::new(mem.clone(), 0x100000..MEM_LEN).into_handle();
        AddressSpace::new(mem, pool).unwrap()
    }

    fn setup() -> (Scheduler, HostEnv) {
        let mut vm = space();
        vm.map_range(0x10000, 0x2000, PagePerms::RW, MapFlags::empty())
            .unwrap();
        let image = ProcessImage {
            entry: 0x401000,
            brk: 0x403000,
            ..Default::default()
        };
        let proc = Process::new(1, vm, image, None);
        (Scheduler::new(proc), HostEnv::new(0, MEM_LEN, FileTable::new()))
    }

    fn call(sched: &mut Scheduler, env: &mut HostEnv, regs: &mut kvm_regs) -> RunExit {
        handle_syscall(sched, env, regs)
    }

    fn syscall_regs(nr: u64, args: [u64; 6]) -> kvm_regs {
        kvm_regs {
            rax: nr,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
            r10: args[3],
            r8: args[4],
            r9: args[5],
            ..Default::default()
        }
    }

    #[test]
    fn mmap_munmap_mprotect() {
        let (mut sched, mut env) = setup();

        let mut regs = syscall_regs(
            SYS_MMAP,
            [0, 0x3000, PROT_READ | PROT_WRITE, MAP_ANONYMOUS | 0x2, u64::MAX, 0],
        );
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        let addr = regs.rax;
        assert!((addr as i64) > 0);
        assert_eq!(sched.current().vm.page_perms(addr), Some(PagePerms::RW));

        let mut regs = syscall_regs(SYS_MPROTECT, [addr, 0x1000, PROT_READ, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0);
        assert_eq!(sched.current().vm.page_perms(addr), Some(PagePerms::READ));

        let mut regs = syscall_regs(SYS_MUNMAP, [addr, 0x3000, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0);
        assert!(!sched.current().vm.is_mapped(addr));

        // non-anonymous mappings are not a thing here
        let mut regs = syscall_regs(SYS_MMAP, [0, 0x1000, PROT_READ, 0x2, 3, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, errno(libc::ENODEV));
    }

    #[test]
    fn brk_grows_and_queries() {
        let (mut sched, mut env) = setup();

        let mut regs = syscall_regs(SYS_BRK, [0, 0, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0x403000);

        let mut regs = syscall_regs(SYS_BRK, [0x405800, 0, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0x405800);
        assert!(sched.current().vm.is_mapped(0x405000));
        sched.current().vm.write_user(0x403000, &[1; 0x1000]).unwrap();

        // shrink unmaps the tail pages
        let mut regs = syscall_regs(SYS_BRK, [0x403800, 0, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0x403800);
        assert!(sched.current().vm.is_mapped(0x403000));
        assert!(!sched.current().vm.is_mapped(0x404000));

        // below the initial brk: refused, current break reported
        let mut regs = syscall_regs(SYS_BRK, [0x100000, 0, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0x403800);
    }

    #[test]
    fn read_drains_first_input() {
        let (mut sched, mut env) = setup();
        env.files.add("stdin.bin".into(), b"seed data".to_vec());

        let mut regs = syscall_regs(SYS_READ, [0, 0x10000, 4, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 4);
        let mut buf = [0u8; 4];
        sched.current().vm.read_user(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b"seed");

        // the cursor advances; an oversized read returns just the tail
        let mut regs = syscall_regs(SYS_READ, [0, 0x10000, 64, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 5);
        let mut buf = [0u8; 5];
        sched.current().vm.read_user(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b" data");

        // then EOF
        let mut regs = syscall_regs(SYS_READ, [0, 0x10000, 16, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0);

        // only fd 0 exists
        let mut regs = syscall_regs(SYS_READ, [3, 0x10000, 4, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, errno(libc::EBADF));

        // unmapped destination buffer
        env.stdin_pos = 0;
        let mut regs = syscall_regs(SYS_READ, [0, 0x300000, 4, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, errno(libc::EFAULT));
    }

    #[test]
    fn read_without_inputs_is_eof() {
        let (mut sched, mut env) = setup();
        let mut regs = syscall_regs(SYS_READ, [0, 0x10000, 16, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn write_goes_to_run_output() {
        let (mut sched, mut env) = setup();
        sched.current().vm.write_user(0x10000, b"fuzz me").unwrap();

        let mut regs = syscall_regs(SYS_WRITE, [1, 0x10000, 7, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 7);
        assert_eq!(env.output, b"fuzz me");

        let mut regs = syscall_regs(SYS_WRITE, [5, 0x10000, 7, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, errno(libc::EBADF));
    }

    #[test]
    fn getpid_and_enosys() {
        let (mut sched, mut env) = setup();
        let mut regs = syscall_regs(SYS_GETPID, [0; 6]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax, 1);

        let mut regs = syscall_regs(4242, [0; 6]);
        call(&mut sched, &mut env, &mut regs);
        assert_eq!(regs.rax as i64, errno(libc::ENOSYS));
    }

    #[test]
    fn fork_then_child_exit_wakes_waiting_parent() {
        let (mut sched, mut env) = setup();
        sched.current().vm.write_user(0x10000, &[0; 4]).unwrap();

        let mut regs = syscall_regs(SYS_FORK, [0; 6]);
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        let child_pid = regs.rax;
        assert_eq!(child_pid, 2);
        assert_eq!(sched.get(2).unwrap().regs.rax, 0);

        // parent waits; the frame switches to the child
        let mut regs = syscall_regs(SYS_WAIT4, [u64::MAX, 0x10000, 0, 0, 0, 0]);
        regs.rip = 0x401010;
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::Continue);
        assert_eq!(sched.current_pid(), 2);
        assert_eq!(regs.rax, 0);

        // child exits; parent is woken with the child pid and its own frame
        let mut child_frame = syscall_regs(SYS_EXIT_GROUP, [9, 0, 0, 0, 0, 0]);
        assert_eq!(call(&mut sched, &mut env, &mut child_frame), RunExit::Continue);
        assert_eq!(sched.current_pid(), 1);
        assert_eq!(child_frame.rax, 2); // wait4 return value
        assert_eq!(child_frame.rip, 0x401010);
        assert!(sched.get(2).is_none());

        // wstatus for exit code 9
        let wstatus: i32 = sched.current().vm.read_user_obj(0x10000).unwrap();
        assert_eq!(wstatus, 9 << 8);
    }

    #[test]
    fn fork_isolates_memory() {
        let (mut sched, mut env) = setup();
        sched.current().vm.write_user(0x10000, b"parent").unwrap();

        let mut regs = syscall_regs(SYS_FORK, [0; 6]);
        call(&mut sched, &mut env, &mut regs);

        sched.current().vm.write_user(0x10000, b"edited").unwrap();
        let mut buf = [0u8; 6];
        sched.get(2).unwrap().vm.read_user(0x10000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn last_exit_ends_run() {
        let (mut sched, mut env) = setup();
        let mut regs = syscall_regs(SYS_EXIT_GROUP, [0, 0, 0, 0, 0, 0]);
        assert_eq!(call(&mut sched, &mut env, &mut regs), RunExit::EndRun);
    }

    #[test]
    #[should_panic(expected = "deadlock")]
    fn wait4_with_no_child_deadlocks() {
        let (mut sched, mut env) = setup();
        let mut regs = syscall_regs(SYS_WAIT4, [u64::MAX, 0, 0, 0, 0, 0]);
        call(&mut sched, &mut env, &mut regs);
    }
}
