//! Guest processes: image materialization and per-process state.

use std::collections::BTreeMap;
use std::sync::Arc;

use loader::{ElfView, SegmentFlags};
use tracing::debug;
use utils::{align_down, align_up, PAGE_SIZE};

use crate::memory::{self, AddressSpace, MapFlags, PagePerms};
use crate::regs::kvm_regs;

pub type Pid = u32;

pub const STACK_TOP: u64 = 0x7fff_ffff_e000;
pub const STACK_SIZE: u64 = 0x20000;

// auxv keys the startup stack carries
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_ENTRY: u64 = 9;
const AT_RANDOM: u64 = 25;

// fixed AT_RANDOM seed: a run must replay bit-identically
const RANDOM_SEED: [u8; 16] = [
    0x3a, 0x1c, 0x95, 0xe2, 0x07, 0x6b, 0xd4, 0x58, 0xf1, 0x20, 0x8e, 0x49, 0xb3, 0x7d, 0xc6, 0x12,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Runnable,
    Waiting(WaitReason),
    Exited(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Parked in wait4 until a child matching `filter` exits.
    Child { filter: i64, status_ptr: u64 },
}

/// What the loader left behind for one process, echoed to the guest through
/// `VmInfo` and auxv.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessImage {
    pub entry: u64,
    pub brk: u64,
    pub stack_ptr: u64,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
    pub argc: u64,
    pub argv_off: u64,
    pub envp_off: u64,
}

pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub vm: AddressSpace,
    pub image: ProcessImage,
    pub brk: u64,
    pub state: ProcState,
    /// Register frame, preserved while the process is not running.
    pub regs: kvm_regs,
    pub children: Vec<Pid>,
    pub symbols: Option<Arc<ElfView>>,
}

impl Process {
    pub fn new(
        pid: Pid,
        vm: AddressSpace,
        image: ProcessImage,
        symbols: Option<Arc<ElfView>>,
    ) -> Process {
        let regs = kvm_regs {
            rip: image.entry,
            rsp: image.stack_ptr,
            rflags: 2,
            ..Default::default()
        };
        Process {
            pid,
            parent: None,
            vm,
            image,
            brk: image.brk,
            state: ProcState::Runnable,
            regs,
            children: Vec::new(),
            symbols,
        }
    }
}

fn segment_perms(flags: SegmentFlags) -> PagePerms {
    let mut perms = PagePerms::empty();
    if flags.contains(SegmentFlags::READ) {
        perms |= PagePerms::READ;
    }
    if flags.contains(SegmentFlags::WRITE) {
        perms |= PagePerms::WRITE;
    }
    if flags.contains(SegmentFlags::EXEC) {
        perms |= PagePerms::EXEC;
    }
    perms
}

/// Materialize a parsed ELF view into an address space: map every LOAD
/// segment rounded out to page boundaries, copy its file bytes, and build the
/// startup stack. The zero tail past `filesize` comes for free with fresh
/// frames.
pub fn load_image(
    vm: &mut AddressSpace,
    view: &ElfView,
    argv: &[String],
    envp: &[String],
) -> memory::Result<ProcessImage> {
    // adjacent segments may share a page; collect the union of permissions
    // per page before mapping
    let mut pages: BTreeMap<u64, PagePerms> = BTreeMap::new();
    for seg in view.segments().iter().filter(|s| s.is_load()) {
        if seg.memsize == 0 {
            continue;
        }
        let end = align_up(seg.vaddr + seg.memsize, PAGE_SIZE);
        let mut page = align_down(seg.vaddr, PAGE_SIZE);
        let perms = segment_perms(seg.flags);
        while page < end {
            *pages.entry(page).or_insert(PagePerms::empty()) |= perms;
            page += PAGE_SIZE;
        }
    }

    // map contiguous equal-permission runs in one go
    let mut run: Option<(u64, u64, PagePerms)> = None;
    let flush = |vm: &mut AddressSpace, run: Option<(u64, u64, PagePerms)>| {
        match run {
            Some((start, end, perms)) => vm.map_range(start, end - start, perms, MapFlags::empty()),
            None => Ok(()),
        }
    };
    for (&page, &perms) in &pages {
        run = match run {
            Some((start, end, run_perms)) if end == page && run_perms == perms => {
                Some((start, end + PAGE_SIZE, run_perms))
            }
            other => {
                flush(vm, other)?;
                Some((page, page + PAGE_SIZE, perms))
            }
        };
    }
    flush(vm, run)?;

    // copy file-backed bytes; host-privileged because text is mapped R-X
    for seg in view.segments().iter().filter(|s| s.is_load()) {
        if seg.filesize > 0 {
            vm.write_user_raw(seg.vaddr, view.segment_data(seg))?;
        }
    }

    vm.map_range(
        STACK_TOP - STACK_SIZE,
        STACK_SIZE,
        PagePerms::RW,
        MapFlags::empty(),
    )?;
    let stack = build_stack(vm, view, argv, envp)?;

    debug!(
        "loaded image: entry={:#x} brk={:#x} rsp={:#x}",
        view.entry(),
        view.initial_brk(),
        stack.sp,
    );

    Ok(ProcessImage {
        entry: view.entry(),
        brk: view.initial_brk(),
        stack_ptr: stack.sp,
        phdr: view.load_addr() + view.phinfo().offset,
        phent: view.phinfo().entsize,
        phnum: view.phinfo().count,
        argc: argv.len() as u64,
        argv_off: stack.argv,
        envp_off: stack.envp,
    })
}

struct StackLayout {
    sp: u64,
    argv: u64,
    envp: u64,
}

/// SysV startup stack: strings and the AT_RANDOM seed up top, then the
/// 16-byte-aligned block of argc, argv, envp and auxv the entry point pops.
fn build_stack(
    vm: &AddressSpace,
    view: &ElfView,
    argv: &[String],
    envp: &[String],
) -> memory::Result<StackLayout> {
    let mut sp = STACK_TOP;

    sp -= RANDOM_SEED.len() as u64;
    vm.write_user(sp, &RANDOM_SEED)?;
    let at_random = sp;

    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        let mut bytes = s.clone().into_bytes();
        bytes.push(0);
        sp -= bytes.len() as u64;
        vm.write_user(sp, &bytes)?;
        envp_ptrs.push(sp);
    }
    envp_ptrs.reverse();

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        let mut bytes = s.clone().into_bytes();
        bytes.push(0);
        sp -= bytes.len() as u64;
        vm.write_user(sp, &bytes)?;
        argv_ptrs.push(sp);
    }
    argv_ptrs.reverse();

    let auxv = [
        (AT_PHDR, view.load_addr() + view.phinfo().offset),
        (AT_PHENT, view.phinfo().entsize),
        (AT_PHNUM, view.phinfo().count),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, view.entry()),
        (AT_RANDOM, at_random),
        (AT_NULL, 0),
    ];

    sp = align_down(sp, 16);
    let words = 1 + (argv.len() + 1) + (envp.len() + 1) + auxv.len() * 2;
    if words % 2 == 1 {
        sp -= 8;
    }
    sp -= words as u64 * 8;

    let mut cur = sp;
    let push = |cur: &mut u64, value: u64| -> memory::Result<()> {
        vm.write_user_obj(*cur, value)?;
        *cur += 8;
        Ok(())
    };

    push(&mut cur, argv.len() as u64)?;
    let argv_base = cur;
    for ptr in &argv_ptrs {
        push(&mut cur, *ptr)?;
    }
    push(&mut cur, 0)?;
    let envp_base = cur;
    for ptr in &envp_ptrs {
        push(&mut cur, *ptr)?;
    }
    push(&mut cur, 0)?;
    for (key, value) in auxv {
        push(&mut cur, key)?;
        push(&mut cur, value)?;
    }

    Ok(StackLayout {
        sp,
        argv: argv_base,
        envp: envp_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FramePool;
    use vm_memory::{GuestAddress, GuestMemoryMmap};

    fn put(image: &mut Vec<u8>, off: usize, bytes: &[u8]) {
        if image.len() < off + bytes.len() {
            image.resize(off + bytes.len(), 0);
        }
        image[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn phdr(image: &mut Vec<u8>, idx: usize, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
        let off = 64 + idx * 56;
        put(image, off, &1u32.to_le_bytes()); // PT_LOAD
        put(image, off + 4, &flags.to_le_bytes());
        put(image, off + 8, &offset.to_le_bytes());
        put(image, off + 16, &vaddr.to_le_bytes());
        put(image, off + 24, &vaddr.to_le_bytes());
        put(image, off + 32, &filesz.to_le_bytes());
        put(image, off + 40, &memsz.to_le_bytes());
        put(image, off + 48, &0x1000u64.to_le_bytes());
    }

    /// Text at 0x400000 (R-X), data at 0x401000 with a BSS tail (RW), and a
    /// read-only blob on the same page as the data to exercise the per-page
    /// permission union.
    fn view() -> ElfView {
        let mut image = Vec::new();
        put(
            &mut image,
            0,
            &[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        );
        put(&mut image, 16, &2u16.to_le_bytes()); // ET_EXEC
        put(&mut image, 18, &62u16.to_le_bytes()); // EM_X86_64
        put(&mut image, 20, &1u32.to_le_bytes());
        put(&mut image, 24, &0x400000u64.to_le_bytes()); // entry
        put(&mut image, 32, &64u64.to_le_bytes()); // e_phoff
        put(&mut image, 52, &64u16.to_le_bytes());
        put(&mut image, 54, &56u16.to_le_bytes());
        put(&mut image, 56, &3u16.to_le_bytes()); // e_phnum

        phdr(&mut image, 0, 5, 0x100, 0x400000, 0x10, 0x10); // R-X
        phdr(&mut image, 1, 6, 0x110, 0x401000, 8, 0x1800); // RW-, BSS tail
        phdr(&mut image, 2, 4, 0x118, 0x401900, 4, 4); // R--, shares the page

        put(&mut image, 0x100, &[0xcc; 0x10]);
        put(&mut image, 0x110, b"datadata");
        put(&mut image, 0x118, b"blob");

        ElfView::parse(image).unwrap()
    }

    fn space() -> AddressSpace {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x800000)]).unwrap();
        let pool = FramePool::new(mem.clone(), 0x100000..0x800000).into_handle();
        AddressSpace::new(mem, pool).unwrap()
    }

    #[test]
    fn image_maps_segments_with_union_perms() {
        let mut vm = space();
        let view = view();
        let image = load_image(&mut vm, &view, &["prog".into()], &[]).unwrap();

        assert_eq!(image.entry, 0x400000);
        assert_eq!(image.brk, 0x403000);
        assert_eq!(vm.page_perms(0x400000), Some(PagePerms::RX));
        // data page carries the union of RW- and R--
        assert_eq!(vm.page_perms(0x401000), Some(PagePerms::RW));
        assert_eq!(vm.page_perms(0x402000), Some(PagePerms::RW));
        assert!(!vm.is_mapped(0x403000));

        let mut buf = [0u8; 8];
        vm.read_user(0x401000, &mut buf).unwrap();
        assert_eq!(&buf, b"datadata");
        let mut blob = [0u8; 4];
        vm.read_user(0x401900, &mut blob).unwrap();
        assert_eq!(&blob, b"blob");

        // BSS reads as zero
        let mut tail = [0xff_u8; 16];
        vm.read_user(0x402000, &mut tail).unwrap();
        assert_eq!(tail, [0; 16]);
    }

    #[test]
    fn stack_carries_argv_envp_auxv() {
        let mut vm = space();
        let view = view();
        let image = load_image(
            &mut vm,
            &view,
            &["prog".into(), "arg1".into()],
            &["KEY=value".into()],
        )
        .unwrap();

        let sp = image.stack_ptr;
        assert_eq!(sp % 16, 0);
        assert_eq!(vm.read_user_obj::<u64>(sp).unwrap(), 2); // argc

        let argv0: u64 = vm.read_user_obj(image.argv_off).unwrap();
        assert_eq!(vm.read_user_cstr(argv0, 64).unwrap(), b"prog");
        let argv1: u64 = vm.read_user_obj(image.argv_off + 8).unwrap();
        assert_eq!(vm.read_user_cstr(argv1, 64).unwrap(), b"arg1");
        assert_eq!(vm.read_user_obj::<u64>(image.argv_off + 16).unwrap(), 0);

        let envp0: u64 = vm.read_user_obj(image.envp_off).unwrap();
        assert_eq!(vm.read_user_cstr(envp0, 64).unwrap(), b"KEY=value");

        // auxv sits past the envp terminator
        let mut aux = image.envp_off + 2 * 8;
        let mut seen_entry = false;
        loop {
            let key: u64 = vm.read_user_obj(aux).unwrap();
            let value: u64 = vm.read_user_obj(aux + 8).unwrap();
            if key == AT_NULL {
                break;
            }
            if key == AT_ENTRY {
                assert_eq!(value, 0x400000);
                seen_entry = true;
            }
            if key == AT_RANDOM {
                let mut seed = [0u8; 16];
                vm.read_user(value, &mut seed).unwrap();
                assert_eq!(seed, RANDOM_SEED);
            }
            aux += 16;
        }
        assert!(seen_entry);
    }

    #[test]
    fn fresh_process_register_frame() {
        let mut vm = space();
        let view = view();
        let image = load_image(&mut vm, &view, &["prog".into()], &[]).unwrap();
        let proc = Process::new(1, vm, image, None);

        assert_eq!(proc.regs.rip, image.entry);
        assert_eq!(proc.regs.rsp, image.stack_ptr);
        assert_eq!(proc.regs.rflags, 2);
        assert_eq!(proc.state, ProcState::Runnable);
        assert_eq!(proc.brk, image.brk);
    }
}
