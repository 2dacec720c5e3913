// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! The KVM container glue: one VM, one vCPU, run to completion.
//!
//! The run loop's only job is turning `IoOut` exits on the two bridge ports
//! into dispatch calls and keeping CR3 in step with whichever process the
//! scheduler selected. Everything interesting happens in `hyper` and
//! `syscall`.

use std::sync::Arc;

use anyhow::Context;
use guest_abi::{HYPERCALL_PORT, SYSCALL_PORT};
use kvm_bindings::{kvm_segment, kvm_userspace_memory_region};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use loader::{ElfType, ElfView};
use tracing::debug;
use utils::GuestMemoryExt;
use vm_memory::{GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::config::VmConfig;
use crate::files::FileTable;
use crate::hyper::{handle_hypercall, HostEnv, RunExit};
use crate::memory::{AddressSpace, FramePool};
use crate::process::{load_image, Process};
use crate::sched::Scheduler;
use crate::syscall::handle_syscall;

/// Low guest-physical memory reserved for boot structures (GDT); the frame
/// pool starts above it.
const BOOT_AREA_SIZE: u64 = 0x10000;
const BOOT_GDT_OFFSET: u64 = 0x500;

/// Where position-independent binaries get rebased.
const DYN_BASE: u64 = 0x0000_5555_5555_0000;

const X86_CR0_PE: u64 = 0x1;
const X86_CR0_MP: u64 = 0x2;
const X86_CR0_ET: u64 = 0x10;
const X86_CR0_NE: u64 = 0x20;
const X86_CR0_WP: u64 = 0x1_0000;
const X86_CR0_AM: u64 = 0x4_0000;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;
const EFER_NXE: u64 = 0x800;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot run the vCPU: {0}")]
    VcpuRun(kvm_ioctls::Error),
    #[error("cannot access vCPU state: {0}")]
    VcpuState(kvm_ioctls::Error),
    #[error("unexpected KVM exit: {0}")]
    UnhandledExit(String),
}

/// Constructor for a conventional segment GDT entry, from the kernel's
/// segment.h encoding.
fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((u64::from(base) & 0xff00_0000u64) << (56 - 24))
        | ((u64::from(flags) & 0x0000_f0ffu64) << 40)
        | ((u64::from(limit) & 0x000f_0000u64) << (48 - 16))
        | ((u64::from(base) & 0x00ff_ffffu64) << 16)
        | (u64::from(limit) & 0x0000_ffffu64)
}

fn flat_segment(selector: u16, type_: u8, l: u8, db: u8) -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xfffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db,
        s: 1,
        l,
        g: 1,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// One complete run: a VM, its single vCPU, and the host-side state the
/// bridges act on.
pub struct VmRunner {
    // field order matters for teardown: vCPU before its VM
    vcpu: VcpuFd,
    _vm: VmFd,
    mem: GuestMemoryMmap,
    sched: Scheduler,
    env: HostEnv,
    cr3: u64,
}

impl VmRunner {
    pub fn from_config(cfg: &VmConfig) -> anyhow::Result<VmRunner> {
        let kvm = Kvm::new().context("opening /dev/kvm")?;
        let mem_size = cfg.mem_size();
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), mem_size)])
            .context("configuring guest memory")?;

        let vm = kvm.create_vm().context("creating VM")?;
        let host_addr = mem
            .get_host_address(GuestAddress(0))
            .context("resolving guest memory host address")?;
        // SAFETY: the region covers exactly the mmap we just created and
        // stays alive for as long as the VM does.
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: 0,
                memory_size: mem_size as u64,
                userspace_addr: host_addr as u64,
                flags: 0,
            })
        }
        .context("registering guest memory")?;

        let mut view = ElfView::open(&cfg.binary).context("loading target binary")?;
        match view.elf_type() {
            ElfType::Dyn => view.set_base(DYN_BASE),
            ElfType::Exec => view.set_base(0),
        }

        let pool = FramePool::new(mem.clone(), BOOT_AREA_SIZE..mem_size as u64).into_handle();
        let mut aspace = AddressSpace::new(mem.clone(), pool)?;
        let image = load_image(&mut aspace, &view, &cfg.argv(), &cfg.env)?;
        let init = Process::new(1, aspace, image, Some(Arc::new(view)));

        let files = FileTable::load(&cfg.files)?;
        let vcpu = vm.create_vcpu(0).context("creating vCPU")?;

        Ok(VmRunner {
            vcpu,
            _vm: vm,
            mem,
            sched: Scheduler::new(init),
            env: HostEnv::new(0, mem_size as u64, files),
            cr3: 0,
        })
    }

    /// Everything the guest printed so far.
    pub fn output(&self) -> &[u8] {
        &self.env.output
    }

    /// Run the vCPU until the guest ends the run, faults, or the container
    /// reports something we cannot handle.
    pub fn run(&mut self) -> Result<RunExit, Error> {
        self.setup_vcpu()?;
        loop {
            match self.vcpu.run().map_err(Error::VcpuRun)? {
                VcpuExit::IoOut(port, _) if port == HYPERCALL_PORT => {
                    if let Some(exit) = self.bridge(false)? {
                        return Ok(exit);
                    }
                }
                VcpuExit::IoOut(port, _) if port == SYSCALL_PORT => {
                    if let Some(exit) = self.bridge(true)? {
                        return Ok(exit);
                    }
                }
                VcpuExit::Hlt => return Ok(RunExit::EndRun),
                other => return Err(Error::UnhandledExit(format!("{other:?}"))),
            }
        }
    }

    fn bridge(&mut self, syscall: bool) -> Result<Option<RunExit>, Error> {
        let mut regs = self.vcpu.get_regs().map_err(Error::VcpuState)?;
        let exit = if syscall {
            handle_syscall(&mut self.sched, &mut self.env, &mut regs)
        } else {
            handle_hypercall(&mut self.sched, &mut self.env, &mut regs)
        };
        match exit {
            RunExit::Continue => {
                self.vcpu.set_regs(&regs).map_err(Error::VcpuState)?;
                self.switch_address_space()?;
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    /// Keep CR3 in step with the scheduler's choice of process.
    fn switch_address_space(&mut self) -> Result<(), Error> {
        let root = self.sched.current().vm.page_table_root();
        if root != self.cr3 {
            let mut sregs = self.vcpu.get_sregs().map_err(Error::VcpuState)?;
            sregs.cr3 = root;
            self.vcpu.set_sregs(&sregs).map_err(Error::VcpuState)?;
            self.cr3 = root;
        }
        Ok(())
    }

    /// Put the vCPU straight into 64-bit paged mode on the init process's
    /// page table.
    fn setup_vcpu(&mut self) -> Result<(), Error> {
        let gdt = [
            0,
            gdt_entry(0xa09b, 0, 0xfffff), // code: execute/read, 64-bit
            gdt_entry(0xc093, 0, 0xfffff), // data: read/write
        ];
        for (i, entry) in gdt.iter().enumerate() {
            self.mem
                .write_obj_fast(GuestAddress(BOOT_GDT_OFFSET + i as u64 * 8), *entry)
                .expect("boot area outside guest memory");
        }

        let code = flat_segment(8, 0xb, 1, 0);
        let data = flat_segment(16, 0x3, 0, 1);

        let mut sregs = self.vcpu.get_sregs().map_err(Error::VcpuState)?;
        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = (gdt.len() * 8 - 1) as u16;
        sregs.cs = code;
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;

        self.cr3 = self.sched.current().vm.page_table_root();
        sregs.cr3 = self.cr3;
        sregs.cr4 = X86_CR4_PAE;
        sregs.cr0 = X86_CR0_PE
            | X86_CR0_MP
            | X86_CR0_ET
            | X86_CR0_NE
            | X86_CR0_WP
            | X86_CR0_AM
            | X86_CR0_PG;
        sregs.efer = EFER_LME | EFER_LMA | EFER_NXE;
        self.vcpu.set_sregs(&sregs).map_err(Error::VcpuState)?;

        let regs = self.sched.current().regs;
        debug!("starting vCPU at rip={:#x} rsp={:#x}", regs.rip, regs.rsp);
        self.vcpu.set_regs(&regs).map_err(Error::VcpuState)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdt_entry_encodes_long_mode_code() {
        let entry = gdt_entry(0xa09b, 0, 0xfffff);
        // L bit (53) set, DB (54) clear, present (47) set
        assert_ne!(entry & (1 << 53), 0);
        assert_eq!(entry & (1 << 54), 0);
        assert_ne!(entry & (1 << 47), 0);
    }
}
