use utils::{align_down, is_aligned, GuestMemoryExt, PAGE_SIZE};
use vm_memory::{ByteValued, GuestAddress, GuestMemoryMmap};

use super::page_table::PageTable;
use super::regions::RegionManager;
use super::{Error, FramePoolHandle, MapFlags, PagePerms, Result};

/// Default user window. The floor leaves the zero page and friends unmapped;
/// the ceiling stays clear of the non-canonical hole.
pub const USER_START: u64 = 0x10000;
pub const USER_END: u64 = 0x7fff_ffff_f000;

enum Access {
    Read,
    Write,
    /// Host-privileged: requires the page mapped but ignores its permissions.
    Raw,
}

/// One guest process's view of memory: the hardware page table it runs on
/// plus the region bookkeeping for its user window.
///
/// Every operation either moves both structures to the new state or restores
/// both, with one documented exception: `map_range` failing `AlreadyMapped`
/// partway leaves the requested range reserved in the region manager, which
/// is the contract `mmap` callers expect.
pub struct AddressSpace {
    mem: GuestMemoryMmap,
    pool: FramePoolHandle,
    page_table: PageTable,
    user_mappings: RegionManager,
}

impl AddressSpace {
    pub fn new(mem: GuestMemoryMmap, pool: FramePoolHandle) -> Result<AddressSpace> {
        let page_table = PageTable::new(mem.clone(), &mut pool.lock().unwrap())?;
        Ok(AddressSpace {
            mem,
            pool,
            page_table,
            user_mappings: RegionManager::new(USER_START, USER_END),
        })
    }

    /// Physical address of the page-table root, for CR3.
    pub fn page_table_root(&self) -> u64 {
        self.page_table.root()
    }

    pub fn is_mapped(&self, vaddr: u64) -> bool {
        self.page_table.is_mapped(align_down(vaddr, PAGE_SIZE))
    }

    pub fn page_perms(&self, vaddr: u64) -> Option<PagePerms> {
        self.page_table
            .translate(align_down(vaddr, PAGE_SIZE))
            .map(|(_, perms)| perms)
    }

    fn check_range(&self, addr: u64, length: u64) -> Result<u64> {
        let end = addr.checked_add(length).ok_or(Error::NotUserRange)?;
        if length == 0
            || !is_aligned(addr, PAGE_SIZE)
            || !is_aligned(length, PAGE_SIZE)
            || !self.user_mappings.contains(addr, end)
        {
            return Err(Error::NotUserRange);
        }
        Ok(end)
    }

    /// Map `[addr, addr + length)` with fresh zeroed frames.
    pub fn map_range(
        &mut self,
        addr: u64,
        length: u64,
        perms: PagePerms,
        flags: MapFlags,
    ) -> Result<()> {
        let end = self.check_range(addr, length)?;
        self.user_mappings.set_mapped(addr, end)?;

        let mut pool = self.pool.lock().unwrap();
        let mut page = addr;
        let failure = loop {
            if page == end {
                break None;
            }
            let frame = match pool.allocate() {
                Ok(frame) => frame,
                Err(err) => break Some(err),
            };
            match self.page_table.map_page(&mut pool, page, frame, perms, flags) {
                Ok(()) => page += PAGE_SIZE,
                Err(err) => {
                    pool.free(frame);
                    if err == Error::AlreadyMapped {
                        // the range stays reserved and the prefix stays
                        // mapped; the caller decides what to do with it
                        return Err(err);
                    }
                    break Some(err);
                }
            }
        };

        if let Some(err) = failure {
            while page > addr {
                page -= PAGE_SIZE;
                self.page_table
                    .unmap_page(&mut pool, page)
                    .expect("rollback of freshly mapped page failed");
            }
            drop(pool);
            self.user_mappings.set_not_mapped(addr, end);
            return Err(err);
        }
        Ok(())
    }

    /// Map `length` bytes at the lowest free spot in the user window.
    pub fn map_range_anywhere(
        &mut self,
        length: u64,
        perms: PagePerms,
        flags: MapFlags,
    ) -> Result<u64> {
        if length == 0 || !is_aligned(length, PAGE_SIZE) {
            return Err(Error::NotUserRange);
        }
        let addr = self
            .user_mappings
            .find_not_mapped(length)
            .ok_or(Error::OutOfMemory)?;
        match self.map_range(addr, length, perms, flags) {
            Err(err @ (Error::AlreadyMapped | Error::NotUserRange)) => {
                panic!("region manager handed out unusable range {addr:#x}: {err}")
            }
            other => other.map(|()| addr),
        }
    }

    /// Unmap `[addr, addr + length)`. Pages already unmapped are skipped and
    /// reported with `NotMapped` after the rest of the range is done.
    pub fn unmap_range(&mut self, addr: u64, length: u64) -> Result<()> {
        let end = self.check_range(addr, length)?;
        self.user_mappings.set_not_mapped(addr, end);

        let mut pool = self.pool.lock().unwrap();
        let mut missing = false;
        let mut page = addr;
        while page < end {
            match self.page_table.unmap_page(&mut pool, page) {
                Ok(()) => {}
                Err(Error::NotMapped) => missing = true,
                Err(err) => unreachable!("unexpected unmap failure: {err}"),
            }
            page += PAGE_SIZE;
        }
        if missing {
            Err(Error::NotMapped)
        } else {
            Ok(())
        }
    }

    /// Change permissions page by page, surfacing the first failure.
    pub fn set_range_perms(&mut self, addr: u64, length: u64, perms: PagePerms) -> Result<()> {
        let end = self.check_range(addr, length)?;
        let mut page = addr;
        while page < end {
            self.page_table.set_page_perms(page, perms)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Fork the address space: deep-copied page table and region bookkeeping,
    /// shared frames refcounted, private frames copied.
    pub fn fork(&self) -> Result<AddressSpace> {
        let page_table = self.page_table.clone_tree(&mut self.pool.lock().unwrap())?;
        Ok(AddressSpace {
            mem: self.mem.clone(),
            pool: self.pool.clone(),
            page_table,
            user_mappings: self.user_mappings.clone(),
        })
    }

    /// Return every frame owned by this address space to the pool.
    pub fn release(self) {
        let pool = self.pool.clone();
        self.page_table.release(&mut pool.lock().unwrap());
    }

    // === checked user-pointer access ===

    fn phys_chunks(&self, addr: u64, len: usize, access: Access) -> Result<Vec<(u64, usize)>> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(Error::BadAddress(addr))?;
        let (user_start, user_end) = self.user_mappings.window();
        if addr < user_start || end > user_end {
            return Err(Error::BadAddress(addr));
        }

        let mut chunks = Vec::new();
        let mut cur = addr;
        while cur < end {
            let page = align_down(cur, PAGE_SIZE);
            let (frame, perms) = self
                .page_table
                .translate(page)
                .ok_or(Error::BadAddress(cur))?;
            let allowed = match access {
                Access::Read => perms.contains(PagePerms::READ),
                Access::Write => perms.contains(PagePerms::WRITE),
                Access::Raw => true,
            };
            if !allowed {
                return Err(Error::BadAddress(cur));
            }
            let offset = cur - page;
            let take = (PAGE_SIZE - offset).min(end - cur);
            chunks.push((frame + offset, take as usize));
            cur += take;
        }
        Ok(chunks)
    }

    pub fn read_user(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        for (phys, len) in self.phys_chunks(addr, buf.len(), Access::Read)? {
            self.mem
                .read_into(GuestAddress(phys), &mut buf[done..done + len])
                .expect("mapped frame outside guest memory");
            done += len;
        }
        Ok(())
    }

    pub fn write_user(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.write_chunks(addr, buf, Access::Write)
    }

    /// Host-privileged write: ignores page permissions, still requires the
    /// pages mapped. Used to materialize read-only image segments.
    pub fn write_user_raw(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.write_chunks(addr, buf, Access::Raw)
    }

    fn write_chunks(&self, addr: u64, buf: &[u8], access: Access) -> Result<()> {
        let mut done = 0;
        for (phys, len) in self.phys_chunks(addr, buf.len(), access)? {
            self.mem
                .write_from(GuestAddress(phys), &buf[done..done + len])
                .expect("mapped frame outside guest memory");
            done += len;
        }
        Ok(())
    }

    pub fn read_user_obj<T: ByteValued + Default>(&self, addr: u64) -> Result<T> {
        let mut obj = T::default();
        self.read_user(addr, obj.as_mut_slice())?;
        Ok(obj)
    }

    pub fn write_user_obj<T: ByteValued>(&self, addr: u64, obj: T) -> Result<()> {
        self.write_user(addr, obj.as_slice())
    }

    /// Read a NUL-terminated string, truncated at `max` bytes.
    pub fn read_user_cstr(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut cur = addr;
        while out.len() < max {
            let page_end = align_down(cur, PAGE_SIZE) + PAGE_SIZE;
            let take = ((page_end - cur) as usize).min(max - out.len());
            let mut buf = vec![0u8; take];
            self.read_user(cur, &mut buf)?;
            if let Some(nul) = buf.iter().position(|&b| b == 0) {
                out.extend_from_slice(&buf[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&buf);
            cur += take as u64;
        }
        Ok(out)
    }
}
