use std::collections::HashMap;

use bitflags::bitflags;
use utils::{is_aligned, GuestMemoryExt, PAGE_SIZE};
use vm_memory::{GuestAddress, GuestMemoryMmap};

use super::{Error, FramePool, MapFlags, PagePerms, Result};

const ENTRY_COUNT: u64 = 512;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// x86-64 page table entry bits, plus the OS-available bits this
    /// hypervisor claims for itself.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// OS bit: frame is refcounted in the pool and survives `clone`
        /// without copying.
        const SHARED = 1 << 9;
        /// OS bit: mapped but inaccessible. PRESENT is clear so every touch
        /// traps, yet the entry stays nonzero to mark the page as in use.
        const PROT_NONE = 1 << 10;
        const NX = 1 << 63;
    }
}

fn encode_leaf(frame: u64, perms: PagePerms, flags: MapFlags) -> u64 {
    let mut bits = PteFlags::USER;
    if perms.is_empty() {
        bits |= PteFlags::PROT_NONE;
    } else {
        bits |= PteFlags::PRESENT;
    }
    if perms.contains(PagePerms::WRITE) {
        bits |= PteFlags::WRITABLE;
    }
    if !perms.contains(PagePerms::EXEC) {
        bits |= PteFlags::NX;
    }
    if flags.contains(MapFlags::SHARED) {
        bits |= PteFlags::SHARED;
    }
    frame | bits.bits()
}

fn leaf_perms(entry: u64) -> PagePerms {
    let bits = PteFlags::from_bits_truncate(entry);
    if bits.contains(PteFlags::PROT_NONE) {
        return PagePerms::empty();
    }
    let mut perms = PagePerms::READ;
    if bits.contains(PteFlags::WRITABLE) {
        perms |= PagePerms::WRITE;
    }
    if !bits.contains(PteFlags::NX) {
        perms |= PagePerms::EXEC;
    }
    perms
}

/// Four-level x86-64 page table, written into guest physical memory by the
/// host.
///
/// Intermediate tables are created on demand and freed when the last entry
/// under them goes away; the `entries` arena carries the per-table child
/// count the hardware format has no room for.
pub struct PageTable {
    mem: GuestMemoryMmap,
    root: u64,
    // present entries per table frame, root included
    entries: HashMap<u64, u16>,
}

impl PageTable {
    pub fn new(mem: GuestMemoryMmap, pool: &mut FramePool) -> Result<PageTable> {
        let root = pool.allocate()?;
        let mut entries = HashMap::new();
        entries.insert(root, 0);
        Ok(PageTable { mem, root, entries })
    }

    /// Physical address of the PML4, for CR3.
    pub fn root(&self) -> u64 {
        self.root
    }

    /// PML4/PDPT/PD/PT indices of a virtual address: 9 bits per level,
    /// starting at bit 39.
    fn indices(vaddr: u64) -> [u64; 4] {
        [
            (vaddr >> 39) & 0x1ff,
            (vaddr >> 30) & 0x1ff,
            (vaddr >> 21) & 0x1ff,
            (vaddr >> 12) & 0x1ff,
        ]
    }

    fn read_entry(&self, table: u64, idx: u64) -> u64 {
        self.mem
            .read_obj_fast(GuestAddress(table + idx * 8))
            .expect("page table frame outside guest memory")
    }

    fn write_entry(&mut self, table: u64, idx: u64, value: u64) {
        self.mem
            .write_obj_fast(GuestAddress(table + idx * 8), value)
            .expect("page table frame outside guest memory")
    }

    fn bump(&mut self, table: u64, delta: i16) -> u16 {
        let count = self
            .entries
            .get_mut(&table)
            .expect("page table arena out of sync");
        *count = count
            .checked_add_signed(delta)
            .expect("page table arena out of sync");
        *count
    }

    /// Map one page. Fails with `AlreadyMapped` unless `MapFlags::DISCARD`
    /// is set, in which case the previous mapping is replaced and its frame
    /// released.
    pub fn map_page(
        &mut self,
        pool: &mut FramePool,
        vaddr: u64,
        frame: u64,
        perms: PagePerms,
        flags: MapFlags,
    ) -> Result<()> {
        debug_assert!(is_aligned(vaddr, PAGE_SIZE) && is_aligned(frame, PAGE_SIZE));

        let idx = Self::indices(vaddr);
        let mut table = self.root;
        // tables created by this call, innermost last; unwound on failure
        let mut created: Vec<(u64, u64, u64)> = Vec::new();
        for level in 0..3 {
            let entry = self.read_entry(table, idx[level]);
            table = if entry & PteFlags::PRESENT.bits() != 0 {
                entry & ADDR_MASK
            } else {
                let new_table = match pool.allocate() {
                    Ok(frame) => frame,
                    Err(err) => {
                        self.unwind_created(pool, &created);
                        return Err(err);
                    }
                };
                let bits = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
                self.write_entry(table, idx[level], new_table | bits.bits());
                self.bump(table, 1);
                self.entries.insert(new_table, 0);
                created.push((table, idx[level], new_table));
                new_table
            };
        }

        let leaf = self.read_entry(table, idx[3]);
        if leaf != 0 {
            if !flags.contains(MapFlags::DISCARD) {
                // nothing was created along an already-populated path
                return Err(Error::AlreadyMapped);
            }
            pool.free(leaf & ADDR_MASK);
            self.write_entry(table, idx[3], encode_leaf(frame, perms, flags));
        } else {
            self.write_entry(table, idx[3], encode_leaf(frame, perms, flags));
            self.bump(table, 1);
        }
        Ok(())
    }

    fn unwind_created(&mut self, pool: &mut FramePool, created: &[(u64, u64, u64)]) {
        for &(parent, pidx, table) in created.iter().rev() {
            if self.entries[&table] != 0 {
                break;
            }
            self.entries.remove(&table);
            self.write_entry(parent, pidx, 0);
            self.bump(parent, -1);
            pool.free(table);
        }
    }

    /// Unmap one page, releasing its frame and any intermediate tables left
    /// empty.
    pub fn unmap_page(&mut self, pool: &mut FramePool, vaddr: u64) -> Result<()> {
        debug_assert!(is_aligned(vaddr, PAGE_SIZE));

        let idx = Self::indices(vaddr);
        let mut table = self.root;
        let mut path = [(0u64, 0u64); 3];
        for level in 0..3 {
            path[level] = (table, idx[level]);
            let entry = self.read_entry(table, idx[level]);
            if entry & PteFlags::PRESENT.bits() == 0 {
                return Err(Error::NotMapped);
            }
            table = entry & ADDR_MASK;
        }
        let leaf = self.read_entry(table, idx[3]);
        if leaf == 0 {
            return Err(Error::NotMapped);
        }

        pool.free(leaf & ADDR_MASK);
        self.write_entry(table, idx[3], 0);
        let mut count = self.bump(table, -1);
        let mut child = table;
        // release empty intermediates bottom-up; the root always stays
        for &(parent, pidx) in path.iter().rev() {
            if count != 0 {
                break;
            }
            self.entries.remove(&child);
            pool.free(child);
            self.write_entry(parent, pidx, 0);
            count = self.bump(parent, -1);
            child = parent;
        }
        Ok(())
    }

    /// Change the permissions of one mapped page in place.
    pub fn set_page_perms(&mut self, vaddr: u64, perms: PagePerms) -> Result<()> {
        debug_assert!(is_aligned(vaddr, PAGE_SIZE));

        let idx = Self::indices(vaddr);
        let mut table = self.root;
        for level in 0..3 {
            let entry = self.read_entry(table, idx[level]);
            if entry & PteFlags::PRESENT.bits() == 0 {
                return Err(Error::NotMapped);
            }
            table = entry & ADDR_MASK;
        }
        let leaf = self.read_entry(table, idx[3]);
        if leaf == 0 {
            return Err(Error::NotMapped);
        }
        let shared = if leaf & PteFlags::SHARED.bits() != 0 {
            MapFlags::SHARED
        } else {
            MapFlags::empty()
        };
        self.write_entry(table, idx[3], encode_leaf(leaf & ADDR_MASK, perms, shared));
        Ok(())
    }

    /// Look up the frame and permissions backing a page, if any.
    pub fn translate(&self, vaddr: u64) -> Option<(u64, PagePerms)> {
        let idx = Self::indices(vaddr);
        let mut table = self.root;
        for level in 0..3 {
            let entry = self.read_entry(table, idx[level]);
            if entry & PteFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = entry & ADDR_MASK;
        }
        let leaf = self.read_entry(table, idx[3]);
        if leaf == 0 {
            return None;
        }
        Some((leaf & ADDR_MASK, leaf_perms(leaf)))
    }

    pub fn is_mapped(&self, vaddr: u64) -> bool {
        self.translate(vaddr).is_some()
    }

    /// Deep-copy the tree. Shared leaves gain an owner in the pool; private
    /// leaves are copied eagerly into fresh frames.
    pub fn clone_tree(&self, pool: &mut FramePool) -> Result<PageTable> {
        let mut new = PageTable::new(self.mem.clone(), pool)?;
        let new_root = new.root;
        if let Err(err) = self.copy_level(pool, &mut new, self.root, new_root, 3) {
            new.release(pool);
            return Err(err);
        }
        Ok(new)
    }

    fn copy_level(
        &self,
        pool: &mut FramePool,
        new: &mut PageTable,
        src: u64,
        dst: u64,
        level: u8,
    ) -> Result<()> {
        for i in 0..ENTRY_COUNT {
            let entry = self.read_entry(src, i);
            if entry == 0 {
                continue;
            }
            if level == 0 {
                let copied = if entry & PteFlags::SHARED.bits() != 0 {
                    pool.ref_frame(entry & ADDR_MASK);
                    entry
                } else {
                    let frame = pool.allocate()?;
                    let mut buf = [0u8; PAGE_SIZE as usize];
                    self.mem
                        .read_into(GuestAddress(entry & ADDR_MASK), &mut buf)
                        .expect("page frame outside guest memory");
                    self.mem
                        .write_from(GuestAddress(frame), &buf)
                        .expect("page frame outside guest memory");
                    (entry & !ADDR_MASK) | frame
                };
                new.write_entry(dst, i, copied);
                new.bump(dst, 1);
            } else {
                let table = pool.allocate()?;
                new.entries.insert(table, 0);
                new.write_entry(dst, i, (entry & !ADDR_MASK) | table);
                new.bump(dst, 1);
                self.copy_level(pool, new, entry & ADDR_MASK, table, level - 1)?;
            }
        }
        Ok(())
    }

    /// Tear the whole tree down, returning every frame to the pool.
    pub fn release(self, pool: &mut FramePool) {
        self.release_level(pool, self.root, 3);
    }

    fn release_level(&self, pool: &mut FramePool, table: u64, level: u8) {
        for i in 0..ENTRY_COUNT {
            let entry = self.read_entry(table, i);
            if entry == 0 {
                continue;
            }
            if level == 0 {
                pool.free(entry & ADDR_MASK);
            } else {
                self.release_level(pool, entry & ADDR_MASK, level - 1);
            }
        }
        pool.free(table);
    }
}
