use vm_memory::{
    Address, ByteValued, GuestAddress, GuestMemoryBackend, GuestMemoryMmap, GuestMemoryRegion,
    MemoryRegionAddress, VolatileSlice,
};

pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Typed access to guest physical memory, bypassing the generic `Bytes`
/// plumbing in vm-memory. Accesses must not cross a region boundary; guest
/// RAM here is always a single contiguous region.
pub trait GuestMemoryExt {
    fn get_slice_fast(
        &self,
        addr: GuestAddress,
        len: usize,
    ) -> vm_memory::GuestMemoryResult<VolatileSlice>;

    fn read_obj_fast<T: ByteValued>(&self, addr: GuestAddress) -> vm_memory::GuestMemoryResult<T> {
        let vs = self.get_slice_fast(addr, std::mem::size_of::<T>())?;
        let ptr = vs.ptr_guard().as_ptr() as *const T;
        // deals with unaligned ptrs, so no need to check
        Ok(unsafe { std::ptr::read_unaligned(ptr) })
    }

    fn write_obj_fast<T: ByteValued>(
        &self,
        addr: GuestAddress,
        obj: T,
    ) -> vm_memory::GuestMemoryResult<()> {
        let vs = self.get_slice_fast(addr, std::mem::size_of::<T>())?;
        let ptr = vs.ptr_guard_mut().as_ptr() as *mut T;
        unsafe { std::ptr::write_unaligned(ptr, obj) };
        Ok(())
    }

    fn read_into(&self, addr: GuestAddress, buf: &mut [u8]) -> vm_memory::GuestMemoryResult<()> {
        let vs = self.get_slice_fast(addr, buf.len())?;
        vs.copy_to(buf);
        Ok(())
    }

    fn write_from(&self, addr: GuestAddress, buf: &[u8]) -> vm_memory::GuestMemoryResult<()> {
        let vs = self.get_slice_fast(addr, buf.len())?;
        vs.copy_from(buf);
        Ok(())
    }

    fn fill_zero(&self, addr: GuestAddress, len: usize) -> vm_memory::GuestMemoryResult<()> {
        let vs = self.get_slice_fast(addr, len)?;
        // write_volatile per byte is slow; memset through the raw pointer
        let ptr = vs.ptr_guard_mut().as_ptr();
        unsafe { std::ptr::write_bytes(ptr, 0, len) };
        Ok(())
    }
}

impl GuestMemoryExt for GuestMemoryMmap {
    fn get_slice_fast(
        &self,
        addr: GuestAddress,
        len: usize,
    ) -> vm_memory::GuestMemoryResult<VolatileSlice> {
        let region = self
            .find_region(addr)
            .ok_or(vm_memory::guest_memory::Error::InvalidGuestAddress(addr))?;
        // safe: can't get a region if addr < start_addr
        let offset = MemoryRegionAddress(addr.raw_value() - region.start_addr().raw_value());
        // this does bounds check
        region.get_slice(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_down(0x1fff, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x1000, PAGE_SIZE), 0x1000);
        assert!(is_aligned(0x3000, PAGE_SIZE));
        assert!(!is_aligned(0x3001, PAGE_SIZE));
    }

    #[test]
    fn obj_round_trip() {
        let mem = mem();
        mem.write_obj_fast(GuestAddress(0x123), 0xdead_beef_u64).unwrap();
        assert_eq!(mem.read_obj_fast::<u64>(GuestAddress(0x123)).unwrap(), 0xdead_beef);
    }

    #[test]
    fn slice_bounds() {
        let mem = mem();
        assert!(mem.get_slice_fast(GuestAddress(0xffff), 2).is_err());
        assert!(mem.get_slice_fast(GuestAddress(0x20000), 1).is_err());
    }

    #[test]
    fn zero_fill() {
        let mem = mem();
        mem.write_from(GuestAddress(0x400), &[0xab; 64]).unwrap();
        mem.fill_zero(GuestAddress(0x400), 64).unwrap();
        let mut buf = [0xff_u8; 64];
        mem.read_into(GuestAddress(0x400), &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);
    }
}
