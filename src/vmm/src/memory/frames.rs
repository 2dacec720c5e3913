use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use utils::{is_aligned, GuestMemoryExt, PAGE_SIZE};
use vm_memory::{GuestAddress, GuestMemoryMmap};

use super::{Error, Result};

pub type FramePoolHandle = Arc<Mutex<FramePool>>;

/// Allocator for 4 KiB guest physical frames.
///
/// A frame is owned by the pool until allocated, then by exactly one
/// page-table entry unless it was explicitly shared, in which case the pool
/// tracks the owner count and releases the frame when the last one unmaps.
pub struct FramePool {
    mem: GuestMemoryMmap,
    next: u64,
    end: u64,
    free: Vec<u64>,
    // owner count per shared frame; absent means one owner
    refs: HashMap<u64, u32>,
}

impl FramePool {
    pub fn new(mem: GuestMemoryMmap, range: Range<u64>) -> FramePool {
        assert!(is_aligned(range.start, PAGE_SIZE) && is_aligned(range.end, PAGE_SIZE));
        FramePool {
            mem,
            next: range.start,
            end: range.end,
            free: Vec::new(),
            refs: HashMap::new(),
        }
    }

    pub fn into_handle(self) -> FramePoolHandle {
        Arc::new(Mutex::new(self))
    }

    /// Hand out one zeroed frame.
    pub fn allocate(&mut self) -> Result<u64> {
        let frame = match self.free.pop() {
            Some(frame) => frame,
            None if self.next < self.end => {
                let frame = self.next;
                self.next += PAGE_SIZE;
                frame
            }
            None => return Err(Error::OutOfMemory),
        };
        self.mem
            .fill_zero(GuestAddress(frame), PAGE_SIZE as usize)
            .expect("frame pool range outside guest memory");
        Ok(frame)
    }

    /// Add an owner to a shared frame.
    pub fn ref_frame(&mut self, frame: u64) {
        *self.refs.entry(frame).or_insert(1) += 1;
    }

    /// Drop one owner; the frame returns to the pool when the last owner is
    /// gone.
    pub fn free(&mut self, frame: u64) {
        if let Some(count) = self.refs.get_mut(&frame) {
            if *count > 1 {
                *count -= 1;
                return;
            }
            self.refs.remove(&frame);
        }
        self.free.push(frame);
    }

    pub fn frames_left(&self) -> usize {
        self.free.len() + ((self.end - self.next) / PAGE_SIZE) as usize
    }
}
