pub mod memory;

pub use memory::{align_down, align_up, is_aligned, GuestMemoryExt, PAGE_SHIFT, PAGE_SIZE};
