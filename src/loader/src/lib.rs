//! Host-side ELF parsing.
//!
//! [`ElfView`] parses a binary exactly once and hands the rest of the
//! hypervisor a flat view of its segments, sections and symbols. The view is
//! immutable after construction except for [`ElfView::set_base`], which
//! relocates every absolute address by a single delta so position-independent
//! binaries can be placed anywhere in the guest with one call.

mod view;

pub use view::{ElfType, ElfView, Error, PhInfo, Section, Segment, SegmentFlags, Symbol};
