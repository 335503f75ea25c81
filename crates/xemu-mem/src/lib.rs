//! Guest virtual memory for a user-mode x86-64 process.
//!
//! An [`AddressSpace`] is a set of 4 KiB pages, each with its own permission
//! set and a backing frame. Frames carry a write version that the execution
//! core uses to tell whether a memoized decode is still valid: every
//! successful store bumps the version of each frame it touches before the
//! frame lock is released.
//!
//! Locking is two-level. Structural changes (`map`, `unmap`, `protect`) take
//! the page-table lock exclusively; data accesses share it and then lock only
//! the frames they touch, so loads from different pages never contend.

#![forbid(unsafe_code)]

mod error;
mod frame;
mod perm;
mod scalar;
mod space;

pub use error::{MemoryFault, VmmError};
pub use frame::SharedMemory;
pub use perm::{Access, Permissions};
pub use scalar::LeScalar;
pub use space::{
    AddressSpace, Backing, BackingKind, CodeStamp, FetchedCode, PageInfo, Region, VmmConfig,
};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[inline]
pub const fn page_floor(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Round `addr` up to the next page boundary, or `None` if that overflows.
#[inline]
pub const fn page_ceil(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & PAGE_MASK),
        None => None,
    }
}
