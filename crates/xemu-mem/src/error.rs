use crate::perm::Access;
use thiserror::Error;

/// Guest-visible memory fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("{access} of unmapped guest address {addr:#x}")]
    Unmapped { addr: u64, access: Access },
    #[error("{access} of guest address {addr:#x} denied by page permissions")]
    PermissionDenied { addr: u64, access: Access },
    #[error("misaligned {align}-byte access at guest address {addr:#x}")]
    Misaligned { addr: u64, align: u64 },
}

impl MemoryFault {
    /// First faulting guest address.
    pub fn addr(&self) -> u64 {
        match *self {
            MemoryFault::Unmapped { addr, .. }
            | MemoryFault::PermissionDenied { addr, .. }
            | MemoryFault::Misaligned { addr, .. } => addr,
        }
    }
}

/// Errors from structural address-space operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmmError {
    #[error("range {start:#x}..{end:#x} overlaps existing page {existing:#x}")]
    Overlap { start: u64, end: u64, existing: u64 },
    #[error("range {start:#x}..{end:#x} is not fully mapped (first hole at {hole:#x})")]
    NotMapped { start: u64, end: u64, hole: u64 },
    #[error("address {addr:#x} is not page aligned")]
    Unaligned { addr: u64 },
    #[error("invalid range length {len:#x} at {start:#x}")]
    InvalidLength { start: u64, len: u64 },
    #[error("no free {len:#x}-byte range in the mmap window")]
    OutOfAddressSpace { len: u64 },
    #[error(transparent)]
    Fault(#[from] MemoryFault),
}
