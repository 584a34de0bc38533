use thiserror::Error;

use crate::layout::Region;
use crate::{ChunkId, SpaceId};

/// The kind of access that produced a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No chunk covers the address, or the page is reserved but not committed.
    Unmapped,
    /// The covering chunk does not grant the requested access.
    ProtectionViolation,
    /// A typed access was not naturally aligned.
    Unaligned,
}

/// A guest memory access that could not be satisfied.
///
/// Faults are recoverable: the dispatch bridge turns them into guest error codes and the debug
/// surface reports them to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind:?} fault on {access:?} at {addr:#010x}")]
pub struct MemFault {
    pub kind: FaultKind,
    pub addr: u64,
    pub access: AccessType,
}

impl MemFault {
    pub fn unmapped(addr: u64, access: AccessType) -> Self {
        Self {
            kind: FaultKind::Unmapped,
            addr,
            access,
        }
    }

    pub fn protection(addr: u64, access: AccessType) -> Self {
        Self {
            kind: FaultKind::ProtectionViolation,
            addr,
            access,
        }
    }

    pub fn unaligned(addr: u64, access: AccessType) -> Self {
        Self {
            kind: FaultKind::Unaligned,
            addr,
            access,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemError>;

/// Errors from address-space management operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("no free {size:#x}-byte range in the {region:?} region")]
    OutOfAddressSpace { region: Region, size: u64 },

    #[error("cannot back {requested:#x} more bytes ({available:#x} of the commit budget left)")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("unknown chunk {0:?}")]
    InvalidChunk(ChunkId),

    #[error("unknown address space {0:?}")]
    InvalidSpace(SpaceId),

    #[error("range {offset:#x}+{size:#x} is outside chunk {chunk:?} (reserved {reserved:#x})")]
    OutOfRange {
        chunk: ChunkId,
        offset: u64,
        size: u64,
        reserved: u64,
    },

    #[error("invalid size {0:#x}")]
    InvalidSize(u64),

    #[error("invalid alignment {0:#x}")]
    InvalidAlignment(u64),

    #[error("chunk {0:?} is process-local and cannot be attached to another address space")]
    NotGlobal(ChunkId),

    #[error("chunk {chunk:?} is already mapped in {space:?}")]
    AlreadyAttached { chunk: ChunkId, space: SpaceId },

    /// Two chunks claim the same virtual range. Address spaces are only ever built through the
    /// manager, so this means the manager's own bookkeeping is broken.
    #[error(
        "invariant violation: chunk {chunk:?} [{base:#x}, {end:#x}) overlaps chunk {other:?} in {space:?}"
    )]
    Overlap {
        chunk: ChunkId,
        other: ChunkId,
        space: SpaceId,
        base: u64,
        end: u64,
    },

    #[error(transparent)]
    Fault(#[from] MemFault),
}

impl MemError {
    /// Whether the error is a contract breach that must stop the running instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MemError::Overlap { .. })
    }
}
