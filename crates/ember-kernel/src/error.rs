use ember_hal::HalError;
use ember_mem::{MemError, MemFault};
use thiserror::Error;

use crate::handle::Handle;
use crate::object::{ObjectId, ObjectKind};

/// Guest-visible status codes written into the result register.
pub mod codes {
    pub const KERR_NONE: i32 = 0;
    pub const KERR_NOT_FOUND: i32 = -1;
    pub const KERR_GENERAL: i32 = -2;
    pub const KERR_CANCEL: i32 = -3;
    pub const KERR_NO_MEMORY: i32 = -4;
    pub const KERR_NOT_SUPPORTED: i32 = -5;
    pub const KERR_ARGUMENT: i32 = -6;
    pub const KERR_BAD_HANDLE: i32 = -8;
    pub const KERR_OVERFLOW: i32 = -9;
    pub const KERR_ALREADY_EXISTS: i32 = -11;
    pub const KERR_DIED: i32 = -13;
    pub const KERR_IN_USE: i32 = -14;
    pub const KERR_ACCESS_DENIED: i32 = -21;
    pub const KERR_BAD_DESCRIPTOR: i32 = -38;

    /// Written into a request status word while the request is outstanding.
    pub const KREQUEST_PENDING: i32 = 0x8000_0001_u32 as i32;
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    #[error("handle {handle} refers to a {actual:?}, expected {expected:?}")]
    WrongKind {
        handle: Handle,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    #[error("unknown kernel object {0:?}")]
    NoSuchObject(ObjectId),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("no {kind:?} named {name:?}")]
    NameNotFound { kind: ObjectKind, name: String },

    #[error("a global {kind:?} named {name:?} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("operation not permitted: {0}")]
    AccessDenied(&'static str),

    #[error("object is in use: {0}")]
    InUse(&'static str),

    #[error("buffer too small: {0}")]
    Overflow(&'static str),

    #[error("peer is gone: {0}")]
    Died(&'static str),

    #[error("unimplemented service: target {target:#04x} ordinal {ordinal:#06x}")]
    UnimplementedService { target: u8, ordinal: u16 },

    #[error("a service is already registered at target {target:#04x} ordinal {ordinal:#06x}")]
    DuplicateService { target: u8, ordinal: u16 },

    #[error(transparent)]
    Memory(#[from] MemError),

    #[error(transparent)]
    Fault(#[from] MemFault),

    #[error(transparent)]
    Hal(#[from] HalError),

    /// Internal bookkeeping is inconsistent. The running instance cannot continue.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl KernelError {
    pub fn is_fatal(&self) -> bool {
        match self {
            KernelError::InvariantViolation(_) => true,
            KernelError::Memory(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// The status code the guest sees when a service fails with this error.
    pub fn guest_code(&self) -> i32 {
        use codes::*;
        match self {
            KernelError::InvalidHandle(_) | KernelError::WrongKind { .. } => KERR_BAD_HANDLE,
            KernelError::NoSuchObject(_) | KernelError::NameNotFound { .. } => KERR_NOT_FOUND,
            KernelError::ResourceExhausted(_) => KERR_NO_MEMORY,
            KernelError::AlreadyExists { .. } | KernelError::DuplicateService { .. } => {
                KERR_ALREADY_EXISTS
            }
            KernelError::InvalidArgument(_) => KERR_ARGUMENT,
            KernelError::AccessDenied(_) => KERR_ACCESS_DENIED,
            KernelError::InUse(_) => KERR_IN_USE,
            KernelError::Overflow(_) => KERR_OVERFLOW,
            KernelError::Died(_) => KERR_DIED,
            KernelError::UnimplementedService { .. } => KERR_NOT_SUPPORTED,
            KernelError::Memory(e) => match e {
                MemError::OutOfAddressSpace { .. } | MemError::OutOfMemory { .. } => KERR_NO_MEMORY,
                MemError::OutOfRange { .. }
                | MemError::InvalidSize(_)
                | MemError::InvalidAlignment(_) => KERR_ARGUMENT,
                MemError::InvalidChunk(_) | MemError::InvalidSpace(_) => KERR_BAD_HANDLE,
                MemError::NotGlobal(_) => KERR_ACCESS_DENIED,
                MemError::AlreadyAttached { .. } => KERR_ALREADY_EXISTS,
                MemError::Fault(_) => KERR_BAD_DESCRIPTOR,
                MemError::Overlap { .. } => KERR_GENERAL,
            },
            KernelError::Fault(_) => KERR_BAD_DESCRIPTOR,
            KernelError::Hal(e) => match e {
                HalError::NotFound(_) | HalError::UnknownAttribute { .. } => KERR_NOT_SUPPORTED,
                HalError::ReadOnly { .. } => KERR_ACCESS_DENIED,
                HalError::InvalidValue { .. } | HalError::BadState { .. } => KERR_ARGUMENT,
                HalError::DuplicateCategory(_) => KERR_ALREADY_EXISTS,
            },
            KernelError::InvariantViolation(_) => KERR_GENERAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_fatal_but_faults_are_not() {
        let overlap = KernelError::from(MemError::Overlap {
            chunk: ember_mem::ChunkId(1),
            other: ember_mem::ChunkId(2),
            space: ember_mem::SpaceId(1),
            base: 0,
            end: 0x1000,
        });
        assert!(overlap.is_fatal());

        let fault = KernelError::from(MemFault::unmapped(0x10, ember_mem::AccessType::Read));
        assert!(!fault.is_fatal());
        assert_eq!(fault.guest_code(), codes::KERR_BAD_DESCRIPTOR);
    }

    #[test]
    fn unimplemented_maps_to_not_supported() {
        let e = KernelError::UnimplementedService {
            target: 0,
            ordinal: 0x7777,
        };
        assert_eq!(e.guest_code(), codes::KERR_NOT_SUPPORTED);
    }
}
