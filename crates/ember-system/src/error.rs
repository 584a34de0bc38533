use std::path::PathBuf;

use ember_hal::HalError;
use ember_kernel::{KernelError, ObjectId};
use ember_mem::MemError;
use ember_snapshot::SnapshotError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SystemError>;

/// Errors returned by the host-facing [`System`](crate::System) surface.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("system has not been started")]
    NotStarted,

    #[error("system is already started")]
    AlreadyStarted,

    /// A previous loop hit an unrecoverable error; only `reset` or `shutdown` are accepted.
    #[error("system faulted: {0}")]
    Faulted(String),

    #[error("snapshots need a paused system")]
    NotPaused,

    #[error("no device at index {index} (have {count})")]
    InvalidDevice { index: u8, count: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Memory(#[from] MemError),

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Failures resolving or reading an executable image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("{0:?} is not an absolute drive path")]
    BadPath(String),

    #[error("drive {0}: is not mounted")]
    NotMounted(char),

    #[error("no image at {0:?}")]
    NotFound(String),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image {path:?} is malformed: {reason}")]
    Malformed { path: String, reason: &'static str },
}

/// Debug-surface access failures. These never fault the guest or the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("address {addr:#010x} is not mapped")]
    Unmapped { addr: u64 },

    #[error("no live process {0:?}")]
    NoSuchProcess(ObjectId),
}
