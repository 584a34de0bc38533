use thiserror::Error;

use crate::format::SectionTag;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),

    #[error("invalid endianness tag {0}")]
    InvalidEndianness(u8),

    #[error("expected section {expected}, found {found}")]
    SectionMismatch {
        expected: SectionTag,
        found: SectionTag,
    },

    #[error("section {section} has unsupported version {version} (newest known {supported})")]
    UnsupportedSectionVersion {
        section: SectionTag,
        version: u16,
        supported: u16,
    },

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("dangling {what} reference to id {id}")]
    DanglingReference { what: &'static str, id: u64 },

    #[error("serializer is in {actual:?} mode, operation requires {required:?}")]
    WrongMode {
        required: crate::Mode,
        actual: crate::Mode,
    },

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
