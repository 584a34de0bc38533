//! Versioned save/restore of emulator state.
//!
//! Every stateful component implements [`Snapshot`]: one `do_state` method that is driven by a
//! [`StateSerializer`] in either [`Mode::Write`] (save) or [`Mode::Read`] (restore). Images start
//! with a fixed file header and are made of tagged sections, each carrying its own layout version
//! and payload length so readers can reject newer layouts and skip trailing additions.
#![forbid(unsafe_code)]

mod compress;
mod error;
mod format;
mod serializer;

pub use crate::error::{Result, SnapshotError};
pub use crate::format::{
    Compression, SectionTag, FILE_HEADER_LEN, SECTION_HEADER_LEN, SNAPSHOT_ENDIANNESS_LITTLE,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION_V1,
};
pub use crate::serializer::{Absorb, Mode, StateSerializer, MAX_BLOB_LEN};

/// State that can be saved to and restored from a snapshot image.
///
/// Implementations must visit fields in the same order in both modes and must not touch live
/// state that is not part of the walk.
pub trait Snapshot {
    fn do_state(&mut self, s: &mut StateSerializer<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[derive(Default)]
    struct Registers {
        gpr: [u32; 16],
        label: String,
        pages: Vec<Vec<u8>>,
    }

    impl Snapshot for Registers {
        fn do_state(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
            s.section(SectionTag(*b"REGS"), 1, |s, _| {
                s.absorb(&mut self.gpr)?;
                s.absorb(&mut self.label)?;
                s.absorb_vec(&mut self.pages, 1024, |s, page| s.absorb_compressed(page))
            })
        }
    }

    proptest! {
        // Guards against panics on corrupted/truncated inputs; not a substitute for fuzzing.
        #[test]
        fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            if let Ok(mut r) = StateSerializer::reader(&data) {
                let _ = Registers::default().do_state(&mut r);
            }
        }

        #[test]
        fn decoder_never_panics_after_valid_header(tail in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let mut data = StateSerializer::writer(Compression::Lz4).into_bytes().unwrap();
            data.extend_from_slice(b"REGS");
            data.extend_from_slice(&tail);
            let mut r = StateSerializer::reader(&data).unwrap();
            let _ = Registers::default().do_state(&mut r);
        }
    }
}
