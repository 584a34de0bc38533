use crate::error::{Result, SnapshotError};

pub const SNAPSHOT_MAGIC: &[u8; 8] = b"EMBERSNP";
pub const SNAPSHOT_VERSION_V1: u16 = 1;
pub const SNAPSHOT_ENDIANNESS_LITTLE: u8 = 1;

/// Bytes occupied by the file header: magic, version, endianness, compression, reserved flags.
pub const FILE_HEADER_LEN: usize = 8 + 2 + 1 + 1 + 4;

/// Bytes occupied by a section header: tag, version, reserved flags, payload length.
pub const SECTION_HEADER_LEN: usize = 4 + 2 + 2 + 8;

/// Four-character tag identifying a top-level snapshot section.
///
/// Tags are part of the on-disk format and must stay stable forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionTag(pub [u8; 4]);

impl SectionTag {
    pub const SYSTEM: SectionTag = SectionTag(*b"SYS_");
    pub const KERNEL: SectionTag = SectionTag(*b"KERN");
    pub const MEMORY: SectionTag = SectionTag(*b"MEMS");
    pub const HAL: SectionTag = SectionTag(*b"HAL_");

    pub fn name(self) -> Option<&'static str> {
        match self {
            SectionTag::SYSTEM => Some("SYSTEM"),
            SectionTag::KERNEL => Some("KERNEL"),
            SectionTag::MEMORY => Some("MEMORY"),
            SectionTag::HAL => Some("HAL"),
            _ => None,
        }
    }
}

impl core::fmt::Display for SectionTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let printable = self.0.iter().all(|b| b.is_ascii_graphic());
        match (self.name(), printable) {
            (Some(name), _) => write!(f, "{name}({})", String::from_utf8_lossy(&self.0)),
            (None, true) => write!(f, "SectionTag({})", String::from_utf8_lossy(&self.0)),
            (None, false) => write!(f, "SectionTag({:02x?})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(SnapshotError::Corrupt("invalid compression kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_tags_have_stable_bytes_and_names() {
        let cases = [
            (SectionTag::SYSTEM, b"SYS_", "SYSTEM"),
            (SectionTag::KERNEL, b"KERN", "KERNEL"),
            (SectionTag::MEMORY, b"MEMS", "MEMORY"),
            (SectionTag::HAL, b"HAL_", "HAL"),
        ];
        for (tag, bytes, name) in cases {
            assert_eq!(&tag.0, bytes, "{name} tag bytes changed; must remain stable");
            assert_eq!(tag.name(), Some(name));
        }
    }

    #[test]
    fn unknown_tags_display_raw_bytes() {
        assert_eq!(format!("{}", SectionTag(*b"ABCD")), "SectionTag(ABCD)");
        assert_eq!(
            format!("{}", SectionTag([0, 1, 2, 3])),
            "SectionTag([00, 01, 02, 03])"
        );
    }
}
