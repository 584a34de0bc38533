use crate::error::{Result, SnapshotError};
use crate::format::{
    Compression, SectionTag, FILE_HEADER_LEN, SNAPSHOT_ENDIANNESS_LITTLE, SNAPSHOT_MAGIC,
    SNAPSHOT_VERSION_V1,
};

/// Upper bound for a single length-prefixed blob.
pub const MAX_BLOB_LEN: usize = 256 * 1024 * 1024;

/// Direction a [`StateSerializer`] moves data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fields are read out of a snapshot image into live state.
    Read,
    /// Fields are copied from live state into a snapshot image.
    Write,
}

/// Bidirectional visitor used by every `do_state` implementation.
///
/// The same call sequence both saves and loads: in [`Mode::Write`] each `absorb_*` call appends
/// the current value, in [`Mode::Read`] it overwrites the value with the next field from the
/// image. Callers must therefore visit fields in an identical order in both directions.
pub struct StateSerializer<'a> {
    mode: Mode,
    out: Vec<u8>,
    input: &'a [u8],
    pos: usize,
    compression: Compression,
}

macro_rules! absorb_le {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, v: &mut $ty) -> Result<()> {
            const N: usize = core::mem::size_of::<$ty>();
            match self.mode {
                Mode::Write => self.out.extend_from_slice(&v.to_le_bytes()),
                Mode::Read => {
                    let mut buf = [0u8; N];
                    buf.copy_from_slice(self.take(N)?);
                    *v = <$ty>::from_le_bytes(buf);
                }
            }
            Ok(())
        }
    };
}

impl StateSerializer<'static> {
    /// Start a new snapshot image. The file header is emitted immediately.
    pub fn writer(compression: Compression) -> Self {
        let mut out = Vec::with_capacity(64 * 1024);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION_V1.to_le_bytes());
        out.push(SNAPSHOT_ENDIANNESS_LITTLE);
        out.push(compression as u8);
        out.extend_from_slice(&0u32.to_le_bytes()); // flags/reserved
        Self {
            mode: Mode::Write,
            out,
            input: &[],
            pos: 0,
            compression,
        }
    }
}

impl<'a> StateSerializer<'a> {
    /// Open an existing snapshot image, validating the file header.
    pub fn reader(input: &'a [u8]) -> Result<Self> {
        if input.len() < FILE_HEADER_LEN {
            return Err(SnapshotError::Truncated {
                needed: FILE_HEADER_LEN,
                remaining: input.len(),
            });
        }
        let mut s = Self {
            mode: Mode::Read,
            out: Vec::new(),
            input,
            pos: 0,
            compression: Compression::None,
        };

        if s.take(SNAPSHOT_MAGIC.len())? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let mut version = 0u16;
        s.absorb_u16(&mut version)?;
        if version != SNAPSHOT_VERSION_V1 {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let mut endianness = 0u8;
        s.absorb_u8(&mut endianness)?;
        if endianness != SNAPSHOT_ENDIANNESS_LITTLE {
            return Err(SnapshotError::InvalidEndianness(endianness));
        }
        let mut compression = 0u8;
        s.absorb_u8(&mut compression)?;
        s.compression = Compression::from_u8(compression)?;
        let mut _flags = 0u32;
        s.absorb_u32(&mut _flags)?;
        Ok(s)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Read
    }

    pub fn is_writing(&self) -> bool {
        self.mode == Mode::Write
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Unread bytes left in a [`Mode::Read`] image.
    pub fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    /// Consume a [`Mode::Write`] serializer, returning the finished image.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.mode {
            Mode::Write => Ok(self.out),
            Mode::Read => Err(SnapshotError::WrongMode {
                required: Mode::Write,
                actual: Mode::Read,
            }),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(SnapshotError::Truncated {
                needed: n,
                remaining,
            });
        }
        let input: &'a [u8] = self.input;
        let bytes = &input[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn absorb_u8(&mut self, v: &mut u8) -> Result<()> {
        match self.mode {
            Mode::Write => self.out.push(*v),
            Mode::Read => *v = self.take(1)?[0],
        }
        Ok(())
    }

    absorb_le!(absorb_u16, u16);
    absorb_le!(absorb_u32, u32);
    absorb_le!(absorb_u64, u64);
    absorb_le!(absorb_i32, i32);
    absorb_le!(absorb_i64, i64);

    pub fn absorb_bool(&mut self, v: &mut bool) -> Result<()> {
        let mut raw = u8::from(*v);
        self.absorb_u8(&mut raw)?;
        if self.is_reading() {
            *v = match raw {
                0 => false,
                1 => true,
                _ => return Err(SnapshotError::Corrupt("invalid bool encoding")),
            };
        }
        Ok(())
    }

    /// Absorb a container length. Returns the length to iterate over in either mode.
    pub fn absorb_count(&mut self, len: usize, max: usize) -> Result<usize> {
        let mut raw: u32 = len
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("length does not fit in u32"))?;
        self.absorb_u32(&mut raw)?;
        let count = raw as usize;
        if count > max {
            return Err(SnapshotError::Corrupt("container length exceeds limit"));
        }
        Ok(count)
    }

    pub fn absorb_bytes(&mut self, v: &mut Vec<u8>) -> Result<()> {
        let len = self.absorb_count(v.len(), MAX_BLOB_LEN)?;
        match self.mode {
            Mode::Write => self.out.extend_from_slice(v),
            Mode::Read => {
                let bytes = self.take(len)?;
                v.clear();
                v.try_reserve_exact(len)
                    .map_err(|_| SnapshotError::OutOfMemory { len })?;
                v.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    pub fn absorb_string(&mut self, v: &mut String) -> Result<()> {
        let mut bytes = match self.mode {
            Mode::Write => v.as_bytes().to_vec(),
            Mode::Read => Vec::new(),
        };
        self.absorb_bytes(&mut bytes)?;
        if self.is_reading() {
            *v = String::from_utf8(bytes)?;
        }
        Ok(())
    }

    /// Absorb a blob through the image's compression scheme.
    ///
    /// Encoding: `kind:u8 uncompressed_len:u32 payload_len:u32 payload`.
    pub fn absorb_compressed(&mut self, v: &mut Vec<u8>) -> Result<()> {
        match self.mode {
            Mode::Write => {
                let mut kind = self.compression as u8;
                self.absorb_u8(&mut kind)?;
                let mut raw_len: u32 = v
                    .len()
                    .try_into()
                    .map_err(|_| SnapshotError::Corrupt("blob too large"))?;
                self.absorb_u32(&mut raw_len)?;
                let mut payload = crate::compress::compress(self.compression, v);
                self.absorb_bytes(&mut payload)
            }
            Mode::Read => {
                let mut kind = 0u8;
                self.absorb_u8(&mut kind)?;
                let kind = Compression::from_u8(kind)?;
                let mut raw_len = 0u32;
                self.absorb_u32(&mut raw_len)?;
                let raw_len = raw_len as usize;
                if raw_len > MAX_BLOB_LEN {
                    return Err(SnapshotError::Corrupt("compressed blob too large"));
                }
                let mut payload = Vec::new();
                self.absorb_bytes(&mut payload)?;
                *v = crate::compress::decompress(kind, &payload, raw_len)?;
                Ok(())
            }
        }
    }

    /// Absorb a vector element by element.
    ///
    /// In [`Mode::Read`] the vector is cleared and refilled with `T::default()` values that `f`
    /// then populates.
    pub fn absorb_vec<T: Default>(
        &mut self,
        v: &mut Vec<T>,
        max: usize,
        mut f: impl FnMut(&mut Self, &mut T) -> Result<()>,
    ) -> Result<()> {
        let count = self.absorb_count(v.len(), max)?;
        match self.mode {
            Mode::Write => {
                for item in v.iter_mut() {
                    f(self, item)?;
                }
            }
            Mode::Read => {
                v.clear();
                v.reserve(count.min(1024));
                for _ in 0..count {
                    let mut item = T::default();
                    f(self, &mut item)?;
                    v.push(item);
                }
            }
        }
        Ok(())
    }

    pub fn absorb<T: Absorb + ?Sized>(&mut self, v: &mut T) -> Result<()> {
        v.absorb(self)
    }

    /// Wrap `f` in a tagged, versioned, length-prefixed section.
    ///
    /// `version` is the newest layout the caller understands. When reading, `f` receives the
    /// version found in the image so it can branch on older layouts; newer versions are rejected.
    /// Bytes a section body leaves unread are skipped so older readers tolerate appended fields.
    pub fn section<F>(&mut self, tag: SectionTag, version: u16, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self, u16) -> Result<()>,
    {
        match self.mode {
            Mode::Write => {
                self.out.extend_from_slice(&tag.0);
                self.out.extend_from_slice(&version.to_le_bytes());
                self.out.extend_from_slice(&0u16.to_le_bytes()); // flags/reserved
                let len_pos = self.out.len();
                self.out.extend_from_slice(&0u64.to_le_bytes()); // placeholder len

                let payload_start = self.out.len();
                f(self, version)?;
                let len = (self.out.len() - payload_start) as u64;
                self.out[len_pos..len_pos + 8].copy_from_slice(&len.to_le_bytes());
                Ok(())
            }
            Mode::Read => {
                let mut found = [0u8; 4];
                found.copy_from_slice(self.take(4)?);
                let found = SectionTag(found);
                if found != tag {
                    return Err(SnapshotError::SectionMismatch {
                        expected: tag,
                        found,
                    });
                }
                let mut found_version = 0u16;
                self.absorb_u16(&mut found_version)?;
                let mut _flags = 0u16;
                self.absorb_u16(&mut _flags)?;
                let mut len = 0u64;
                self.absorb_u64(&mut len)?;

                if found_version == 0 || found_version > version {
                    return Err(SnapshotError::UnsupportedSectionVersion {
                        section: tag,
                        version: found_version,
                        supported: version,
                    });
                }
                let len = usize::try_from(len)
                    .map_err(|_| SnapshotError::Corrupt("section length overflow"))?;
                let remaining = self.remaining();
                if len > remaining {
                    return Err(SnapshotError::Truncated {
                        needed: len,
                        remaining,
                    });
                }

                let end = self.pos + len;
                let full: &'a [u8] = self.input;
                self.input = &full[..end];
                let res = f(self, found_version);
                self.input = full;
                res?;
                self.pos = end;
                Ok(())
            }
        }
    }
}

/// Types that know how to move themselves through a [`StateSerializer`].
pub trait Absorb {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> Result<()>;
}

macro_rules! impl_absorb {
    ($($ty:ty => $method:ident),* $(,)?) => {
        $(
            impl Absorb for $ty {
                fn absorb(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
                    s.$method(self)
                }
            }
        )*
    };
}

impl_absorb! {
    u8 => absorb_u8,
    u16 => absorb_u16,
    u32 => absorb_u32,
    u64 => absorb_u64,
    i32 => absorb_i32,
    i64 => absorb_i64,
    bool => absorb_bool,
    String => absorb_string,
}

impl<T: Absorb + Default> Absorb for Option<T> {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
        let mut present = self.is_some();
        s.absorb_bool(&mut present)?;
        match (s.mode(), present) {
            (Mode::Write, true) => {
                if let Some(v) = self.as_mut() {
                    v.absorb(s)?;
                }
            }
            (Mode::Read, true) => {
                let mut v = T::default();
                v.absorb(s)?;
                *self = Some(v);
            }
            (Mode::Read, false) => *self = None,
            (Mode::Write, false) => {}
        }
        Ok(())
    }
}

impl<T: Absorb, const N: usize> Absorb for [T; N] {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
        for item in self.iter_mut() {
            item.absorb(s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Sample {
        a: u32,
        b: i64,
        name: String,
        flag: bool,
        regs: [u32; 4],
        opt: Option<u64>,
        blob: Vec<u8>,
    }

    impl Sample {
        fn do_state(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
            s.section(SectionTag(*b"SMPL"), 1, |s, _version| {
                s.absorb(&mut self.a)?;
                s.absorb(&mut self.b)?;
                s.absorb(&mut self.name)?;
                s.absorb(&mut self.flag)?;
                s.absorb(&mut self.regs)?;
                s.absorb(&mut self.opt)?;
                s.absorb_compressed(&mut self.blob)
            })
        }
    }

    fn sample() -> Sample {
        Sample {
            a: 0xDEAD_BEEF,
            b: -42,
            name: "thread-main".to_string(),
            flag: true,
            regs: [1, 2, 3, 4],
            opt: Some(77),
            blob: vec![0xAB; 4096],
        }
    }

    #[test]
    fn same_visitor_saves_and_loads() {
        for compression in [Compression::None, Compression::Lz4] {
            let mut original = sample();
            let mut w = StateSerializer::writer(compression);
            original.do_state(&mut w).unwrap();
            let bytes = w.into_bytes().unwrap();

            let mut restored = Sample::default();
            let mut r = StateSerializer::reader(&bytes).unwrap();
            restored.do_state(&mut r).unwrap();
            assert_eq!(restored, original);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut original = sample();
        let mut w = StateSerializer::writer(Compression::Lz4);
        original.do_state(&mut w).unwrap();
        let bytes = w.into_bytes().unwrap();

        let cut = &bytes[..bytes.len() - 3];
        let mut r = StateSerializer::reader(cut).unwrap();
        let err = Sample::default().do_state(&mut r).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated { .. }), "{err}");
    }

    #[test]
    fn newer_section_version_is_rejected() {
        let mut w = StateSerializer::writer(Compression::None);
        w.section(SectionTag(*b"SMPL"), 2, |_, _| Ok(())).unwrap();
        let bytes = w.into_bytes().unwrap();

        let mut r = StateSerializer::reader(&bytes).unwrap();
        let err = r.section(SectionTag(*b"SMPL"), 1, |_, _| Ok(())).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::UnsupportedSectionVersion {
                version: 2,
                supported: 1,
                ..
            }
        ));
    }

    #[test]
    fn unread_section_tail_is_skipped() {
        let mut w = StateSerializer::writer(Compression::None);
        w.section(SectionTag(*b"AAAA"), 1, |s, _| {
            s.absorb(&mut 1u32)?;
            s.absorb(&mut 2u32)
        })
        .unwrap();
        w.section(SectionTag(*b"BBBB"), 1, |s, _| s.absorb(&mut 3u32))
            .unwrap();
        let bytes = w.into_bytes().unwrap();

        let mut r = StateSerializer::reader(&bytes).unwrap();
        let mut first = 0u32;
        r.section(SectionTag(*b"AAAA"), 1, |s, _| s.absorb(&mut first))
            .unwrap();
        let mut third = 0u32;
        r.section(SectionTag(*b"BBBB"), 1, |s, _| s.absorb(&mut third))
            .unwrap();
        assert_eq!((first, third), (1, 3));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = StateSerializer::writer(Compression::None)
            .into_bytes()
            .unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            StateSerializer::reader(&bytes),
            Err(SnapshotError::InvalidMagic)
        ));
    }

    #[test]
    fn into_bytes_requires_write_mode() {
        let bytes = StateSerializer::writer(Compression::None)
            .into_bytes()
            .unwrap();
        let r = StateSerializer::reader(&bytes).unwrap();
        assert!(matches!(
            r.into_bytes(),
            Err(SnapshotError::WrongMode { .. })
        ));
    }
}
