//! Executable images and the drive table they are resolved through.
//!
//! Guest paths are drive-letter paths such as `c:\sys\bin\app.exe`. A drive is mounted onto a
//! host directory; the [`FlatLoader`] also serves images registered in memory, which take
//! precedence over the host filesystem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LoadError;

/// Magic at the start of an image that carries a header.
pub const IMAGE_MAGIC: &[u8; 4] = b"EMBX";
/// Length of the optional image header.
pub const IMAGE_HEADER_LEN: usize = 16;
/// Priority of a loaded primary thread when the image does not name one.
pub const DEFAULT_PRIORITY: u8 = 27;

/// Media kind a drive letter is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMedia {
    /// Writable storage such as the phone's internal disk or a memory card.
    Physical,
    /// Read-only firmware drive.
    Rom,
    Ram,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub media: DriveMedia,
    pub host_path: PathBuf,
}

/// Drive letters currently mounted, `a` to `z`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveTable {
    drives: BTreeMap<char, Mount>,
}

impl DriveTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `host_path` as `drive`, replacing any earlier mount of that letter.
    pub fn mount(&mut self, drive: char, media: DriveMedia, host_path: impl Into<PathBuf>) {
        let drive = drive.to_ascii_lowercase();
        let host_path = host_path.into();
        debug!(%drive, ?media, path = %host_path.display(), "mounted drive");
        self.drives.insert(drive, Mount { media, host_path });
    }

    pub fn unmount(&mut self, drive: char) -> Option<Mount> {
        self.drives.remove(&drive.to_ascii_lowercase())
    }

    pub fn get(&self, drive: char) -> Option<&Mount> {
        self.drives.get(&drive.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, &Mount)> + '_ {
        self.drives.iter().map(|(&d, m)| (d, m))
    }

    /// Map a guest path onto the host path under its drive's mount.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, LoadError> {
        let (drive, rest) = split_drive(guest_path)?;
        let mount = self.get(drive).ok_or(LoadError::NotMounted(drive))?;
        let mut host = mount.host_path.clone();
        for part in rest.split(['\\', '/']).filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(LoadError::BadPath(guest_path.to_string()));
            }
            host.push(part);
        }
        Ok(host)
    }
}

fn split_drive(path: &str) -> Result<(char, &str), LoadError> {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(d), Some(':')) if d.is_ascii_alphabetic() => Ok((d.to_ascii_lowercase(), &path[2..])),
        _ => Err(LoadError::BadPath(path.to_string())),
    }
}

/// Canonical spelling of a guest path: lower case with backslash separators.
pub fn normalize_path(path: &str) -> String {
    path.to_ascii_lowercase().replace('/', "\\")
}

/// An executable ready to be mapped into a fresh process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Process name, taken from the file name without its extension.
    pub name: String,
    pub code: Vec<u8>,
    /// Entry point as an offset into `code`.
    pub entry_offset: u32,
    /// Primary thread stack size in bytes; 0 selects the kernel default.
    pub stack_size: u32,
    pub priority: u8,
}

impl LoadedImage {
    /// Parse raw image bytes. Images starting with [`IMAGE_MAGIC`] carry a 16-byte header
    /// (`magic, entry:u32, stack:u32, priority:u8, 3 reserved`); anything else is flat code
    /// entered at offset 0.
    pub fn parse(guest_path: &str, bytes: Vec<u8>) -> Result<Self, LoadError> {
        let name = image_name(guest_path);
        let malformed = |reason| LoadError::Malformed {
            path: guest_path.to_string(),
            reason,
        };

        let image = if bytes.starts_with(IMAGE_MAGIC) {
            if bytes.len() < IMAGE_HEADER_LEN {
                return Err(malformed("truncated header"));
            }
            let word = |at: usize| {
                u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
            };
            let (entry_offset, stack_size, priority) = (word(4), word(8), bytes[12]);
            LoadedImage {
                name,
                code: bytes[IMAGE_HEADER_LEN..].to_vec(),
                entry_offset,
                stack_size,
                priority,
            }
        } else {
            LoadedImage {
                name,
                code: bytes,
                entry_offset: 0,
                stack_size: 0,
                priority: DEFAULT_PRIORITY,
            }
        };

        if image.code.is_empty() {
            return Err(malformed("no code"));
        }
        if image.entry_offset as usize >= image.code.len() {
            return Err(malformed("entry point outside the image"));
        }
        Ok(image)
    }

    /// Serialize with a header, the inverse of [`parse`](Self::parse).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IMAGE_HEADER_LEN + self.code.len());
        out.extend_from_slice(IMAGE_MAGIC);
        out.extend_from_slice(&self.entry_offset.to_le_bytes());
        out.extend_from_slice(&self.stack_size.to_le_bytes());
        out.extend_from_slice(&[self.priority, 0, 0, 0]);
        out.extend_from_slice(&self.code);
        out
    }
}

fn image_name(guest_path: &str) -> String {
    let file = guest_path
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(guest_path);
    let stem = Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file);
    stem.to_string()
}

/// Source of executable images for [`System::load`](crate::System::load).
pub trait ImageLoader: Send {
    fn load(&mut self, guest_path: &str, drives: &DriveTable) -> Result<LoadedImage, LoadError>;
}

/// Loads flat or headered images from memory or from mounted host directories.
#[derive(Debug, Default, Clone)]
pub struct FlatLoader {
    images: BTreeMap<String, Vec<u8>>,
}

impl FlatLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for `guest_path` without touching the host filesystem.
    pub fn insert(&mut self, guest_path: &str, bytes: impl Into<Vec<u8>>) {
        self.images.insert(normalize_path(guest_path), bytes.into());
    }

    #[must_use]
    pub fn with_image(mut self, guest_path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(guest_path, bytes);
        self
    }
}

impl ImageLoader for FlatLoader {
    fn load(&mut self, guest_path: &str, drives: &DriveTable) -> Result<LoadedImage, LoadError> {
        let normalized = normalize_path(guest_path);
        if let Some(bytes) = self.images.get(&normalized) {
            return LoadedImage::parse(guest_path, bytes.clone());
        }
        // Guest file names are case-insensitive; host trees are stored in lower case.
        let host = drives.resolve(&normalized)?;
        let bytes = match std::fs::read(&host) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(guest_path.to_string()))
            }
            Err(source) => return Err(LoadError::Io { path: host, source }),
        };
        debug!(guest_path, host = %host.display(), len = bytes.len(), "read image");
        LoadedImage::parse(guest_path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_under_the_mount() {
        let mut drives = DriveTable::new();
        drives.mount('C', DriveMedia::Physical, "/data/c");
        assert_eq!(
            drives.resolve("c:\\sys\\bin\\app.exe").unwrap(),
            PathBuf::from("/data/c/sys/bin/app.exe")
        );
        assert!(matches!(
            drives.resolve("z:\\x.exe"),
            Err(LoadError::NotMounted('z'))
        ));
        assert!(matches!(
            drives.resolve("c:\\..\\etc\\passwd"),
            Err(LoadError::BadPath(_))
        ));
        assert!(matches!(drives.resolve("app.exe"), Err(LoadError::BadPath(_))));
    }

    #[test]
    fn header_round_trips() {
        let image = LoadedImage {
            name: "app".into(),
            code: vec![0x00, 0xFF],
            entry_offset: 1,
            stack_size: 0x2000,
            priority: 40,
        };
        let parsed = LoadedImage::parse("c:\\sys\\bin\\APP.exe", image.to_bytes()).unwrap();
        assert_eq!(parsed.name, "APP");
        assert_eq!(parsed.entry_offset, 1);
        assert_eq!(parsed.priority, 40);
        assert_eq!(parsed.code, image.code);
    }

    #[test]
    fn rejects_entry_past_the_end() {
        let mut bytes = LoadedImage {
            name: String::new(),
            code: vec![0xFF],
            entry_offset: 0,
            stack_size: 0,
            priority: 1,
        }
        .to_bytes();
        bytes[4] = 9;
        assert!(matches!(
            LoadedImage::parse("c:\\a.exe", bytes),
            Err(LoadError::Malformed { .. })
        ));
    }

    #[test]
    fn memory_images_win_over_drives() {
        let mut loader = FlatLoader::new().with_image("C:/Sys/Bin/Hello.exe", vec![0xFF]);
        let image = loader
            .load("c:\\sys\\bin\\hello.exe", &DriveTable::new())
            .unwrap();
        assert_eq!(image.name, "hello");
        assert_eq!(image.priority, DEFAULT_PRIORITY);
    }
}
