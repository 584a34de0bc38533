/// A host-registered logical device driver that guest code can open by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogicalDevice {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl LogicalDevice {
    pub fn new(major: u8, minor: u8, build: u16) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }

    /// Version packed as `major:u8 minor:u8 build:u16`, the layout guest code reads.
    pub fn packed_version(&self) -> [u8; 4] {
        let b = self.build.to_le_bytes();
        [self.major, self.minor, b[0], b[1]]
    }
}
