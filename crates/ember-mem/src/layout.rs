use bitflags::bitflags;

/// Default page size for guest memory.
pub const PAGE_SIZE: u64 = 0x1000;

bitflags! {
    /// Access permissions of a chunk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        /// Heap, stack and data chunks.
        const DATA = Self::READ.bits() | Self::WRITE.bits();
        /// Loaded code.
        const CODE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

/// Which part of the guest virtual address map a chunk lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Per-process data: heaps, stacks, private chunks. Each address space has its own copy.
    Local,
    /// Global chunks visible at the same address from every process that attaches them.
    Shared,
    /// Global code chunks.
    Code,
}

impl Region {
    pub fn is_global(self) -> bool {
        !matches!(self, Region::Local)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Region::Local => 0,
            Region::Shared => 1,
            Region::Code => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Region::Local),
            1 => Some(Region::Shared),
            2 => Some(Region::Code),
            _ => None,
        }
    }
}

/// Half-open guest virtual range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Guest virtual address map, modelled on a 32-bit multiple-memory-model layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub local: AddrRange,
    pub shared: AddrRange,
    pub code: AddrRange,
}

impl MemoryLayout {
    pub fn range(&self, region: Region) -> AddrRange {
        match region {
            Region::Local => self.local,
            Region::Shared => self.shared,
            Region::Code => self.code,
        }
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            local: AddrRange::new(0x0040_0000, 0x4000_0000),
            shared: AddrRange::new(0x4000_0000, 0x7000_0000),
            code: AddrRange::new(0x7000_0000, 0x8000_0000),
        }
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

pub(crate) fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_regions_are_disjoint() {
        let l = MemoryLayout::default();
        assert!(!l.local.overlaps(&l.shared));
        assert!(!l.local.overlaps(&l.code));
        assert!(!l.shared.overlaps(&l.code));
    }

    #[test]
    fn code_perms_are_not_writable() {
        assert!(!Perms::CODE.contains(Perms::WRITE));
        assert!(!Perms::DATA.contains(Perms::EXECUTE));
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
        assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
        assert_eq!(align_up(u64::MAX, 0x1000), None);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
    }
}
