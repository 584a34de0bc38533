use crate::chunk::SpaceId;
use crate::error::{AccessType, MemFault};
use crate::manager::MemorySystem;

pub type GuestMemoryResult<T> = Result<T, MemFault>;

/// Guest *virtual* memory as seen by one process.
///
/// Execution cores and service handlers only ever touch memory through this trait, so every
/// access goes through permission and commit checks.
pub trait GuestMemory {
    /// Reads bytes from guest memory into `dst`.
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest memory.
    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Instruction fetch; requires execute permission.
    fn fetch(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn read_u8_le(&self, addr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&self, addr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, addr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u8_le(&mut self, addr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(addr, &[value])
    }

    fn write_u16_le(&mut self, addr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }

    fn write_u32_le(&mut self, addr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }
}

/// A [`GuestMemory`] bound to one address space of a [`MemorySystem`].
pub struct SpaceView<'a> {
    mem: &'a mut MemorySystem,
    space: SpaceId,
}

impl<'a> SpaceView<'a> {
    pub fn new(mem: &'a mut MemorySystem, space: SpaceId) -> Self {
        Self { mem, space }
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }
}

impl GuestMemory for SpaceView<'_> {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.mem.read(self.space, addr, dst)
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.mem.write(self.space, addr, src)
    }

    fn fetch(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.mem.read_as(self.space, addr, dst, AccessType::Execute)
    }

    fn read_u16_le(&self, addr: u64) -> GuestMemoryResult<u16> {
        self.mem.read_u16(self.space, addr)
    }

    fn read_u32_le(&self, addr: u64) -> GuestMemoryResult<u32> {
        self.mem.read_u32(self.space, addr)
    }

    fn write_u16_le(&mut self, addr: u64, value: u16) -> GuestMemoryResult<()> {
        self.mem.write_u16(self.space, addr, value)
    }

    fn write_u32_le(&mut self, addr: u64, value: u32) -> GuestMemoryResult<()> {
        self.mem.write_u32(self.space, addr, value)
    }
}

/// Flat little-endian byte buffer starting at address 0. Every byte is readable, writable and
/// executable.
#[derive(Debug, Clone, Default)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, addr: u64, len: usize, access: AccessType) -> GuestMemoryResult<std::ops::Range<usize>> {
        let start = usize::try_from(addr).map_err(|_| MemFault::unmapped(addr, access))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(MemFault::unmapped(addr, access))?;
        Ok(start..end)
    }
}

impl GuestMemory for FlatMemory {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let r = self.range(addr, dst.len(), AccessType::Read)?;
        dst.copy_from_slice(&self.bytes[r]);
        Ok(())
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let r = self.range(addr, src.len(), AccessType::Write)?;
        self.bytes[r].copy_from_slice(src);
        Ok(())
    }

    fn fetch(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let r = self.range(addr, dst.len(), AccessType::Execute)?;
        dst.copy_from_slice(&self.bytes[r]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkSpec, MemoryConfig};

    #[test]
    fn space_view_routes_through_permissions() {
        let mut mem = MemorySystem::new(MemoryConfig::default());
        let space = mem.create_space();
        let data = mem.reserve(space, ChunkSpec::local("d", 0x1000)).unwrap();
        mem.commit(data, 0, 0x1000).unwrap();
        let base = mem.chunk(data).unwrap().base();

        let mut view = SpaceView::new(&mut mem, space);
        view.write_u32_le(base, 0xCAFE_F00D).unwrap();
        assert_eq!(view.read_u32_le(base).unwrap(), 0xCAFE_F00D);
        assert!(view.fetch(base, &mut [0u8; 4]).is_err());
    }

    #[test]
    fn flat_memory_bounds() {
        let mut flat = FlatMemory::new(8);
        flat.write_u32_le(4, 1).unwrap();
        assert_eq!(flat.read_u8_le(4).unwrap(), 1);
        assert!(flat.write_u32_le(6, 1).is_err());
    }
}
