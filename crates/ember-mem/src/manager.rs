use std::collections::BTreeMap;

use tracing::debug;

use crate::chunk::{Chunk, ChunkId, ChunkSpec, SpaceId};
use crate::error::{AccessType, MemError, MemFault, Result};
use crate::layout::{align_down, align_up, AddrRange, MemoryLayout, Perms, PAGE_SIZE};
use crate::space::{AddressSpace, RangeMap};

/// Address space manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Page size in bytes; must be a power of two.
    pub page_size: u64,
    /// Upper bound on committed guest memory across all chunks. Commits beyond it fail with
    /// [`MemError::OutOfMemory`].
    pub max_committed_bytes: u64,
    pub layout: MemoryLayout,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            max_committed_bytes: 256 * 1024 * 1024,
            layout: MemoryLayout::default(),
        }
    }
}

/// Result of translating a guest virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub chunk: ChunkId,
    /// Offset of the address from the chunk base.
    pub offset: u64,
}

/// Owner of every address space and chunk in a running instance.
///
/// Chunks live in one arena keyed by [`ChunkId`]; address spaces only store `base -> chunk`
/// mappings, so a shared chunk attached to several spaces is a single set of host pages.
#[derive(Debug, Clone)]
pub struct MemorySystem {
    pub(crate) config: MemoryConfig,
    pub(crate) spaces: BTreeMap<SpaceId, AddressSpace>,
    pub(crate) chunks: BTreeMap<ChunkId, Chunk>,
    /// Allocation table for global (shared/code) chunks.
    pub(crate) global: RangeMap,
    pub(crate) next_space: u64,
    pub(crate) next_chunk: u64,
    pub(crate) committed_bytes: u64,
}

impl MemorySystem {
    pub fn new(config: MemoryConfig) -> Self {
        assert!(
            config.page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        Self {
            config,
            spaces: BTreeMap::new(),
            chunks: BTreeMap::new(),
            global: RangeMap::default(),
            next_space: 1,
            next_chunk: 1,
            committed_bytes: 0,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    /// Total committed bytes across every chunk.
    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes
    }

    /// Drop every space and chunk, keeping identity counters monotonic.
    pub fn clear(&mut self) {
        self.spaces.clear();
        self.chunks.clear();
        self.global = RangeMap::default();
        self.committed_bytes = 0;
    }

    pub fn create_space(&mut self) -> SpaceId {
        let id = SpaceId(self.next_space);
        self.next_space += 1;
        self.spaces.insert(id, AddressSpace::new(id));
        debug!(space = id.0, "created address space");
        id
    }

    /// Tear down a space: its local chunks are released, global chunks are detached.
    pub fn destroy_space(&mut self, space: SpaceId) -> Result<()> {
        let s = self.spaces.get(&space).ok_or(MemError::InvalidSpace(space))?;
        let mapped: Vec<ChunkId> = s.chunks().collect();
        for chunk in mapped {
            if self.chunk(chunk)?.owner == Some(space) {
                self.release(chunk)?;
            } else {
                self.detach(chunk, space)?;
            }
        }
        self.spaces.remove(&space);
        debug!(space = space.0, "destroyed address space");
        Ok(())
    }

    pub fn space(&self, space: SpaceId) -> Result<&AddressSpace> {
        self.spaces.get(&space).ok_or(MemError::InvalidSpace(space))
    }

    pub fn spaces(&self) -> impl Iterator<Item = &AddressSpace> + '_ {
        self.spaces.values()
    }

    pub fn chunk(&self, chunk: ChunkId) -> Result<&Chunk> {
        self.chunks.get(&chunk).ok_or(MemError::InvalidChunk(chunk))
    }

    fn chunk_mut(&mut self, chunk: ChunkId) -> Result<&mut Chunk> {
        self.chunks.get_mut(&chunk).ok_or(MemError::InvalidChunk(chunk))
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.values()
    }

    /// Reserve a virtual range for a new chunk. Nothing is committed yet.
    ///
    /// Local chunks are placed in `space`'s private region and owned by it. Global chunks are
    /// placed in the shared/code region and mapped into `space`; other spaces may
    /// [`attach`](Self::attach) them later.
    pub fn reserve(&mut self, space: SpaceId, spec: ChunkSpec) -> Result<ChunkId> {
        let page = self.config.page_size;
        if spec.size == 0 {
            return Err(MemError::InvalidSize(spec.size));
        }
        let size = align_up(spec.size, page).ok_or(MemError::InvalidSize(spec.size))?;
        let align = spec.align.max(page);
        if !align.is_power_of_two() {
            return Err(MemError::InvalidAlignment(spec.align));
        }
        if !self.spaces.contains_key(&space) {
            return Err(MemError::InvalidSpace(space));
        }

        let within = self.config.layout.range(spec.region);
        let base = if spec.region.is_global() {
            self.global.find_free(within, size, align)
        } else {
            self.spaces[&space].map.find_free(within, size, align)
        }
        .ok_or(MemError::OutOfAddressSpace {
            region: spec.region,
            size,
        })?;

        let id = ChunkId(self.next_chunk);
        self.next_chunk += 1;

        let page_count = (size / page) as usize;
        let chunk = Chunk {
            id,
            name: spec.name,
            base,
            reserved: size,
            perms: spec.perms,
            backing: spec.backing,
            region: spec.region,
            owner: (!spec.region.is_global()).then_some(space),
            mapped_in: [space].into_iter().collect(),
            pages: (0..page_count).map(|_| None).collect(),
            committed_pages: 0,
            page_size: page,
        };

        if spec.region.is_global() {
            self.global.insert(base, id, size);
        }
        if let Some(s) = self.spaces.get_mut(&space) {
            s.map.insert(base, id, size);
        }
        debug!(
            chunk = id.0,
            space = space.0,
            base = format_args!("{base:#x}"),
            size = format_args!("{size:#x}"),
            name = %chunk.name,
            "reserved chunk"
        );
        self.chunks.insert(id, chunk);
        Ok(id)
    }

    /// Free a chunk: decommit everything and unmap it from every space.
    pub fn release(&mut self, chunk: ChunkId) -> Result<()> {
        let c = self.chunks.remove(&chunk).ok_or(MemError::InvalidChunk(chunk))?;
        for space in &c.mapped_in {
            if let Some(s) = self.spaces.get_mut(space) {
                s.map.remove(c.base);
            }
        }
        if c.region.is_global() {
            self.global.remove(c.base);
        }
        self.committed_bytes -= c.committed_size();
        debug!(chunk = chunk.0, "released chunk");
        Ok(())
    }

    /// Map a global chunk into another address space at its fixed base.
    pub fn attach(&mut self, chunk: ChunkId, space: SpaceId) -> Result<()> {
        let c = self.chunk(chunk)?;
        if !c.region.is_global() {
            return Err(MemError::NotGlobal(chunk));
        }
        if c.mapped_in.contains(&space) {
            return Err(MemError::AlreadyAttached { chunk, space });
        }
        let (base, reserved) = (c.base, c.reserved);
        let s = self
            .spaces
            .get_mut(&space)
            .ok_or(MemError::InvalidSpace(space))?;
        if let Some(other) = s.map.find_overlap(AddrRange::new(base, base + reserved), chunk) {
            return Err(MemError::Overlap {
                chunk,
                other,
                space,
                base,
                end: base + reserved,
            });
        }
        s.map.insert(base, chunk, reserved);
        self.chunk_mut(chunk)?.mapped_in.insert(space);
        debug!(chunk = chunk.0, space = space.0, "attached chunk");
        Ok(())
    }

    /// Unmap a chunk from one space without freeing its pages.
    pub fn detach(&mut self, chunk: ChunkId, space: SpaceId) -> Result<()> {
        let c = self.chunk_mut(chunk)?;
        if c.mapped_in.remove(&space) {
            let base = c.base;
            if let Some(s) = self.spaces.get_mut(&space) {
                s.map.remove(base);
            }
        }
        Ok(())
    }

    fn page_range(&self, chunk: &Chunk, offset: u64, size: u64) -> Result<(usize, usize)> {
        let page = self.config.page_size;
        let end = offset.checked_add(size).filter(|&end| end <= chunk.reserved);
        let Some(end) = end else {
            return Err(MemError::OutOfRange {
                chunk: chunk.id,
                offset,
                size,
                reserved: chunk.reserved,
            });
        };
        let first = align_down(offset, page) / page;
        let last = align_up(end, page).ok_or(MemError::InvalidSize(size))? / page;
        Ok((first as usize, last as usize))
    }

    /// Back `[offset, offset + size)` of a chunk with zeroed host pages.
    ///
    /// All-or-nothing: if the commit budget cannot cover every missing page, nothing changes.
    pub fn commit(&mut self, chunk: ChunkId, offset: u64, size: u64) -> Result<()> {
        let c = self.chunk(chunk)?;
        let (first, last) = self.page_range(c, offset, size)?;
        let missing = c.pages[first..last].iter().filter(|p| p.is_none()).count();
        let page = self.config.page_size;
        let requested = missing as u64 * page;
        let available = self
            .config
            .max_committed_bytes
            .saturating_sub(self.committed_bytes);
        if requested > available {
            return Err(MemError::OutOfMemory {
                requested,
                available,
            });
        }

        let mut fresh: Vec<Box<[u8]>> = Vec::new();
        fresh
            .try_reserve_exact(missing)
            .map_err(|_| MemError::OutOfMemory {
                requested,
                available,
            })?;
        fresh.extend((0..missing).map(|_| vec![0u8; page as usize].into_boxed_slice()));

        let c = self.chunk_mut(chunk)?;
        let mut fresh = fresh.into_iter();
        for slot in &mut c.pages[first..last] {
            if slot.is_none() {
                *slot = fresh.next();
            }
        }
        c.committed_pages += missing;
        self.committed_bytes += requested;
        Ok(())
    }

    /// Drop the host pages backing `[offset, offset + size)`. Uncommitted pages are ignored.
    pub fn decommit(&mut self, chunk: ChunkId, offset: u64, size: u64) -> Result<()> {
        let c = self.chunk(chunk)?;
        let (first, last) = self.page_range(c, offset, size)?;
        let page = self.config.page_size;
        let c = self.chunk_mut(chunk)?;
        let mut freed = 0usize;
        for slot in &mut c.pages[first..last] {
            if slot.take().is_some() {
                freed += 1;
            }
        }
        c.committed_pages -= freed;
        self.committed_bytes -= freed as u64 * page;
        Ok(())
    }

    /// Move the committed top of a bottom-up chunk to `new_size`, committing or decommitting the
    /// difference.
    pub fn adjust(&mut self, chunk: ChunkId, new_size: u64) -> Result<()> {
        let c = self.chunk(chunk)?;
        let top = c.top();
        if new_size > c.reserved {
            return Err(MemError::OutOfRange {
                chunk,
                offset: 0,
                size: new_size,
                reserved: c.reserved,
            });
        }
        let new_top = align_up(new_size, self.config.page_size).ok_or(MemError::InvalidSize(new_size))?;
        if new_top > top {
            self.commit(chunk, top, new_top - top)
        } else if new_top < top {
            self.decommit(chunk, new_top, top - new_top)
        } else {
            Ok(())
        }
    }

    /// Grow or shrink a chunk's reservation in place.
    ///
    /// Shrinking decommits pages past the new end. Growing re-validates that the new extent is
    /// free in every space the chunk is mapped into; a collision is
    /// [`MemError::Overlap`], which callers must treat as fatal.
    pub fn set_reserved_size(&mut self, chunk: ChunkId, new_size: u64) -> Result<()> {
        let page = self.config.page_size;
        if new_size == 0 {
            return Err(MemError::InvalidSize(new_size));
        }
        let new_size = align_up(new_size, page).ok_or(MemError::InvalidSize(new_size))?;
        let c = self.chunk(chunk)?;
        let (base, old_size, region) = (c.base, c.reserved, c.region);

        if new_size < old_size {
            self.decommit(chunk, new_size, old_size - new_size)?;
        } else if new_size > old_size {
            let extent = AddrRange::new(base, base + new_size);
            let within = self.config.layout.range(region);
            if extent.end > within.end {
                return Err(MemError::OutOfAddressSpace {
                    region,
                    size: new_size,
                });
            }
            let mut tables: Vec<(SpaceId, &RangeMap)> = c
                .mapped_in
                .iter()
                .filter_map(|id| self.spaces.get(id).map(|s| (*id, &s.map)))
                .collect();
            if region.is_global() {
                tables.push((SpaceId(0), &self.global));
            }
            for (space, map) in tables {
                if let Some(other) = map.find_overlap(extent, chunk) {
                    return Err(MemError::Overlap {
                        chunk,
                        other,
                        space,
                        base,
                        end: extent.end,
                    });
                }
            }
        }

        let c = self.chunk_mut(chunk)?;
        c.reserved = new_size;
        c.pages.resize_with((new_size / page) as usize, || None);
        let mapped: Vec<SpaceId> = c.mapped_in.iter().copied().collect();
        for space in mapped {
            if let Some(s) = self.spaces.get_mut(&space) {
                s.map.set_len(base, new_size);
            }
        }
        if region.is_global() {
            self.global.set_len(base, new_size);
        }
        Ok(())
    }

    pub fn protect(&mut self, chunk: ChunkId, perms: Perms) -> Result<()> {
        self.chunk_mut(chunk)?.perms = perms;
        Ok(())
    }

    /// Resolve one guest address in `space` for an access of `access` kind.
    pub fn translate(
        &self,
        space: SpaceId,
        addr: u64,
        access: AccessType,
    ) -> std::result::Result<Translation, MemFault> {
        let s = self
            .spaces
            .get(&space)
            .ok_or(MemFault::unmapped(addr, access))?;
        let (base, id) = s
            .map
            .lookup(addr)
            .ok_or(MemFault::unmapped(addr, access))?;
        let c = self
            .chunks
            .get(&id)
            .ok_or(MemFault::unmapped(addr, access))?;
        let offset = addr - base;
        if !c.is_page_committed(offset) {
            return Err(MemFault::unmapped(addr, access));
        }
        let needed = match access {
            AccessType::Read => Perms::READ,
            AccessType::Write => Perms::WRITE,
            AccessType::Execute => Perms::EXECUTE,
        };
        if !c.perms.contains(needed) {
            return Err(MemFault::protection(addr, access));
        }
        Ok(Translation { chunk: id, offset })
    }

    /// Host bytes from `addr` to the end of its page.
    pub fn host_slice(
        &self,
        space: SpaceId,
        addr: u64,
        access: AccessType,
    ) -> std::result::Result<&[u8], MemFault> {
        let t = self.translate(space, addr, access)?;
        let page = self.config.page_size;
        let c = &self.chunks[&t.chunk];
        let bytes = c
            .page((t.offset / page) as usize)
            .ok_or(MemFault::unmapped(addr, access))?;
        Ok(&bytes[(t.offset % page) as usize..])
    }

    fn host_slice_mut(
        &mut self,
        space: SpaceId,
        addr: u64,
        access: AccessType,
    ) -> std::result::Result<&mut [u8], MemFault> {
        let t = self.translate(space, addr, access)?;
        let page = self.config.page_size;
        let c = self
            .chunks
            .get_mut(&t.chunk)
            .ok_or(MemFault::unmapped(addr, access))?;
        let bytes = c
            .page_mut((t.offset / page) as usize)
            .ok_or(MemFault::unmapped(addr, access))?;
        Ok(&mut bytes[(t.offset % page) as usize..])
    }

    /// Check every page touched by `[addr, addr + len)` before any byte moves, so a faulting
    /// access never has partial effects.
    pub fn validate(
        &self,
        space: SpaceId,
        addr: u64,
        len: usize,
        access: AccessType,
    ) -> std::result::Result<(), MemFault> {
        if len == 0 {
            return Ok(());
        }
        let page = self.config.page_size;
        let end = addr
            .checked_add(len as u64)
            .ok_or(MemFault::unmapped(addr, access))?;
        let mut cur = addr;
        while cur < end {
            self.translate(space, cur, access)?;
            cur = align_down(cur, page) + page;
        }
        Ok(())
    }

    pub fn read(
        &self,
        space: SpaceId,
        addr: u64,
        dst: &mut [u8],
    ) -> std::result::Result<(), MemFault> {
        self.read_as(space, addr, dst, AccessType::Read)
    }

    /// Read with an explicit access kind; instruction fetch uses [`AccessType::Execute`].
    pub fn read_as(
        &self,
        space: SpaceId,
        addr: u64,
        dst: &mut [u8],
        access: AccessType,
    ) -> std::result::Result<(), MemFault> {
        self.validate(space, addr, dst.len(), access)?;
        let mut done = 0usize;
        while done < dst.len() {
            let src = self.host_slice(space, addr + done as u64, access)?;
            let n = src.len().min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&src[..n]);
            done += n;
        }
        Ok(())
    }

    pub fn write(
        &mut self,
        space: SpaceId,
        addr: u64,
        src: &[u8],
    ) -> std::result::Result<(), MemFault> {
        self.validate(space, addr, src.len(), AccessType::Write)?;
        let mut done = 0usize;
        while done < src.len() {
            let dst = self.host_slice_mut(space, addr + done as u64, AccessType::Write)?;
            let n = dst.len().min(src.len() - done);
            dst[..n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write into a chunk by offset, ignoring its protection. Used by loaders to populate code.
    pub fn write_chunk(&mut self, chunk: ChunkId, offset: u64, src: &[u8]) -> Result<()> {
        let page = self.config.page_size;
        let c = self.chunk_mut(chunk)?;
        let end = offset
            .checked_add(src.len() as u64)
            .filter(|&end| end <= c.reserved)
            .ok_or(MemError::OutOfRange {
                chunk,
                offset,
                size: src.len() as u64,
                reserved: c.reserved,
            })?;
        let base = c.base;
        let mut cur = offset;
        while cur < end {
            if !c.is_page_committed(cur) {
                return Err(MemFault::unmapped(base + cur, AccessType::Write).into());
            }
            cur = align_down(cur, page) + page;
        }
        let mut done = 0usize;
        while done < src.len() {
            let at = offset + done as u64;
            let bytes = c
                .page_mut((at / page) as usize)
                .ok_or(MemFault::unmapped(base + at, AccessType::Write))?;
            let start = (at % page) as usize;
            let n = (bytes.len() - start).min(src.len() - done);
            bytes[start..start + n].copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn install_chunk(&mut self, chunk: Chunk) {
        self.committed_bytes += chunk.committed_size();
        self.chunks.insert(chunk.id, chunk);
    }
}

macro_rules! typed_access {
    ($read:ident, $write:ident, $ty:ty) => {
        impl MemorySystem {
            pub fn $read(&self, space: SpaceId, addr: u64) -> std::result::Result<$ty, MemFault> {
                const N: usize = core::mem::size_of::<$ty>();
                if addr % N as u64 != 0 {
                    return Err(MemFault::unaligned(addr, AccessType::Read));
                }
                let mut buf = [0u8; N];
                self.read(space, addr, &mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            pub fn $write(
                &mut self,
                space: SpaceId,
                addr: u64,
                value: $ty,
            ) -> std::result::Result<(), MemFault> {
                const N: usize = core::mem::size_of::<$ty>();
                if addr % N as u64 != 0 {
                    return Err(MemFault::unaligned(addr, AccessType::Write));
                }
                self.write(space, addr, &value.to_le_bytes())
            }
        }
    };
}

typed_access!(read_u8, write_u8, u8);
typed_access!(read_u16, write_u16, u16);
typed_access!(read_u32, write_u32, u32);
typed_access!(read_u64, write_u64, u64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::layout::Region;

    fn small() -> MemorySystem {
        MemorySystem::new(MemoryConfig {
            max_committed_bytes: 16 * PAGE_SIZE,
            ..MemoryConfig::default()
        })
    }

    #[test]
    fn reserve_places_chunks_at_first_free_address() {
        let mut mem = small();
        let space = mem.create_space();
        let a = mem.reserve(space, ChunkSpec::local("a", 0x1800)).unwrap();
        let b = mem.reserve(space, ChunkSpec::local("b", 0x1000)).unwrap();

        let layout = MemoryLayout::default();
        assert_eq!(mem.chunk(a).unwrap().base(), layout.local.start);
        assert_eq!(mem.chunk(a).unwrap().reserved_size(), 0x2000);
        assert_eq!(mem.chunk(b).unwrap().base(), layout.local.start + 0x2000);
    }

    #[test]
    fn local_regions_are_private_per_space() {
        let mut mem = small();
        let s1 = mem.create_space();
        let s2 = mem.create_space();
        let a = mem.reserve(s1, ChunkSpec::local("a", 0x1000)).unwrap();
        let b = mem.reserve(s2, ChunkSpec::local("b", 0x1000)).unwrap();
        assert_eq!(mem.chunk(a).unwrap().base(), mem.chunk(b).unwrap().base());

        mem.commit(a, 0, 0x1000).unwrap();
        let base = mem.chunk(a).unwrap().base();
        mem.write_u32(s1, base, 7).unwrap();
        let err = mem.read_u32(s2, base).unwrap_err();
        assert_eq!(err.kind, FaultKind::Unmapped);
    }

    #[test]
    fn reserve_fails_when_region_is_full() {
        let mut mem = small();
        let space = mem.create_space();
        let size = MemoryLayout::default().code.len() + PAGE_SIZE;
        let err = mem.reserve(space, ChunkSpec::code("huge", size)).unwrap_err();
        assert_eq!(
            err,
            MemError::OutOfAddressSpace {
                region: Region::Code,
                size
            }
        );
    }

    #[test]
    fn commit_over_budget_leaves_nothing_behind() {
        let mut mem = small();
        let space = mem.create_space();
        let c = mem.reserve(space, ChunkSpec::local("c", 32 * PAGE_SIZE)).unwrap();
        mem.commit(c, 0, 4 * PAGE_SIZE).unwrap();

        let err = mem.commit(c, 0, 32 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, MemError::OutOfMemory { .. }));
        assert_eq!(mem.chunk(c).unwrap().committed_size(), 4 * PAGE_SIZE);
        assert_eq!(mem.committed_bytes(), 4 * PAGE_SIZE);
        assert!(!mem.chunk(c).unwrap().is_page_committed(4 * PAGE_SIZE));
    }

    #[test]
    fn code_is_not_writable_by_the_guest() {
        let mut mem = small();
        let space = mem.create_space();
        let code = mem.reserve(space, ChunkSpec::code("text", 0x1000)).unwrap();
        mem.commit(code, 0, 0x1000).unwrap();
        mem.write_chunk(code, 0, &[0xE1, 0xA0]).unwrap();
        let base = mem.chunk(code).unwrap().base();

        let err = mem.write_u8(space, base, 0).unwrap_err();
        assert_eq!(err.kind, FaultKind::ProtectionViolation);
        let mut fetched = [0u8; 2];
        mem.read_as(space, base, &mut fetched, AccessType::Execute)
            .unwrap();
        assert_eq!(fetched, [0xE1, 0xA0]);
    }

    #[test]
    fn data_is_not_executable() {
        let mut mem = small();
        let space = mem.create_space();
        let c = mem.reserve(space, ChunkSpec::local("heap", 0x1000)).unwrap();
        mem.commit(c, 0, 0x1000).unwrap();
        let base = mem.chunk(c).unwrap().base();
        let mut buf = [0u8; 4];
        let err = mem
            .read_as(space, base, &mut buf, AccessType::Execute)
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::ProtectionViolation);
    }

    #[test]
    fn typed_access_requires_natural_alignment() {
        let mut mem = small();
        let space = mem.create_space();
        let c = mem.reserve(space, ChunkSpec::local("c", 0x1000)).unwrap();
        mem.commit(c, 0, 0x1000).unwrap();
        let base = mem.chunk(c).unwrap().base();
        assert_eq!(
            mem.read_u32(space, base + 2).unwrap_err().kind,
            FaultKind::Unaligned
        );
        mem.write_u16(space, base + 2, 0xBEEF).unwrap();
        assert_eq!(mem.read_u16(space, base + 2).unwrap(), 0xBEEF);
    }

    #[test]
    fn faulting_write_has_no_partial_effect() {
        let mut mem = small();
        let space = mem.create_space();
        let c = mem.reserve(space, ChunkSpec::local("c", 0x2000)).unwrap();
        mem.commit(c, 0, 0x1000).unwrap();
        let base = mem.chunk(c).unwrap().base();

        let err = mem.write(space, base + 0xFFE, &[1, 2, 3, 4]).unwrap_err();
        assert_eq!(err.addr, base + 0x1000);
        assert_eq!(mem.read_u16(space, base + 0xFFE).unwrap(), 0);
    }

    #[test]
    fn shared_chunk_is_visible_at_same_address_everywhere() {
        let mut mem = small();
        let s1 = mem.create_space();
        let s2 = mem.create_space();
        let shared = mem.reserve(s1, ChunkSpec::shared("ipc", 0x1000)).unwrap();
        mem.commit(shared, 0, 0x1000).unwrap();
        mem.attach(shared, s2).unwrap();
        let base = mem.chunk(shared).unwrap().base();

        mem.write_u32(s1, base + 8, 0x1234_5678).unwrap();
        assert_eq!(mem.read_u32(s2, base + 8).unwrap(), 0x1234_5678);

        assert_eq!(
            mem.attach(shared, s2).unwrap_err(),
            MemError::AlreadyAttached {
                chunk: shared,
                space: s2
            }
        );
    }

    #[test]
    fn destroying_a_space_keeps_attached_global_chunks() {
        let mut mem = small();
        let s1 = mem.create_space();
        let s2 = mem.create_space();
        let shared = mem.reserve(s1, ChunkSpec::shared("ipc", 0x1000)).unwrap();
        let local = mem.reserve(s1, ChunkSpec::local("heap", 0x1000)).unwrap();
        mem.commit(local, 0, 0x1000).unwrap();
        mem.attach(shared, s2).unwrap();

        mem.destroy_space(s1).unwrap();
        assert!(mem.chunk(local).is_err());
        assert_eq!(mem.committed_bytes(), 0);
        let c = mem.chunk(shared).unwrap();
        assert_eq!(c.mapped_in().collect::<Vec<_>>(), vec![s2]);
    }

    #[test]
    fn adjust_moves_the_committed_top() {
        let mut mem = small();
        let space = mem.create_space();
        let c = mem.reserve(space, ChunkSpec::local("heap", 8 * PAGE_SIZE)).unwrap();
        mem.adjust(c, 3 * PAGE_SIZE - 1).unwrap();
        assert_eq!(mem.chunk(c).unwrap().committed_size(), 3 * PAGE_SIZE);
        mem.adjust(c, PAGE_SIZE).unwrap();
        assert_eq!(mem.chunk(c).unwrap().committed_size(), PAGE_SIZE);
        assert!(mem.adjust(c, 9 * PAGE_SIZE).is_err());
    }

    #[test]
    fn growing_into_a_neighbour_is_an_invariant_violation() {
        let mut mem = small();
        let space = mem.create_space();
        let a = mem.reserve(space, ChunkSpec::local("a", PAGE_SIZE)).unwrap();
        let _b = mem.reserve(space, ChunkSpec::local("b", PAGE_SIZE)).unwrap();

        let err = mem.set_reserved_size(a, 2 * PAGE_SIZE).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert_eq!(mem.chunk(a).unwrap().reserved_size(), PAGE_SIZE);
    }

    #[test]
    fn shrinking_decommits_the_tail() {
        let mut mem = small();
        let space = mem.create_space();
        let a = mem.reserve(space, ChunkSpec::local("a", 4 * PAGE_SIZE)).unwrap();
        mem.commit(a, 0, 4 * PAGE_SIZE).unwrap();
        mem.set_reserved_size(a, 2 * PAGE_SIZE).unwrap();
        let c = mem.chunk(a).unwrap();
        assert_eq!(c.reserved_size(), 2 * PAGE_SIZE);
        assert_eq!(c.committed_size(), 2 * PAGE_SIZE);
        assert_eq!(mem.committed_bytes(), 2 * PAGE_SIZE);

        // The freed tail can now be reused by a new reservation.
        let b = mem.reserve(space, ChunkSpec::local("b", PAGE_SIZE)).unwrap();
        assert_eq!(mem.chunk(b).unwrap().base(), c_base(&mem, a) + 2 * PAGE_SIZE);
    }

    fn c_base(mem: &MemorySystem, id: ChunkId) -> u64 {
        mem.chunk(id).unwrap().base()
    }
}
