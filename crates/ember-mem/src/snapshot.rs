use std::collections::BTreeSet;

use ember_snapshot::{Absorb, Mode, SectionTag, Snapshot, SnapshotError, StateSerializer};

use crate::chunk::{Backing, Chunk, ChunkId, SpaceId};
use crate::layout::{AddrRange, Perms, Region};
use crate::manager::MemorySystem;
use crate::space::{AddressSpace, RangeMap};

const MEMORY_SECTION_VERSION: u16 = 1;
const MAX_SPACES: usize = 1 << 16;
const MAX_CHUNKS: usize = 1 << 20;

#[derive(Debug, Default)]
struct ChunkRecord {
    id: u64,
    name: String,
    base: u64,
    reserved: u64,
    perms: u8,
    region: u8,
    backing: u8,
    backing_path: String,
    owner: Option<u64>,
    mapped_in: Vec<u64>,
    page_indices: Vec<u32>,
    /// Committed pages back to back, in `page_indices` order.
    page_data: Vec<u8>,
}

impl ChunkRecord {
    fn capture(chunk: &Chunk) -> Self {
        let mut page_indices = Vec::with_capacity(chunk.committed_pages);
        let mut page_data = Vec::with_capacity(chunk.committed_size() as usize);
        for (idx, bytes) in chunk.committed() {
            page_indices.push(idx as u32);
            page_data.extend_from_slice(bytes);
        }
        let backing_path = match &chunk.backing {
            Backing::MappedFile { path } => path.clone(),
            _ => String::new(),
        };
        Self {
            id: chunk.id.0,
            name: chunk.name.clone(),
            base: chunk.base,
            reserved: chunk.reserved,
            perms: chunk.perms.bits(),
            region: chunk.region.to_u8(),
            backing: chunk.backing.tag(),
            backing_path,
            owner: chunk.owner.map(|s| s.0),
            mapped_in: chunk.mapped_in.iter().map(|s| s.0).collect(),
            page_indices,
            page_data,
        }
    }

    fn rebuild(self, page_size: u64) -> ember_snapshot::Result<Chunk> {
        let perms = Perms::from_bits(self.perms)
            .ok_or(SnapshotError::Corrupt("invalid chunk permissions"))?;
        let region =
            Region::from_u8(self.region).ok_or(SnapshotError::Corrupt("invalid chunk region"))?;
        let backing = match self.backing {
            0 => Backing::Normal,
            1 => Backing::Shared,
            2 => Backing::MappedFile {
                path: self.backing_path,
            },
            _ => return Err(SnapshotError::Corrupt("invalid chunk backing")),
        };
        if self.reserved == 0 || self.reserved % page_size != 0 || self.base % page_size != 0 {
            return Err(SnapshotError::Corrupt("chunk is not page aligned"));
        }
        let page_count = (self.reserved / page_size) as usize;
        let page_len = page_size as usize;
        if self.page_data.len() != self.page_indices.len() * page_len {
            return Err(SnapshotError::Corrupt("chunk page data length mismatch"));
        }
        let mut pages: Vec<Option<Box<[u8]>>> = (0..page_count).map(|_| None).collect();
        for (i, &idx) in self.page_indices.iter().enumerate() {
            let slot = pages
                .get_mut(idx as usize)
                .ok_or(SnapshotError::Corrupt("committed page outside reservation"))?;
            if slot.is_some() {
                return Err(SnapshotError::Corrupt("duplicate committed page"));
            }
            *slot = Some(
                self.page_data[i * page_len..(i + 1) * page_len]
                    .to_vec()
                    .into_boxed_slice(),
            );
        }
        let owner = self.owner.map(SpaceId);
        if region.is_global() != owner.is_none() {
            return Err(SnapshotError::Corrupt("chunk ownership does not match region"));
        }
        Ok(Chunk {
            id: ChunkId(self.id),
            name: self.name,
            base: self.base,
            reserved: self.reserved,
            perms,
            backing,
            region,
            owner,
            mapped_in: self.mapped_in.into_iter().map(SpaceId).collect(),
            committed_pages: self.page_indices.len(),
            pages,
            page_size,
        })
    }
}

impl Absorb for ChunkRecord {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<()> {
        s.absorb_u64(&mut self.id)?;
        s.absorb_string(&mut self.name)?;
        s.absorb_u64(&mut self.base)?;
        s.absorb_u64(&mut self.reserved)?;
        s.absorb_u8(&mut self.perms)?;
        s.absorb_u8(&mut self.region)?;
        s.absorb_u8(&mut self.backing)?;
        s.absorb_string(&mut self.backing_path)?;
        s.absorb(&mut self.owner)?;
        s.absorb_vec(&mut self.mapped_in, MAX_SPACES, |s, v| s.absorb_u64(v))?;
        s.absorb_vec(&mut self.page_indices, MAX_CHUNKS, |s, v| s.absorb_u32(v))?;
        s.absorb_compressed(&mut self.page_data)
    }
}

impl MemorySystem {
    /// Build a fresh memory system from decoded records, checking every cross-reference and
    /// the no-overlap invariant before anything live is touched.
    fn from_records(
        &self,
        next_space: u64,
        next_chunk: u64,
        space_ids: Vec<u64>,
        records: Vec<ChunkRecord>,
    ) -> ember_snapshot::Result<MemorySystem> {
        let mut out = MemorySystem::new(self.config.clone());
        out.next_space = next_space;
        out.next_chunk = next_chunk;
        for id in space_ids {
            if id == 0 || id >= next_space {
                return Err(SnapshotError::Corrupt("address space id out of range"));
            }
            let id = SpaceId(id);
            if out.spaces.insert(id, AddressSpace::new(id)).is_some() {
                return Err(SnapshotError::Corrupt("duplicate address space"));
            }
        }

        let page = self.config.page_size;
        let mut seen = BTreeSet::new();
        for record in records {
            let chunk = record.rebuild(page)?;
            if chunk.id.0 == 0 || chunk.id.0 >= next_chunk || !seen.insert(chunk.id) {
                return Err(SnapshotError::Corrupt("chunk id out of range"));
            }
            let end = chunk
                .base
                .checked_add(chunk.reserved)
                .ok_or(SnapshotError::Corrupt("chunk extent overflows"))?;
            let extent = AddrRange::new(chunk.base, end);
            let within = self.config.layout.range(chunk.region);
            if extent.start < within.start || extent.end > within.end {
                return Err(SnapshotError::Corrupt("chunk outside its region"));
            }
            if let Some(owner) = chunk.owner {
                if !out.spaces.contains_key(&owner) {
                    return Err(SnapshotError::DanglingReference {
                        what: "chunk owner",
                        id: owner.0,
                    });
                }
            }
            if chunk.region.is_global() {
                insert_disjoint(&mut out.global, extent, chunk.id)?;
            }
            for space in &chunk.mapped_in {
                let s = out
                    .spaces
                    .get_mut(space)
                    .ok_or(SnapshotError::DanglingReference {
                        what: "chunk mapping",
                        id: space.0,
                    })?;
                insert_disjoint(&mut s.map, extent, chunk.id)?;
            }
            out.install_chunk(chunk);
        }
        if out.committed_bytes > out.config.max_committed_bytes {
            return Err(SnapshotError::Corrupt("committed memory exceeds the budget"));
        }
        Ok(out)
    }
}

fn insert_disjoint(map: &mut RangeMap, extent: AddrRange, id: ChunkId) -> ember_snapshot::Result<()> {
    if map.find_overlap(extent, id).is_some() {
        return Err(SnapshotError::Corrupt("overlapping chunks"));
    }
    map.insert(extent.start, id, extent.len());
    Ok(())
}

impl MemorySystem {
    /// Walk the body of a memory section. In read mode the decoded state is returned as a new
    /// memory system and `self` is left alone.
    fn walk(&self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<Option<MemorySystem>> {
        let mut page_size = self.config.page_size;
        s.absorb_u64(&mut page_size)?;
        if page_size != self.config.page_size {
            return Err(SnapshotError::Corrupt("page size mismatch"));
        }
        let mut next_space = self.next_space;
        let mut next_chunk = self.next_chunk;
        s.absorb_u64(&mut next_space)?;
        s.absorb_u64(&mut next_chunk)?;

        let mut space_ids: Vec<u64> = self.spaces.keys().map(|id| id.0).collect();
        s.absorb_vec(&mut space_ids, MAX_SPACES, |s, v| s.absorb_u64(v))?;

        let mut records: Vec<ChunkRecord> = match s.mode() {
            Mode::Write => self.chunks.values().map(ChunkRecord::capture).collect(),
            Mode::Read => Vec::new(),
        };
        s.absorb_vec(&mut records, MAX_CHUNKS, |s, r| s.absorb(r))?;

        if s.is_reading() {
            return self
                .from_records(next_space, next_chunk, space_ids, records)
                .map(Some);
        }
        Ok(None)
    }

    /// Decode and validate a memory section without applying it. The caller swaps the result in
    /// once everything else in the image has been validated too.
    pub fn stage_restore(&self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<MemorySystem> {
        if !s.is_reading() {
            return Err(SnapshotError::WrongMode {
                required: Mode::Read,
                actual: s.mode(),
            });
        }
        let mut staged = None;
        s.section(SectionTag::MEMORY, MEMORY_SECTION_VERSION, |s, _version| {
            staged = self.walk(s)?;
            Ok(())
        })?;
        staged.ok_or(SnapshotError::Corrupt("memory section produced no state"))
    }
}

impl Snapshot for MemorySystem {
    fn do_state(&mut self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<()> {
        match s.mode() {
            Mode::Write => s.section(SectionTag::MEMORY, MEMORY_SECTION_VERSION, |s, _version| {
                self.walk(s).map(|_| ())
            }),
            Mode::Read => {
                *self = self.stage_restore(s)?;
                Ok(())
            }
        }
    }
}
