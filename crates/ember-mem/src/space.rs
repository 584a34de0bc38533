use std::collections::BTreeMap;

use crate::chunk::{ChunkId, SpaceId};
use crate::layout::{align_up, AddrRange};

/// Non-overlapping `base -> (chunk, len)` map used both for address spaces and for the global
/// allocation table of shared/code chunks.
#[derive(Debug, Clone, Default)]
pub(crate) struct RangeMap {
    entries: BTreeMap<u64, (ChunkId, u64)>,
}

impl RangeMap {
    pub(crate) fn lookup(&self, addr: u64) -> Option<(u64, ChunkId)> {
        let (&base, &(id, len)) = self.entries.range(..=addr).next_back()?;
        (addr < base + len).then_some((base, id))
    }

    /// First chunk other than `except` intersecting `range`.
    pub(crate) fn find_overlap(&self, range: AddrRange, except: ChunkId) -> Option<ChunkId> {
        self.entries
            .range(..range.end)
            .rev()
            // Entries are disjoint and sorted, so their end addresses increase with base too.
            .take_while(|(&base, &(_, len))| base + len > range.start)
            .find(|(_, &(id, _))| id != except)
            .map(|(_, &(id, _))| id)
    }

    /// Lowest `align`-aligned base inside `within` where `size` bytes are free.
    pub(crate) fn find_free(&self, within: AddrRange, size: u64, align: u64) -> Option<u64> {
        let mut candidate = align_up(within.start, align)?;
        for (&base, &(_, len)) in self.entries.range(within.start..within.end) {
            if candidate.checked_add(size)? <= base {
                break;
            }
            candidate = align_up(candidate.max(base + len), align)?;
        }
        (candidate.checked_add(size)? <= within.end).then_some(candidate)
    }

    pub(crate) fn insert(&mut self, base: u64, id: ChunkId, len: u64) {
        self.entries.insert(base, (id, len));
    }

    pub(crate) fn set_len(&mut self, base: u64, len: u64) {
        if let Some(entry) = self.entries.get_mut(&base) {
            entry.1 = len;
        }
    }

    pub(crate) fn remove(&mut self, base: u64) -> Option<ChunkId> {
        self.entries.remove(&base).map(|(id, _)| id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, ChunkId, u64)> + '_ {
        self.entries.iter().map(|(&base, &(id, len))| (base, id, len))
    }
}

/// One process's view of guest virtual memory.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    pub(crate) id: SpaceId,
    pub(crate) map: RangeMap,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId) -> Self {
        Self {
            id,
            map: RangeMap::default(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Chunks mapped into this space, ordered by base address.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.map.iter().map(|(_, id, _)| id)
    }

    /// The chunk covering `addr`, if any.
    pub fn chunk_at(&self, addr: u64) -> Option<ChunkId> {
        self.map.lookup(addr).map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_free_skips_occupied_ranges() {
        let mut map = RangeMap::default();
        let within = AddrRange::new(0x1000, 0x10000);
        map.insert(0x1000, ChunkId(1), 0x2000);
        map.insert(0x4000, ChunkId(2), 0x1000);

        assert_eq!(map.find_free(within, 0x1000, 0x1000), Some(0x3000));
        assert_eq!(map.find_free(within, 0x2000, 0x1000), Some(0x5000));
        assert_eq!(map.find_free(within, 0x2000, 0x4000), Some(0x8000));
        assert_eq!(map.find_free(within, 0x10000, 0x1000), None);
    }

    #[test]
    fn lookup_respects_chunk_end() {
        let mut map = RangeMap::default();
        map.insert(0x1000, ChunkId(7), 0x1000);
        assert_eq!(map.lookup(0x1000), Some((0x1000, ChunkId(7))));
        assert_eq!(map.lookup(0x1fff), Some((0x1000, ChunkId(7))));
        assert_eq!(map.lookup(0x2000), None);
        assert_eq!(map.lookup(0x0fff), None);
    }

    #[test]
    fn find_overlap_ignores_self() {
        let mut map = RangeMap::default();
        map.insert(0x1000, ChunkId(1), 0x1000);
        map.insert(0x3000, ChunkId(2), 0x1000);

        assert_eq!(
            map.find_overlap(AddrRange::new(0x1000, 0x3000), ChunkId(1)),
            None
        );
        assert_eq!(
            map.find_overlap(AddrRange::new(0x1000, 0x3001), ChunkId(1)),
            Some(ChunkId(2))
        );
    }
}
