use std::collections::BTreeSet;

use crate::layout::{AddrRange, Perms, Region};

/// Stable identity of a chunk inside a [`MemorySystem`](crate::MemorySystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChunkId(pub u64);

/// Stable identity of an address space inside a [`MemorySystem`](crate::MemorySystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SpaceId(pub u64);

/// Where a chunk's committed pages come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backing {
    #[default]
    Normal,
    /// Global memory intended to be attached by several processes.
    Shared,
    /// Pages populated from a file by the loader; the file itself is an external collaborator.
    MappedFile { path: String },
}

impl Backing {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Backing::Normal => 0,
            Backing::Shared => 1,
            Backing::MappedFile { .. } => 2,
        }
    }
}

/// Parameters for [`MemorySystem::reserve`](crate::MemorySystem::reserve).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    pub name: String,
    pub region: Region,
    /// Reserved size in bytes; rounded up to whole pages.
    pub size: u64,
    /// Base alignment; must be a power of two. Values below the page size are raised to it.
    pub align: u64,
    pub perms: Perms,
    pub backing: Backing,
}

impl ChunkSpec {
    /// A private read/write chunk (heap, stack, local chunk).
    pub fn local(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            region: Region::Local,
            size,
            align: 0,
            perms: Perms::DATA,
            backing: Backing::Normal,
        }
    }

    /// A global read/write chunk visible to every process that attaches it.
    pub fn shared(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            region: Region::Shared,
            size,
            align: 0,
            perms: Perms::DATA,
            backing: Backing::Shared,
        }
    }

    /// A global read/execute chunk for loaded code.
    pub fn code(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            region: Region::Code,
            size,
            align: 0,
            perms: Perms::CODE,
            backing: Backing::Normal,
        }
    }

    pub fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    pub fn with_perms(mut self, perms: Perms) -> Self {
        self.perms = perms;
        self
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }
}

/// A contiguous virtual region with page-granular commit state.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(crate) id: ChunkId,
    pub(crate) name: String,
    pub(crate) base: u64,
    pub(crate) reserved: u64,
    pub(crate) perms: Perms,
    pub(crate) backing: Backing,
    pub(crate) region: Region,
    /// Owning address space for [`Region::Local`] chunks; `None` for global chunks.
    pub(crate) owner: Option<SpaceId>,
    pub(crate) mapped_in: BTreeSet<SpaceId>,
    pub(crate) pages: Vec<Option<Box<[u8]>>>,
    pub(crate) committed_pages: usize,
    pub(crate) page_size: u64,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn reserved_size(&self) -> u64 {
        self.reserved
    }

    pub fn committed_size(&self) -> u64 {
        self.committed_pages as u64 * self.page_size
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn owner(&self) -> Option<SpaceId> {
        self.owner
    }

    pub fn range(&self) -> AddrRange {
        AddrRange::new(self.base, self.base + self.reserved)
    }

    /// Address spaces this chunk is currently mapped into.
    pub fn mapped_in(&self) -> impl Iterator<Item = SpaceId> + '_ {
        self.mapped_in.iter().copied()
    }

    pub fn is_page_committed(&self, offset: u64) -> bool {
        let idx = (offset / self.page_size) as usize;
        matches!(self.pages.get(idx), Some(Some(_)))
    }

    /// End offset of the highest committed page, or 0 when nothing is committed.
    pub fn top(&self) -> u64 {
        self.pages
            .iter()
            .rposition(Option::is_some)
            .map(|idx| (idx as u64 + 1) * self.page_size)
            .unwrap_or(0)
    }

    /// Committed pages in ascending order as `(page_index, contents)`.
    pub fn committed(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(idx, page)| page.as_deref().map(|bytes| (idx, bytes)))
    }

    pub(crate) fn page(&self, idx: usize) -> Option<&[u8]> {
        self.pages.get(idx).and_then(|p| p.as_deref())
    }

    pub(crate) fn page_mut(&mut self, idx: usize) -> Option<&mut [u8]> {
        self.pages.get_mut(idx).and_then(|p| p.as_deref_mut())
    }
}
