use std::collections::BTreeMap;

use ember_mem::ChunkId;

use crate::device::LogicalDevice;
use crate::error::{KernelError, Result};
use crate::ipc::{Server, Session};
use crate::process::Process;
use crate::sync::{Mutex, Semaphore, Timer};
use crate::thread::Thread;

/// Unique identity of a kernel object. Identities increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(pub u64);

/// The closed set of kernel object kinds. The discriminant doubles as the dispatch target tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ObjectKind {
    Process = 1,
    Thread = 2,
    Chunk = 3,
    Mutex = 4,
    Semaphore = 5,
    Timer = 6,
    Server = 7,
    Session = 8,
    LogicalDevice = 9,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 9] = [
        ObjectKind::Process,
        ObjectKind::Thread,
        ObjectKind::Chunk,
        ObjectKind::Mutex,
        ObjectKind::Semaphore,
        ObjectKind::Timer,
        ObjectKind::Server,
        ObjectKind::Session,
        ObjectKind::LogicalDevice,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

/// Kernel-side wrapper of an address-space chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkObject {
    pub chunk: ChunkId,
}

#[derive(Debug, Clone)]
pub enum KernelObject {
    Process(Process),
    Thread(Thread),
    Chunk(ChunkObject),
    Mutex(Mutex),
    Semaphore(Semaphore),
    Timer(Timer),
    Server(Server),
    Session(Session),
    LogicalDevice(LogicalDevice),
}

impl KernelObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            KernelObject::Process(_) => ObjectKind::Process,
            KernelObject::Thread(_) => ObjectKind::Thread,
            KernelObject::Chunk(_) => ObjectKind::Chunk,
            KernelObject::Mutex(_) => ObjectKind::Mutex,
            KernelObject::Semaphore(_) => ObjectKind::Semaphore,
            KernelObject::Timer(_) => ObjectKind::Timer,
            KernelObject::Server(_) => ObjectKind::Server,
            KernelObject::Session(_) => ObjectKind::Session,
            KernelObject::LogicalDevice(_) => ObjectKind::LogicalDevice,
        }
    }
}

/// Bookkeeping shared by every object kind.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub(crate) id: ObjectId,
    pub(crate) name: String,
    /// Owning process; `None` for global objects.
    pub(crate) owner: Option<ObjectId>,
    /// Live handles referring to this object across every handle table.
    pub(crate) refs: u32,
    /// Held alive by the host regardless of handles, e.g. a process started by the loader.
    pub(crate) pinned: bool,
    /// The object dropped its last handle while something still waited on it.
    pub(crate) pending_destroy: bool,
    pub(crate) body: KernelObject,
}

impl ObjectEntry {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<ObjectId> {
        self.owner
    }

    pub fn is_global(&self) -> bool {
        self.owner.is_none()
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn kind(&self) -> ObjectKind {
        self.body.kind()
    }

    pub fn body(&self) -> &KernelObject {
        &self.body
    }
}

/// Arena of every live kernel object keyed by identity. This is also the global table used for
/// cross-process lookups by identity or name.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    pub(crate) entries: BTreeMap<ObjectId, ObjectEntry>,
    pub(crate) next_id: u64,
    pub(crate) limit: usize,
}

macro_rules! typed_accessors {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty);)*) => {
        impl ObjectTable {
            $(
                pub fn $get(&self, id: ObjectId) -> Result<&$ty> {
                    match self.get(id)?.body {
                        KernelObject::$variant(ref v) => Ok(v),
                        ref other => Err(KernelError::InvariantViolation(format!(
                            "object {id:?} is a {:?}, expected {:?}",
                            other.kind(),
                            ObjectKind::$variant
                        ))),
                    }
                }

                pub fn $get_mut(&mut self, id: ObjectId) -> Result<&mut $ty> {
                    match self.get_mut(id)?.body {
                        KernelObject::$variant(ref mut v) => Ok(v),
                        ref other => Err(KernelError::InvariantViolation(format!(
                            "object {id:?} is a {:?}, expected {:?}",
                            other.kind(),
                            ObjectKind::$variant
                        ))),
                    }
                }
            )*
        }
    };
}

typed_accessors! {
    process, process_mut => Process(Process);
    thread, thread_mut => Thread(Thread);
    chunk, chunk_mut => Chunk(ChunkObject);
    mutex, mutex_mut => Mutex(Mutex);
    semaphore, semaphore_mut => Semaphore(Semaphore);
    timer, timer_mut => Timer(Timer);
    server, server_mut => Server(Server);
    session, session_mut => Session(Session);
    logical_device, logical_device_mut => LogicalDevice(LogicalDevice);
}

impl ObjectTable {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a new object and return its identity. The object starts with no handles.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        owner: Option<ObjectId>,
        body: KernelObject,
    ) -> Result<ObjectId> {
        if self.entries.len() >= self.limit {
            return Err(KernelError::ResourceExhausted("kernel object limit reached"));
        }
        let id = ObjectId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(KernelError::ResourceExhausted("object identities exhausted"))?;
        self.entries.insert(
            id,
            ObjectEntry {
                id,
                name: name.into(),
                owner,
                refs: 0,
                pinned: false,
                pending_destroy: false,
                body,
            },
        );
        Ok(id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Result<&ObjectEntry> {
        self.entries.get(&id).ok_or(KernelError::NoSuchObject(id))
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Result<&mut ObjectEntry> {
        self.entries.get_mut(&id).ok_or(KernelError::NoSuchObject(id))
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<ObjectEntry> {
        self.entries.remove(&id)
    }

    pub fn kind_of(&self, id: ObjectId) -> Result<ObjectKind> {
        Ok(self.get(id)?.kind())
    }

    /// Objects of `kind` in identity order.
    pub fn ids_of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries
            .values()
            .filter(move |e| e.kind() == kind)
            .map(|e| e.id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ObjectEntry> + '_ {
        self.entries.values()
    }

    /// Global object of `kind` called `name`.
    pub fn find_global(&self, kind: ObjectKind, name: &str) -> Option<ObjectId> {
        self.entries
            .values()
            .find(|e| e.is_global() && e.kind() == kind && e.name == name)
            .map(|e| e.id)
    }

    /// Any object of `kind` called `name`, preferring global objects.
    pub fn find_named(&self, kind: ObjectKind, name: &str) -> Option<ObjectId> {
        if name.is_empty() {
            return None;
        }
        self.find_global(kind, name).or_else(|| {
            self.entries
                .values()
                .find(|e| e.kind() == kind && e.name == name)
                .map(|e| e.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: u64) -> KernelObject {
        KernelObject::Chunk(ChunkObject { chunk: ChunkId(n) })
    }

    #[test]
    fn identities_are_monotonic_and_not_reused() {
        let mut t = ObjectTable::new(16);
        let a = t.insert("a", None, chunk(1)).unwrap();
        t.remove(a);
        let b = t.insert("b", None, chunk(2)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn limit_is_resource_exhaustion() {
        let mut t = ObjectTable::new(1);
        t.insert("", None, chunk(1)).unwrap();
        assert_eq!(
            t.insert("", None, chunk(2)).unwrap_err(),
            KernelError::ResourceExhausted("kernel object limit reached")
        );
    }

    #[test]
    fn typed_accessor_rejects_wrong_kind() {
        let mut t = ObjectTable::new(4);
        let c = t.insert("", None, chunk(1)).unwrap();
        assert!(t.chunk(c).is_ok());
        assert!(t.mutex(c).unwrap_err().is_fatal());
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in ObjectKind::ALL {
            assert_eq!(ObjectKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ObjectKind::from_tag(0), None);
    }
}
