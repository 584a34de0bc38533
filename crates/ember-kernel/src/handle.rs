use core::fmt;
use std::collections::VecDeque;

use crate::error::{KernelError, Result};
use crate::object::ObjectId;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const MAX_GENERATION: u16 = 0x7FFF;
const PSEUDO_BIT: u32 = 1 << 31;

/// Process-scoped reference to a kernel object, as seen by guest code.
///
/// Table handles pack a slot index in the low 16 bits and the slot's generation above it; bit 31
/// is reserved for pseudo-handles. `0` is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);
    /// Always refers to the calling process.
    pub const CURRENT_PROCESS: Handle = Handle(0xFFFF_8000);
    /// Always refers to the calling thread.
    pub const CURRENT_THREAD: Handle = Handle(0xFFFF_8001);

    fn new(index: u16, generation: u16) -> Self {
        Handle((u32::from(generation) << INDEX_BITS) | u32::from(index))
    }

    pub fn is_pseudo(self) -> bool {
        self.0 & PSEUDO_BIT != 0
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    fn generation(self) -> u16 {
        (self.0 >> INDEX_BITS) as u16
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct HandleSlot {
    pub(crate) generation: u16,
    pub(crate) object: Option<ObjectId>,
}

/// One process's handle table.
///
/// A closed slot's generation is bumped before the slot is reused, so a stale handle value never
/// resolves again. Slots whose generation would wrap are retired for good.
#[derive(Debug, Clone)]
pub struct HandleTable {
    /// Slot 0 is a permanent placeholder so that no handle encodes to 0.
    pub(crate) slots: Vec<HandleSlot>,
    pub(crate) free: VecDeque<u16>,
    pub(crate) live: usize,
    pub(crate) capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![HandleSlot::default()],
            free: VecDeque::new(),
            live: 0,
            capacity: capacity.min(INDEX_MASK as usize),
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&mut self, object: ObjectId) -> Result<Handle> {
        if self.live >= self.capacity {
            return Err(KernelError::ResourceExhausted("handle table full"));
        }
        let index = match self.free.pop_front() {
            Some(index) => index,
            None => {
                let index = u16::try_from(self.slots.len())
                    .map_err(|_| KernelError::ResourceExhausted("handle table full"))?;
                self.slots.push(HandleSlot {
                    generation: 1,
                    object: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.object = Some(object);
        self.live += 1;
        Ok(Handle::new(index, slot.generation))
    }

    fn slot(&self, handle: Handle) -> Option<&HandleSlot> {
        if handle.is_pseudo() || handle.index() == 0 {
            return None;
        }
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation() && s.object.is_some())
    }

    pub fn get(&self, handle: Handle) -> Result<ObjectId> {
        self.slot(handle)
            .and_then(|s| s.object)
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub fn remove(&mut self, handle: Handle) -> Result<ObjectId> {
        let object = self.get(handle)?;
        let index = handle.index();
        let slot = &mut self.slots[index];
        slot.object = None;
        self.live -= 1;
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            self.free.push_back(index as u16);
        }
        Ok(object)
    }

    /// Every live handle referring to `object`.
    pub fn handles_of(&self, object: ObjectId) -> Vec<Handle> {
        self.iter()
            .filter(|(_, o)| *o == object)
            .map(|(h, _)| h)
            .collect()
    }

    /// Live `(handle, object)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, ObjectId)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.object
                .map(|object| (Handle::new(index as u16, slot.generation), object))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_handle_is_stale_even_after_slot_reuse() {
        let mut t = HandleTable::new(8);
        let a = t.insert(ObjectId(1)).unwrap();
        t.remove(a).unwrap();
        let b = t.insert(ObjectId(2)).unwrap();
        assert_ne!(a, b);
        assert!(matches!(t.get(a), Err(KernelError::InvalidHandle(_))));
        assert_eq!(t.get(b).unwrap(), ObjectId(2));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut t = HandleTable::new(2);
        t.insert(ObjectId(1)).unwrap();
        t.insert(ObjectId(1)).unwrap();
        assert_eq!(
            t.insert(ObjectId(1)).unwrap_err(),
            KernelError::ResourceExhausted("handle table full")
        );
    }

    #[test]
    fn null_and_pseudo_handles_never_resolve_from_the_table() {
        let mut t = HandleTable::new(4);
        t.insert(ObjectId(9)).unwrap();
        assert!(t.get(Handle::NULL).is_err());
        assert!(t.get(Handle::CURRENT_THREAD).is_err());
        assert!(Handle::CURRENT_PROCESS.is_pseudo());
    }

    #[test]
    fn exhausted_generation_retires_slot() {
        let mut t = HandleTable::new(4);
        let mut h = t.insert(ObjectId(1)).unwrap();
        for _ in 1..MAX_GENERATION {
            t.remove(h).unwrap();
            h = t.insert(ObjectId(1)).unwrap();
        }
        assert_eq!(h.generation(), MAX_GENERATION);
        t.remove(h).unwrap();
        let next = t.insert(ObjectId(1)).unwrap();
        assert_ne!(next.index(), h.index());
    }
}
