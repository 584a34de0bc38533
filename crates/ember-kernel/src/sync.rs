//! Synchronisation objects. The blocking and waking logic lives on [`Kernel`](crate::Kernel);
//! these types only hold state.

use crate::object::ObjectId;

#[derive(Debug, Clone, Default)]
pub struct Mutex {
    pub(crate) holder: Option<ObjectId>,
    /// Recursive acquisition depth of the holder.
    pub(crate) count: u32,
    /// Blocked threads in arrival order.
    pub(crate) waiters: Vec<ObjectId>,
}

impl Mutex {
    pub fn holder(&self) -> Option<ObjectId> {
        self.holder
    }

    pub fn waiters(&self) -> &[ObjectId] {
        &self.waiters
    }
}

#[derive(Debug, Clone, Default)]
pub struct Semaphore {
    pub(crate) count: i32,
    pub(crate) waiters: Vec<ObjectId>,
}

impl Semaphore {
    pub(crate) fn new(count: i32) -> Self {
        Self {
            count,
            waiters: Vec::new(),
        }
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn waiters(&self) -> &[ObjectId] {
        &self.waiters
    }
}

/// A one-shot request issued through a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    /// Thread whose request semaphore is signalled on completion.
    pub thread: ObjectId,
    /// Guest address of the request status word.
    pub status_addr: u32,
    pub deadline_us: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Timer {
    pub(crate) pending: Option<TimerRequest>,
}

impl Timer {
    pub fn pending(&self) -> Option<TimerRequest> {
        self.pending
    }
}
