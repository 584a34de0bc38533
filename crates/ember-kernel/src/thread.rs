use ember_mem::ChunkId;

use crate::object::ObjectId;

/// Number of general-purpose registers in a saved context.
pub const REG_COUNT: usize = 16;
/// Register holding the service selector on a service call.
pub const REG_SELECTOR: usize = 12;
pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;
pub const REG_PC: usize = 15;

/// Lowest and highest thread priorities. Larger numbers are more urgent.
pub const PRIORITY_MIN: u8 = 0;
pub const PRIORITY_MAX: u8 = 63;
pub const PRIORITY_COUNT: usize = PRIORITY_MAX as usize + 1;

/// Saved register file of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    pub regs: [u32; REG_COUNT],
    pub flags: u32,
}

impl Context {
    pub fn pc(&self) -> u32 {
        self.regs[REG_PC]
    }

    pub fn sp(&self) -> u32 {
        self.regs[REG_SP]
    }
}

/// Why a thread is not runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Waiting to acquire a mutex or take a semaphore count.
    Object(ObjectId),
    /// Waiting on its own request semaphore.
    Request,
    /// Sleeping until the guest clock reaches the deadline (microseconds).
    Sleep { until_us: u64 },
    /// Waiting for another thread to die.
    Join(ObjectId),
    /// Server thread waiting for the next message; `buffer` receives it.
    Receive { server: ObjectId, buffer: u32 },
    /// Client waiting for a message on the session to be completed.
    Reply(ObjectId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting(WaitReason),
    Suspended,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitKind {
    #[default]
    Exit,
    Kill,
    Panic,
}

impl ExitKind {
    pub fn to_u8(self) -> u8 {
        match self {
            ExitKind::Exit => 0,
            ExitKind::Kill => 1,
            ExitKind::Panic => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ExitKind::Exit),
            1 => Some(ExitKind::Kill),
            2 => Some(ExitKind::Panic),
            _ => None,
        }
    }
}

/// How a thread or process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub reason: i32,
}

#[derive(Debug, Clone)]
pub struct Thread {
    /// Owning process. A lookup key, not ownership.
    pub(crate) process: ObjectId,
    /// Priority the thread was given.
    pub(crate) base_priority: u8,
    /// Priority the scheduler uses; above `base_priority` while inheriting from a waiter.
    pub(crate) priority: u8,
    pub(crate) state: ThreadState,
    pub(crate) context: Context,
    pub(crate) joiners: Vec<ObjectId>,
    pub(crate) exit: Option<ExitInfo>,
    /// Outstanding signals on the request semaphore. Negative never happens; a waiter blocks
    /// instead.
    pub(crate) request_count: u32,
    pub(crate) stack: Option<ChunkId>,
    /// Mutexes currently held, most recent last.
    pub(crate) held: Vec<ObjectId>,
    /// Suspend requested while waiting; applied when the wait completes.
    pub(crate) suspend_after_wait: bool,
}

impl Thread {
    pub(crate) fn new(process: ObjectId, priority: u8, context: Context) -> Self {
        Self {
            process,
            base_priority: priority,
            priority,
            state: ThreadState::Suspended,
            context,
            joiners: Vec::new(),
            exit: None,
            request_count: 0,
            stack: None,
            held: Vec::new(),
            suspend_after_wait: false,
        }
    }

    pub fn process(&self) -> ObjectId {
        self.process
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn base_priority(&self) -> u8 {
        self.base_priority
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    pub fn is_dead(&self) -> bool {
        self.state == ThreadState::Dead
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }
}
