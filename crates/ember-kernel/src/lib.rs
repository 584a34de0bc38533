//! High-level emulation of a microkernel's object model.
//!
//! Guest code never sees kernel memory: it holds [`Handle`]s into its process's handle table and
//! asks for work through numbered service calls that the [`Kernel`] dispatches to host
//! implementations. The kernel owns the object table, a priority scheduler with round-robin
//! quanta, a guest clock driven by executed instructions, the guest [`MemorySystem`] and the
//! [`HalRegistry`].
//!
//! [`MemorySystem`]: ember_mem::MemorySystem
//! [`HalRegistry`]: ember_hal::HalRegistry
#![forbid(unsafe_code)]

mod config;
mod device;
mod dispatch;
mod error;
mod handle;
mod ipc;
mod kernel;
mod object;
mod process;
mod scheduler;
mod services;
mod snapshot;
mod sync;
mod thread;
mod time;

pub use crate::config::{KernelConfig, MutexPolicy};
pub use crate::device::LogicalDevice;
pub use crate::dispatch::{
    decode_selector, selector, Call, Intent, ServiceDef, ServiceHandler, ServiceOutcome,
    ServiceTable, GLOBAL_TARGET, MAX_ARGS,
};
pub use crate::error::{codes, KernelError, Result};
pub use crate::handle::{Handle, HandleTable};
pub use crate::ipc::{Message, Server, Session, MESSAGE_ARGS, MESSAGE_WIRE_LEN};
pub use crate::kernel::{Kernel, WaitOutcome, PANIC_ACCESS_VIOLATION};
pub use crate::object::{ChunkObject, KernelObject, ObjectEntry, ObjectId, ObjectKind, ObjectTable};
pub use crate::process::{Process, ProcessState};
pub use crate::scheduler::Scheduler;
pub use crate::services::{ordinal, EXIT_PENDING};
pub use crate::sync::{Mutex, Semaphore, Timer, TimerRequest};
pub use crate::thread::{
    Context, ExitInfo, ExitKind, Thread, ThreadState, WaitReason, PRIORITY_COUNT, PRIORITY_MAX,
    PRIORITY_MIN, REG_COUNT, REG_LR, REG_PC, REG_SELECTOR, REG_SP,
};
pub use crate::time::GuestClock;
