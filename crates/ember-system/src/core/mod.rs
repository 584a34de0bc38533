//! The boundary between the emulation loop and whatever executes guest instructions.
//!
//! An [`ExecutableCore`] runs one thread's register context against that thread's address space
//! until it has executed its instruction budget or needs the host. The loop owns scheduling; the
//! core never sees kernel objects.

pub mod bytecode;

use ember_kernel::Context;
use ember_mem::{GuestMemory, MemFault};

/// Panic reason given to a thread whose core hit an instruction it cannot decode.
pub const PANIC_UNDEFINED_INSTRUCTION: i32 = 4;

/// Why a core returned control to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The instruction budget ran out.
    BudgetExhausted,
    /// The thread trapped into the kernel with a selector in r12. The program counter already
    /// points past the trapping instruction.
    ServiceCall,
    /// A memory access faulted and the core has no handler for it.
    Fault(MemFault),
    /// The thread stopped itself; r0 holds its exit reason.
    Halt,
    /// The instruction at `pc` could not be decoded.
    Undefined { pc: u32 },
}

/// Outcome of one [`ExecutableCore::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreExit {
    /// Instructions retired, including a trapping or halting instruction.
    pub executed: u64,
    pub reason: ExitReason,
}

impl CoreExit {
    pub fn new(executed: u64, reason: ExitReason) -> Self {
        Self { executed, reason }
    }
}

/// An instruction-set implementation driven by the emulation loop.
pub trait ExecutableCore: Send {
    /// Execute at most `budget` instructions of the thread whose registers are in `ctx`.
    fn run(&mut self, ctx: &mut Context, mem: &mut dyn GuestMemory, budget: u64) -> CoreExit;

    /// Drop any cached decode state, e.g. after guest code was replaced by a restore.
    fn flush(&mut self) {}
}

impl<T: ExecutableCore + ?Sized> ExecutableCore for Box<T> {
    fn run(&mut self, ctx: &mut Context, mem: &mut dyn GuestMemory, budget: u64) -> CoreExit {
        (**self).run(ctx, mem, budget)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}
