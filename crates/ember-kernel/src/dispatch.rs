//! Service-call dispatch.
//!
//! A guest thread requests a kernel service by putting a selector in r12 and trapping. The
//! selector names a target (0 for kernel-global services, otherwise an [`ObjectKind`] tag) in its
//! top byte and an ordinal in its low 16 bits. Object-targeted services take the object's handle
//! in r0 and their arguments from r1; global services take arguments from r0. Arguments that do
//! not fit in r0..r3 are read from the caller's stack.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::error::codes::{KERR_BAD_DESCRIPTOR, KERR_NONE, KERR_NOT_SUPPORTED};
use crate::error::{KernelError, Result};
use crate::handle::Handle;
use crate::kernel::{Kernel, WaitOutcome};
use crate::object::{ObjectId, ObjectKind};
use crate::thread::{REG_SELECTOR, REG_SP};

/// Target byte of kernel-global services.
pub const GLOBAL_TARGET: u8 = 0;
/// Arguments passed in registers before spilling to the stack.
const REG_ARGS: usize = 4;
/// Upper bound on declared service arguments.
pub const MAX_ARGS: usize = 8;

/// Build the r12 selector for `ordinal` on `target`.
pub const fn selector(target: u8, ordinal: u16) -> u32 {
    ((target as u32) << 24) | ordinal as u32
}

/// Split a selector into target and ordinal. Bits 16..24 are ignored.
pub const fn decode_selector(selector: u32) -> (u8, u16) {
    ((selector >> 24) as u8, selector as u16)
}

/// What the calling thread does after a service returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Write the result and keep running.
    Continue,
    /// The thread is waiting; the result is written when it wakes.
    Blocked,
    /// Write the result and give up the rest of the quantum once the host calls
    /// [`Kernel::yield_quantum`].
    Reschedule,
    /// The calling thread is gone.
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub ret: u32,
    pub intent: Intent,
}

impl ServiceOutcome {
    pub fn ok() -> Self {
        Self::code(KERR_NONE)
    }

    pub fn value(ret: u32) -> Self {
        Self {
            ret,
            intent: Intent::Continue,
        }
    }

    pub fn code(code: i32) -> Self {
        Self::value(code as u32)
    }

    pub fn blocked() -> Self {
        Self {
            ret: 0,
            intent: Intent::Blocked,
        }
    }

    pub fn yield_now() -> Self {
        Self {
            ret: KERR_NONE as u32,
            intent: Intent::Reschedule,
        }
    }

    pub fn exited() -> Self {
        Self {
            ret: 0,
            intent: Intent::Exited,
        }
    }
}

impl From<WaitOutcome> for ServiceOutcome {
    fn from(w: WaitOutcome) -> Self {
        match w {
            WaitOutcome::Completed(code) => Self::code(code),
            WaitOutcome::Blocked => Self::blocked(),
        }
    }
}

/// Decoded arguments of one service call.
#[derive(Debug, Clone)]
pub struct Call {
    pub thread: ObjectId,
    pub process: ObjectId,
    /// Object named by the handle in r0, for object-targeted services.
    pub target: Option<ObjectId>,
    args: [u32; MAX_ARGS],
    count: usize,
}

impl Call {
    pub fn new(thread: ObjectId, process: ObjectId, target: Option<ObjectId>, args: &[u32]) -> Self {
        let mut buf = [0u32; MAX_ARGS];
        let count = args.len().min(MAX_ARGS);
        buf[..count].copy_from_slice(&args[..count]);
        Self {
            thread,
            process,
            target,
            args: buf,
            count,
        }
    }

    /// Argument `i`; missing arguments read as zero.
    pub fn arg(&self, i: usize) -> u32 {
        if i < self.count {
            self.args[i]
        } else {
            0
        }
    }

    pub fn arg_i32(&self, i: usize) -> i32 {
        self.arg(i) as i32
    }

    pub fn handle(&self, i: usize) -> Handle {
        Handle(self.arg(i))
    }

    pub fn args(&self) -> &[u32] {
        &self.args[..self.count]
    }

    /// The resolved target object. Only object-targeted services may call this.
    pub fn target(&self) -> Result<ObjectId> {
        self.target.ok_or_else(|| {
            KernelError::InvariantViolation("object service dispatched without a target".into())
        })
    }
}

pub type ServiceHandler = fn(&mut Kernel, &Call) -> Result<ServiceOutcome>;

#[derive(Clone, Copy)]
pub struct ServiceDef {
    pub name: &'static str,
    /// Declared argument count, not counting the target handle.
    pub args: u8,
    pub handler: ServiceHandler,
}

impl core::fmt::Debug for ServiceDef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceDef")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Registered services keyed by `(target, ordinal)`.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    services: BTreeMap<(u8, u16), ServiceDef>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with every service the kernel implements.
    pub fn with_builtin() -> Self {
        let mut table = Self::new();
        crate::services::register_builtin(&mut table);
        table
    }

    /// Register a service. Object targets must be a valid [`ObjectKind`] tag.
    pub fn register(&mut self, target: u8, ordinal: u16, def: ServiceDef) -> Result<()> {
        if target != GLOBAL_TARGET && ObjectKind::from_tag(target).is_none() {
            return Err(KernelError::InvalidArgument("unknown service target"));
        }
        if usize::from(def.args) > MAX_ARGS {
            return Err(KernelError::InvalidArgument("too many service arguments"));
        }
        if self.services.contains_key(&(target, ordinal)) {
            return Err(KernelError::DuplicateService { target, ordinal });
        }
        self.services.insert((target, ordinal), def);
        Ok(())
    }

    pub fn get(&self, target: u8, ordinal: u16) -> Option<&ServiceDef> {
        self.services.get(&(target, ordinal))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((u8, u16), &ServiceDef)> + '_ {
        self.services.iter().map(|(&k, v)| (k, v))
    }
}

impl Kernel {
    /// Perform the service call `thread` trapped with.
    ///
    /// Failures the guest can observe become status codes in r0; only errors that leave the
    /// kernel inconsistent are returned.
    pub fn dispatch(&mut self, thread: ObjectId) -> Result<Intent> {
        let t = self.objects.thread(thread)?;
        let process = t.process;
        let regs = t.context.regs;
        let (target, ordinal) = decode_selector(regs[REG_SELECTOR]);

        let Some(def) = self.services.get(target, ordinal).copied() else {
            warn!(
                thread = thread.0,
                target,
                ordinal,
                "unimplemented service call"
            );
            self.set_result(thread, KERR_NOT_SUPPORTED as u32);
            return Ok(Intent::Continue);
        };

        let (object, first) = if target == GLOBAL_TARGET {
            (None, 0)
        } else {
            let kind = ObjectKind::from_tag(target).ok_or_else(|| {
                KernelError::InvariantViolation(format!("service registered on bad target {target}"))
            })?;
            match self.resolve_kind(process, thread, Handle(regs[0]), kind) {
                Ok(o) => (Some(o), 1),
                Err(e) => return self.fail(thread, def.name, e),
            }
        };

        let mut args = [0u32; MAX_ARGS];
        let space = self.objects.process(process)?.space;
        for (i, slot) in args.iter_mut().enumerate().take(usize::from(def.args)) {
            let reg = first + i;
            *slot = if reg < REG_ARGS {
                regs[reg]
            } else {
                let addr = u64::from(regs[REG_SP]) + 4 * (reg - REG_ARGS) as u64;
                match self.mem.read_u32(space, addr) {
                    Ok(v) => v,
                    Err(fault) => {
                        debug!(thread = thread.0, service = def.name, %fault, "bad stack argument");
                        self.set_result(thread, KERR_BAD_DESCRIPTOR as u32);
                        return Ok(Intent::Continue);
                    }
                }
            };
        }
        let call = Call::new(thread, process, object, &args[..usize::from(def.args)]);
        trace!(thread = thread.0, service = def.name, args = ?call.args(), "service call");

        match (def.handler)(self, &call) {
            Ok(out) => {
                if matches!(out.intent, Intent::Continue | Intent::Reschedule) {
                    self.set_result(thread, out.ret);
                }
                Ok(out.intent)
            }
            Err(e) => self.fail(thread, def.name, e),
        }
    }

    fn fail(&mut self, thread: ObjectId, service: &'static str, e: KernelError) -> Result<Intent> {
        if e.is_fatal() {
            return Err(e);
        }
        debug!(thread = thread.0, service, error = %e, "service failed");
        self.set_result(thread, e.guest_code() as u32);
        Ok(Intent::Continue)
    }

    /// Handlers may have ended the caller; a dead or destroyed thread takes no result.
    fn set_result(&mut self, thread: ObjectId, value: u32) {
        if let Ok(t) = self.objects.thread_mut(thread) {
            if !t.is_dead() {
                t.context.regs[0] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &mut Kernel, _: &Call) -> Result<ServiceOutcome> {
        Ok(ServiceOutcome::ok())
    }

    #[test]
    fn selector_packs_target_and_ordinal() {
        let s = selector(ObjectKind::Thread.tag(), 0x0005);
        assert_eq!(s, 0x0200_0005);
        assert_eq!(decode_selector(s), (2, 5));
        assert_eq!(decode_selector(0x00AB_0001), (0, 1));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut t = ServiceTable::new();
        let def = ServiceDef {
            name: "nop",
            args: 0,
            handler: nop,
        };
        t.register(0, 0x100, def).unwrap();
        assert_eq!(
            t.register(0, 0x100, def).unwrap_err(),
            KernelError::DuplicateService {
                target: 0,
                ordinal: 0x100
            }
        );
        assert!(t.register(0xEE, 0, def).is_err());
    }

    #[test]
    fn missing_arguments_read_as_zero() {
        let c = Call::new(ObjectId(1), ObjectId(2), None, &[7, 8]);
        assert_eq!(c.arg(1), 8);
        assert_eq!(c.arg(5), 0);
        assert!(c.target().is_err());
    }
}
