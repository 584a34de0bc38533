use ember_mem::MemFault;
use tracing::{debug, trace, warn};

use crate::config::MutexPolicy;
use crate::error::codes::{KERR_DIED, KERR_NONE};
use crate::error::{KernelError, Result};
use crate::object::{KernelObject, ObjectId};
use crate::process::ProcessState;
use crate::thread::{Context, ExitInfo, ExitKind, ThreadState, WaitReason, PRIORITY_MAX};

use super::{Kernel, WaitOutcome};

/// Panic reason given to a thread that takes an unhandled memory fault.
pub const PANIC_ACCESS_VIOLATION: i32 = 3;

impl Kernel {
    /// Make a suspended thread runnable. Resuming a waiting thread cancels a pending suspend.
    pub fn resume_thread(&mut self, thread: ObjectId) -> Result<()> {
        let t = self.objects.thread_mut(thread)?;
        match t.state {
            ThreadState::Suspended => {
                t.state = ThreadState::Ready;
                let prio = t.priority;
                self.scheduler.enqueue(thread, prio);
                trace!(thread = thread.0, "resumed");
            }
            ThreadState::Waiting(_) => t.suspend_after_wait = false,
            ThreadState::Dead => return Err(KernelError::Died("thread is dead")),
            ThreadState::Ready | ThreadState::Running => {}
        }
        Ok(())
    }

    /// Stop a thread from being scheduled. A waiting thread is suspended when its wait ends.
    pub fn suspend_thread(&mut self, thread: ObjectId) -> Result<()> {
        let t = self.objects.thread_mut(thread)?;
        match t.state {
            ThreadState::Ready => {
                t.state = ThreadState::Suspended;
                let prio = t.priority;
                self.scheduler.remove(thread, prio);
            }
            ThreadState::Running => {
                t.state = ThreadState::Suspended;
                if self.scheduler.current() == Some(thread) {
                    self.scheduler.set_current(None);
                }
            }
            ThreadState::Waiting(_) => t.suspend_after_wait = true,
            ThreadState::Suspended => {}
            ThreadState::Dead => return Err(KernelError::Died("thread is dead")),
        }
        trace!(thread = thread.0, "suspended");
        Ok(())
    }

    pub fn kill_thread(&mut self, thread: ObjectId, reason: i32) -> Result<()> {
        self.terminate_thread(
            thread,
            ExitInfo {
                kind: ExitKind::Kill,
                reason,
            },
        )
    }

    pub fn exit_thread(&mut self, thread: ObjectId, reason: i32) -> Result<()> {
        self.terminate_thread(
            thread,
            ExitInfo {
                kind: ExitKind::Exit,
                reason,
            },
        )
    }

    pub fn panic_thread(&mut self, thread: ObjectId, reason: i32) -> Result<()> {
        self.terminate_thread(
            thread,
            ExitInfo {
                kind: ExitKind::Panic,
                reason,
            },
        )
    }

    /// A guest memory fault the core could not handle panics the faulting thread.
    pub fn thread_fault(&mut self, thread: ObjectId, fault: MemFault) -> Result<()> {
        warn!(thread = thread.0, %fault, "unhandled guest fault, panicking thread");
        self.panic_thread(thread, PANIC_ACCESS_VIOLATION)
    }

    /// End a thread: leave any wait, hand off held mutexes, free the stack and wake joiners.
    /// The death of a primary thread takes its process with it.
    pub fn terminate_thread(&mut self, thread: ObjectId, info: ExitInfo) -> Result<()> {
        let t = self.objects.thread(thread)?;
        if t.is_dead() {
            return Ok(());
        }
        let (state, prio, process) = (t.state, t.priority, t.process);

        match state {
            ThreadState::Waiting(reason) => self.leave_wait(thread, reason)?,
            ThreadState::Ready => {
                self.scheduler.remove(thread, prio);
            }
            _ => {}
        }
        if self.scheduler.current() == Some(thread) {
            self.scheduler.set_current(None);
        }

        let held = std::mem::take(&mut self.objects.thread_mut(thread)?.held);
        for mutex in held {
            self.release_mutex(mutex)?;
        }

        let t = self.objects.thread_mut(thread)?;
        t.state = ThreadState::Dead;
        t.exit = Some(info);
        t.suspend_after_wait = false;
        t.priority = t.base_priority;
        let stack = t.stack.take();
        let joiners = std::mem::take(&mut t.joiners);

        if let Some(stack) = stack {
            if self.mem.chunk(stack).is_ok() {
                self.mem.release(stack)?;
            }
        }
        for j in joiners {
            self.wake(j, info.reason)?;
        }
        debug!(thread = thread.0, ?info, "thread died");

        let p = self.objects.process(process)?;
        if p.primary == Some(thread) && matches!(p.state, ProcessState::Loading | ProcessState::Running)
        {
            self.end_process(
                process,
                info,
                ExitInfo {
                    kind: ExitKind::Kill,
                    reason: KERR_DIED,
                },
            )?;
        }
        self.maybe_destroy(thread)
    }

    /// Kill every thread of `process` and release what it owns. The process records `reason`;
    /// its threads end with [`KERR_DIED`].
    pub fn kill_process(&mut self, process: ObjectId, reason: i32) -> Result<()> {
        self.end_process(
            process,
            ExitInfo {
                kind: ExitKind::Kill,
                reason,
            },
            ExitInfo {
                kind: ExitKind::Kill,
                reason: KERR_DIED,
            },
        )
    }

    pub(crate) fn end_process(
        &mut self,
        process: ObjectId,
        info: ExitInfo,
        threads_info: ExitInfo,
    ) -> Result<()> {
        let p = self.objects.process_mut(process)?;
        if matches!(p.state, ProcessState::Exiting | ProcessState::Dead) {
            return Ok(());
        }
        p.state = ProcessState::Exiting;
        p.exit = Some(info);
        let threads = p.threads.clone();
        let space = p.space;

        for t in threads {
            if self.objects.contains(t) {
                self.terminate_thread(t, threads_info)?;
            }
        }
        self.release_process_objects(process)?;
        if self.mem.space(space).is_ok() {
            self.mem.destroy_space(space)?;
        }

        self.objects.process_mut(process)?.state = ProcessState::Dead;
        debug!(process = process.0, ?info, "process died");
        self.maybe_destroy(process)
    }

    /// Change a thread's base priority. The effective priority may stay higher while it inherits.
    pub fn set_thread_priority(&mut self, thread: ObjectId, priority: u8) -> Result<()> {
        if priority > PRIORITY_MAX {
            return Err(KernelError::InvalidArgument("thread priority out of range"));
        }
        let t = self.objects.thread_mut(thread)?;
        if t.is_dead() {
            return Err(KernelError::Died("thread is dead"));
        }
        t.base_priority = priority;
        self.recompute_priority(thread)
    }

    /// Recalculate a thread's effective priority from its base and, under priority inheritance,
    /// the waiters on mutexes it holds. Changes propagate along chains of blocked holders.
    pub(crate) fn recompute_priority(&mut self, thread: ObjectId) -> Result<()> {
        let mut next = Some(thread);
        while let Some(thread) = next.take() {
            let t = self.objects.thread(thread)?;
            let mut effective = t.base_priority;
            if self.config.mutex_policy == MutexPolicy::PriorityInheritance {
                for &m in &t.held {
                    for &w in &self.objects.mutex(m)?.waiters {
                        effective = effective.max(self.objects.thread(w)?.priority);
                    }
                }
            }
            if effective == t.priority {
                break;
            }
            let state = t.state;
            let old = t.priority;
            self.objects.thread_mut(thread)?.priority = effective;
            if state == ThreadState::Ready && self.scheduler.remove(thread, old) {
                self.scheduler.enqueue(thread, effective);
            }
            trace!(thread = thread.0, from = old, to = effective, "effective priority changed");

            if let ThreadState::Waiting(WaitReason::Object(o)) = state {
                if let Ok(m) = self.objects.mutex(o) {
                    next = m.holder;
                }
            }
        }
        Ok(())
    }

    /// Take a runnable thread off the CPU and park it on `reason`.
    pub(crate) fn block(&mut self, thread: ObjectId, reason: WaitReason) -> Result<()> {
        let t = self.objects.thread_mut(thread)?;
        let (state, prio) = (t.state, t.priority);
        t.state = ThreadState::Waiting(reason);
        if state == ThreadState::Ready {
            self.scheduler.remove(thread, prio);
        }
        if self.scheduler.current() == Some(thread) {
            self.scheduler.set_current(None);
        }
        trace!(thread = thread.0, ?reason, "blocked");
        Ok(())
    }

    /// End a wait with `code` in the thread's result register. Threads that are not waiting, or
    /// no longer exist, are left alone.
    pub(crate) fn wake(&mut self, thread: ObjectId, code: i32) -> Result<()> {
        let Ok(t) = self.objects.thread_mut(thread) else {
            return Ok(());
        };
        if !matches!(t.state, ThreadState::Waiting(_)) {
            return Ok(());
        }
        t.context.regs[0] = code as u32;
        if std::mem::take(&mut t.suspend_after_wait) {
            t.state = ThreadState::Suspended;
        } else {
            t.state = ThreadState::Ready;
            let prio = t.priority;
            self.scheduler.enqueue(thread, prio);
        }
        trace!(thread = thread.0, code, "woken");
        Ok(())
    }

    /// Undo the bookkeeping of a wait that is being abandoned.
    fn leave_wait(&mut self, thread: ObjectId, reason: WaitReason) -> Result<()> {
        match reason {
            WaitReason::Object(o) => {
                let holder = match self.objects.get_mut(o).map(|e| &mut e.body) {
                    Ok(KernelObject::Mutex(m)) => {
                        m.waiters.retain(|&w| w != thread);
                        m.holder
                    }
                    Ok(KernelObject::Semaphore(s)) => {
                        s.waiters.retain(|&w| w != thread);
                        None
                    }
                    _ => None,
                };
                if let Some(holder) = holder {
                    self.recompute_priority(holder)?;
                }
                if self.objects.get(o).map(|e| e.pending_destroy).unwrap_or(false) {
                    self.maybe_destroy(o)?;
                }
            }
            WaitReason::Join(target) => {
                if let Ok(t) = self.objects.thread_mut(target) {
                    t.joiners.retain(|&j| j != thread);
                }
            }
            WaitReason::Receive { server, .. } => {
                if let Ok(s) = self.objects.server_mut(server) {
                    if s.receiver.map(|(t, _)| t) == Some(thread) {
                        s.receiver = None;
                    }
                }
            }
            WaitReason::Reply(_) | WaitReason::Request | WaitReason::Sleep { .. } => {}
        }
        Ok(())
    }

    /// Pick the thread to run next.
    ///
    /// Expired sleeps and timers are delivered first. The running thread keeps the CPU unless its
    /// quantum is used up or a more urgent thread is ready. With nothing ready but a
    /// deadline pending, guest time jumps forward to the deadline. `None` means the system is
    /// idle with nothing left to wait for.
    pub fn schedule(&mut self) -> Result<Option<ObjectId>> {
        self.expire_deadlines()?;

        if let Some(current) = self.scheduler.current() {
            let running = self
                .objects
                .thread(current)
                .ok()
                .filter(|t| t.state == ThreadState::Running)
                .map(|t| t.priority);
            if let Some(prio) = running {
                let expired = self.scheduler.slice_remaining() == 0;
                let preempted = self
                    .scheduler
                    .highest_ready_priority()
                    .is_some_and(|p| p > prio);
                if !expired && !preempted {
                    return Ok(Some(current));
                }
                self.objects.thread_mut(current)?.state = ThreadState::Ready;
                if preempted && !expired {
                    self.scheduler.enqueue_front(current, prio);
                } else {
                    self.scheduler.enqueue(current, prio);
                }
                trace!(thread = current.0, expired, preempted, "descheduled");
            }
            self.scheduler.set_current(None);
        }

        loop {
            if let Some(next) = self.scheduler.pop_highest() {
                let t = self.objects.thread_mut(next)?;
                if t.state != ThreadState::Ready {
                    return Err(KernelError::InvariantViolation(format!(
                        "run queue holds {next:?} in state {:?}",
                        t.state
                    )));
                }
                t.state = ThreadState::Running;
                self.scheduler.set_current(Some(next));
                self.scheduler.restart_slice();
                trace!(thread = next.0, "dispatching");
                return Ok(Some(next));
            }
            match self.next_deadline() {
                Some(deadline) => {
                    trace!(deadline, "idle, fast-forwarding guest clock");
                    self.clock.fast_forward(deadline);
                    self.expire_deadlines()?;
                }
                None => return Ok(None),
            }
        }
    }

    /// Charge `executed` instructions to the running thread and advance guest time. Returns true
    /// once the thread's quantum is used up.
    pub fn account(&mut self, executed: u64) -> bool {
        self.clock.advance(executed);
        self.scheduler.charge(executed)
    }

    /// End the running thread's quantum early, so the next [`schedule`](Self::schedule) queues
    /// it behind its peers. The host calls this when a service returns
    /// [`Intent::Reschedule`](crate::Intent::Reschedule).
    pub fn yield_quantum(&mut self) {
        if self.scheduler.current().is_some() {
            self.scheduler.forfeit_slice();
        }
    }

    /// Earliest pending sleep or timer deadline, in guest microseconds.
    pub fn next_deadline(&self) -> Option<u64> {
        let sleeps = self.objects.entries().filter_map(|e| match &e.body {
            KernelObject::Thread(t) => match t.state {
                ThreadState::Waiting(WaitReason::Sleep { until_us }) => Some(until_us),
                _ => None,
            },
            KernelObject::Timer(t) => t.pending.map(|r| r.deadline_us),
            _ => None,
        });
        sleeps.min()
    }

    fn expire_deadlines(&mut self) -> Result<()> {
        let now = self.clock.now_us();
        let mut sleepers = Vec::new();
        let mut timers = Vec::new();
        for e in self.objects.entries() {
            match &e.body {
                KernelObject::Thread(t) => {
                    if let ThreadState::Waiting(WaitReason::Sleep { until_us }) = t.state {
                        if until_us <= now {
                            sleepers.push(e.id);
                        }
                    }
                }
                KernelObject::Timer(t) => {
                    if t.pending.is_some_and(|r| r.deadline_us <= now) {
                        timers.push(e.id);
                    }
                }
                _ => {}
            }
        }
        for t in sleepers {
            self.wake(t, KERR_NONE)?;
        }
        for timer in timers {
            if let Some(req) = self.objects.timer_mut(timer)?.pending.take() {
                self.complete_request(req.thread, req.status_addr, KERR_NONE)?;
            }
        }
        Ok(())
    }

    pub fn context(&self, thread: ObjectId) -> Result<&Context> {
        Ok(&self.objects.thread(thread)?.context)
    }

    pub fn context_mut(&mut self, thread: ObjectId) -> Result<&mut Context> {
        Ok(&mut self.objects.thread_mut(thread)?.context)
    }

    /// Sleep `thread` for `us` guest microseconds. A zero sleep completes at once; the sleep
    /// service turns it into [`Intent::Reschedule`](crate::Intent::Reschedule).
    pub fn sleep(&mut self, thread: ObjectId, us: u64) -> Result<WaitOutcome> {
        if us == 0 {
            return Ok(WaitOutcome::Completed(KERR_NONE));
        }
        let until_us = self.clock.now_us().saturating_add(us);
        self.block(thread, WaitReason::Sleep { until_us })?;
        Ok(WaitOutcome::Blocked)
    }

    /// Consume one signal from the thread's request semaphore or block until one arrives.
    pub fn wait_for_any_request(&mut self, thread: ObjectId) -> Result<WaitOutcome> {
        let t = self.objects.thread_mut(thread)?;
        if t.request_count > 0 {
            t.request_count -= 1;
            return Ok(WaitOutcome::Completed(KERR_NONE));
        }
        self.block(thread, WaitReason::Request)?;
        Ok(WaitOutcome::Blocked)
    }

    /// Signal a thread's request semaphore once.
    pub fn request_signal(&mut self, thread: ObjectId) -> Result<()> {
        let t = self.objects.thread_mut(thread)?;
        if t.is_dead() {
            return Ok(());
        }
        if t.state == ThreadState::Waiting(WaitReason::Request) {
            return self.wake(thread, KERR_NONE);
        }
        t.request_count = t.request_count.saturating_add(1);
        Ok(())
    }

    /// Write `code` into a request status word in `thread`'s address space and signal the
    /// thread. Requests for threads that are gone are dropped.
    pub fn complete_request(&mut self, thread: ObjectId, status_addr: u32, code: i32) -> Result<()> {
        let Ok(t) = self.objects.thread(thread) else {
            return Ok(());
        };
        if t.is_dead() {
            return Ok(());
        }
        let space = self.objects.process(t.process)?.space;
        if let Err(fault) = self.mem.write_u32(space, u64::from(status_addr), code as u32) {
            warn!(thread = thread.0, %fault, "request status word is not writable");
        }
        self.request_signal(thread)
    }

    /// Wait for `target` to die. Returns its exit reason straight away if it already has.
    pub fn logon(&mut self, thread: ObjectId, target: ObjectId) -> Result<WaitOutcome> {
        if thread == target {
            return Err(KernelError::InvalidArgument("a thread cannot wait for itself"));
        }
        let t = self.objects.thread_mut(target)?;
        if let Some(exit) = t.exit {
            return Ok(WaitOutcome::Completed(exit.reason));
        }
        t.joiners.push(thread);
        self.block(thread, WaitReason::Join(target))?;
        Ok(WaitOutcome::Blocked)
    }
}
