use tracing::trace;

use crate::error::codes::{KERR_CANCEL, KERR_NONE, KREQUEST_PENDING};
use crate::error::{KernelError, Result};
use crate::object::{KernelObject, ObjectId};
use crate::sync::{Mutex, Semaphore, Timer, TimerRequest};
use crate::thread::WaitReason;

use super::{Kernel, WaitOutcome};

impl Kernel {
    fn create_sync_object(
        &mut self,
        process: ObjectId,
        name: &str,
        global: bool,
        body: KernelObject,
    ) -> Result<ObjectId> {
        let kind = body.kind();
        self.objects.process(process)?;
        if global && !name.is_empty() && self.objects.find_global(kind, name).is_some() {
            return Err(KernelError::AlreadyExists {
                kind,
                name: name.to_string(),
            });
        }
        let owner = (!global).then_some(process);
        let id = self.objects.insert(name, owner, body)?;
        trace!(object = id.0, ?kind, name, global, "created synchronisation object");
        Ok(id)
    }

    pub fn create_mutex(&mut self, process: ObjectId, name: &str, global: bool) -> Result<ObjectId> {
        self.create_sync_object(process, name, global, KernelObject::Mutex(Mutex::default()))
    }

    pub fn create_semaphore(
        &mut self,
        process: ObjectId,
        name: &str,
        initial: i32,
        global: bool,
    ) -> Result<ObjectId> {
        if initial < 0 {
            return Err(KernelError::InvalidArgument("negative semaphore count"));
        }
        let body = KernelObject::Semaphore(Semaphore::new(initial));
        self.create_sync_object(process, name, global, body)
    }

    pub fn create_timer(&mut self, process: ObjectId, name: &str) -> Result<ObjectId> {
        self.create_sync_object(process, name, false, KernelObject::Timer(Timer::default()))
    }

    /// Most urgent waiter, earliest arrival first among equals.
    fn pick_waiter(&self, waiters: &[ObjectId]) -> Result<Option<usize>> {
        let mut best: Option<(usize, u8)> = None;
        for (i, &w) in waiters.iter().enumerate() {
            let prio = self.objects.thread(w)?.priority;
            if best.map_or(true, |(_, p)| prio > p) {
                best = Some((i, prio));
            }
        }
        Ok(best.map(|(i, _)| i))
    }

    /// Acquire `mutex` for `thread`, recursively if it already holds it.
    pub fn mutex_wait(&mut self, thread: ObjectId, mutex: ObjectId) -> Result<WaitOutcome> {
        let m = self.objects.mutex_mut(mutex)?;
        match m.holder {
            None => {
                m.holder = Some(thread);
                m.count = 1;
                self.objects.thread_mut(thread)?.held.push(mutex);
                Ok(WaitOutcome::Completed(KERR_NONE))
            }
            Some(holder) if holder == thread => {
                m.count = m
                    .count
                    .checked_add(1)
                    .ok_or(KernelError::Overflow("mutex nesting depth"))?;
                Ok(WaitOutcome::Completed(KERR_NONE))
            }
            Some(holder) => {
                m.waiters.push(thread);
                self.block(thread, WaitReason::Object(mutex))?;
                self.recompute_priority(holder)?;
                Ok(WaitOutcome::Blocked)
            }
        }
    }

    /// Release one level of `thread`'s hold on `mutex`.
    pub fn mutex_signal(&mut self, thread: ObjectId, mutex: ObjectId) -> Result<()> {
        let m = self.objects.mutex_mut(mutex)?;
        if m.holder != Some(thread) {
            return Err(KernelError::AccessDenied("mutex is not held by the caller"));
        }
        m.count -= 1;
        if m.count > 0 {
            return Ok(());
        }
        self.release_mutex(mutex)
    }

    /// Drop the current holder entirely and hand the mutex to the next waiter.
    pub(crate) fn release_mutex(&mut self, mutex: ObjectId) -> Result<()> {
        let m = self.objects.mutex_mut(mutex)?;
        let previous = m.holder.take();
        m.count = 0;
        let waiters = m.waiters.clone();

        if let Some(previous) = previous {
            if let Ok(t) = self.objects.thread_mut(previous) {
                t.held.retain(|&x| x != mutex);
                self.recompute_priority(previous)?;
            }
        }

        match self.pick_waiter(&waiters)? {
            Some(i) => {
                let next = waiters[i];
                let m = self.objects.mutex_mut(mutex)?;
                m.waiters.remove(i);
                m.holder = Some(next);
                m.count = 1;
                self.objects.thread_mut(next)?.held.push(mutex);
                self.wake(next, KERR_NONE)?;
                self.recompute_priority(next)?;
                trace!(mutex = mutex.0, holder = next.0, "mutex handed over");
            }
            None => {
                if self.objects.get(mutex)?.pending_destroy {
                    self.maybe_destroy(mutex)?;
                }
            }
        }
        Ok(())
    }

    pub fn mutex_is_held(&self, thread: ObjectId, mutex: ObjectId) -> Result<bool> {
        Ok(self.objects.mutex(mutex)?.holder == Some(thread))
    }

    /// Take one count from `semaphore` or block until one is signalled.
    pub fn semaphore_wait(&mut self, thread: ObjectId, semaphore: ObjectId) -> Result<WaitOutcome> {
        let s = self.objects.semaphore_mut(semaphore)?;
        if s.count > 0 {
            s.count -= 1;
            return Ok(WaitOutcome::Completed(KERR_NONE));
        }
        s.waiters.push(thread);
        self.block(thread, WaitReason::Object(semaphore))?;
        Ok(WaitOutcome::Blocked)
    }

    /// Add `n` counts: waiters are released first, the remainder is added to the count.
    pub fn semaphore_signal(&mut self, semaphore: ObjectId, n: i32) -> Result<()> {
        if n <= 0 {
            return Err(KernelError::InvalidArgument("semaphore signal count must be positive"));
        }
        let s = self.objects.semaphore(semaphore)?;
        let woken = s.waiters.len().min(n as usize);
        let rest = n - woken as i32;
        let count = s
            .count
            .checked_add(rest)
            .ok_or(KernelError::Overflow("semaphore count"))?;

        for _ in 0..woken {
            let waiters = self.objects.semaphore(semaphore)?.waiters.clone();
            let Some(i) = self.pick_waiter(&waiters)? else {
                break;
            };
            self.objects.semaphore_mut(semaphore)?.waiters.remove(i);
            self.wake(waiters[i], KERR_NONE)?;
        }
        let s = self.objects.semaphore_mut(semaphore)?;
        s.count = count;
        if s.waiters.is_empty() && self.objects.get(semaphore)?.pending_destroy {
            self.maybe_destroy(semaphore)?;
        }
        Ok(())
    }

    /// Arm a one-shot timer request completing after `us` guest microseconds.
    pub fn timer_after(
        &mut self,
        thread: ObjectId,
        timer: ObjectId,
        status_addr: u32,
        us: u64,
    ) -> Result<()> {
        if self.objects.timer(timer)?.pending.is_some() {
            return Err(KernelError::InUse("timer already has a pending request"));
        }
        let process = self.objects.thread(thread)?.process;
        let space = self.objects.process(process)?.space;
        self.mem
            .write_u32(space, u64::from(status_addr), KREQUEST_PENDING as u32)?;
        let deadline_us = self.clock.now_us().saturating_add(us);
        self.objects.timer_mut(timer)?.pending = Some(TimerRequest {
            thread,
            status_addr,
            deadline_us,
        });
        trace!(timer = timer.0, deadline_us, "timer armed");
        Ok(())
    }

    /// Complete a pending timer request with `KErrCancel`. Does nothing if none is pending.
    pub fn timer_cancel(&mut self, timer: ObjectId) -> Result<()> {
        if let Some(req) = self.objects.timer_mut(timer)?.pending.take() {
            self.complete_request(req.thread, req.status_addr, KERR_CANCEL)?;
        }
        Ok(())
    }
}
