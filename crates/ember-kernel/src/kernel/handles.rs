use tracing::{debug, trace};

use crate::error::codes::{KERR_CANCEL, KERR_DIED};
use crate::error::{KernelError, Result};
use crate::handle::Handle;
use crate::object::{KernelObject, ObjectId, ObjectKind};
use crate::process::ProcessState;
use crate::thread::ThreadState;

use super::Kernel;

impl Kernel {
    /// Add a handle to `object` in `process`'s table.
    ///
    /// Opening a global chunk maps it into the process's address space if it is not already.
    pub fn open_handle(&mut self, process: ObjectId, object: ObjectId) -> Result<Handle> {
        let kind = self.objects.kind_of(object)?;
        let space = self.objects.process(process)?.space;
        let handle = self.objects.process_mut(process)?.handles.insert(object)?;

        if kind == ObjectKind::Chunk {
            let chunk = self.objects.chunk(object)?.chunk;
            let mapped = self.mem.chunk(chunk)?.mapped_in().any(|s| s == space);
            if !mapped {
                if let Err(e) = self.mem.attach(chunk, space) {
                    self.objects.process_mut(process)?.handles.remove(handle)?;
                    return Err(e.into());
                }
            }
        }

        let entry = self.objects.get_mut(object)?;
        entry.refs = entry
            .refs
            .checked_add(1)
            .ok_or(KernelError::ResourceExhausted("object reference count"))?;
        trace!(process = process.0, object = object.0, %handle, "opened handle");
        Ok(handle)
    }

    /// Resolve a handle as seen by `thread` in `process`, including the pseudo-handles.
    pub fn resolve_handle(
        &self,
        process: ObjectId,
        thread: ObjectId,
        handle: Handle,
    ) -> Result<ObjectId> {
        let object = match handle {
            Handle::CURRENT_PROCESS => return Ok(process),
            Handle::CURRENT_THREAD => return Ok(thread),
            h => self.objects.process(process)?.handles.get(h)?,
        };
        if !self.objects.contains(object) {
            return Err(KernelError::InvariantViolation(format!(
                "handle {handle} in process {process:?} refers to destroyed object {object:?}"
            )));
        }
        Ok(object)
    }

    /// Resolve a handle and check the object is of `kind`.
    pub fn resolve_kind(
        &self,
        process: ObjectId,
        thread: ObjectId,
        handle: Handle,
        kind: ObjectKind,
    ) -> Result<ObjectId> {
        let object = self.resolve_handle(process, thread, handle)?;
        let actual = self.objects.kind_of(object)?;
        if actual != kind {
            return Err(KernelError::WrongKind {
                handle,
                expected: kind,
                actual,
            });
        }
        Ok(object)
    }

    /// Close a handle. The object is destroyed once its last handle is gone and nothing else keeps
    /// it alive. Closing a pseudo-handle does nothing.
    pub fn close_handle(&mut self, process: ObjectId, handle: Handle) -> Result<()> {
        if handle.is_pseudo() {
            return Ok(());
        }
        let object = self.objects.process_mut(process)?.handles.remove(handle)?;
        trace!(process = process.0, object = object.0, %handle, "closed handle");
        self.drop_ref(object)
    }

    /// Open a second handle to the object behind `handle`, in `target` process.
    pub fn duplicate_handle(
        &mut self,
        process: ObjectId,
        thread: ObjectId,
        handle: Handle,
        target: ObjectId,
    ) -> Result<Handle> {
        let object = self.resolve_handle(process, thread, handle)?;
        self.open_handle(target, object)
    }

    /// Open a handle to a named object. Global objects are preferred over local ones.
    pub fn open_by_name(
        &mut self,
        process: ObjectId,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Handle> {
        let object = self
            .objects
            .find_named(kind, name)
            .ok_or_else(|| KernelError::NameNotFound {
                kind,
                name: name.to_string(),
            })?;
        if self.is_dead_object(object)? {
            return Err(KernelError::NameNotFound {
                kind,
                name: name.to_string(),
            });
        }
        self.open_handle(process, object)
    }

    /// Dead threads and processes linger while handles exist, but cannot be found by name.
    fn is_dead_object(&self, object: ObjectId) -> Result<bool> {
        Ok(match &self.objects.get(object)?.body {
            KernelObject::Thread(t) => t.is_dead(),
            KernelObject::Process(p) => p.state == ProcessState::Dead,
            _ => false,
        })
    }

    pub(crate) fn drop_ref(&mut self, object: ObjectId) -> Result<()> {
        let entry = self.objects.get_mut(object)?;
        entry.refs = entry.refs.checked_sub(1).ok_or_else(|| {
            KernelError::InvariantViolation(format!("reference count underflow on {object:?}"))
        })?;
        self.maybe_destroy(object)
    }

    /// Destroy `object` if nothing keeps it alive any more.
    pub(crate) fn maybe_destroy(&mut self, object: ObjectId) -> Result<()> {
        let Ok(entry) = self.objects.get(object) else {
            return Ok(());
        };
        if entry.refs > 0 || entry.pinned {
            return Ok(());
        }
        let keep = match &entry.body {
            KernelObject::Process(p) => p.state != ProcessState::Dead || !p.threads.is_empty(),
            KernelObject::Thread(t) => !t.is_dead(),
            KernelObject::Mutex(m) => !m.waiters.is_empty(),
            KernelObject::Semaphore(s) => !s.waiters.is_empty(),
            _ => false,
        };
        if keep {
            let waited_on = matches!(entry.body, KernelObject::Mutex(_) | KernelObject::Semaphore(_));
            if waited_on {
                self.objects.get_mut(object)?.pending_destroy = true;
            }
            return Ok(());
        }
        self.destroy_object(object)
    }

    /// Remove an object from the table, scrubbing every handle that still names it.
    pub(crate) fn destroy_object(&mut self, object: ObjectId) -> Result<()> {
        let processes: Vec<ObjectId> = self.objects.ids_of_kind(ObjectKind::Process).collect();
        for p in processes {
            let table = &mut self.objects.process_mut(p)?.handles;
            for h in table.handles_of(object) {
                table.remove(h)?;
            }
        }

        let Some(entry) = self.objects.remove(object) else {
            return Ok(());
        };
        let kind = entry.kind();
        match entry.body {
            KernelObject::Chunk(c) => {
                if self.mem.chunk(c.chunk).is_ok() {
                    self.mem.release(c.chunk)?;
                }
            }
            KernelObject::Timer(t) => {
                if let Some(req) = t.pending {
                    self.complete_request(req.thread, req.status_addr, KERR_CANCEL)?;
                }
            }
            KernelObject::Server(s) => self.server_gone(object, s)?,
            KernelObject::Session(s) => self.session_gone(object, s)?,
            KernelObject::Thread(t) => {
                if let Ok(p) = self.objects.process_mut(t.process) {
                    p.threads.retain(|&x| x != object);
                    if p.primary == Some(object) {
                        p.primary = None;
                    }
                }
                self.maybe_destroy(t.process)?;
            }
            KernelObject::Mutex(m) => {
                if let Some(holder) = m.holder {
                    if let Ok(t) = self.objects.thread_mut(holder) {
                        t.held.retain(|&x| x != object);
                    }
                }
            }
            KernelObject::Process(_) | KernelObject::Semaphore(_) | KernelObject::LogicalDevice(_) => {}
        }
        debug!(object = object.0, ?kind, name = %entry.name, "destroyed object");
        Ok(())
    }

    /// Wake every waiter of a mutex or semaphore with `code` and leave it without waiters.
    pub(crate) fn abandon_waiters(&mut self, object: ObjectId, code: i32) -> Result<()> {
        let waiters = match &mut self.objects.get_mut(object)?.body {
            KernelObject::Mutex(m) => std::mem::take(&mut m.waiters),
            KernelObject::Semaphore(s) => std::mem::take(&mut s.waiters),
            _ => Vec::new(),
        };
        for t in waiters {
            self.wake(t, code)?;
        }
        Ok(())
    }

    /// Tear down everything `process` owns after its threads are dead.
    pub(crate) fn release_process_objects(&mut self, process: ObjectId) -> Result<()> {
        let open: Vec<Handle> = self
            .objects
            .process(process)?
            .handles
            .iter()
            .map(|(h, _)| h)
            .collect();
        for h in open {
            self.close_handle(process, h)?;
        }

        let owned: Vec<ObjectId> = self
            .objects
            .entries()
            .filter(|e| e.owner == Some(process) && e.kind() != ObjectKind::Thread)
            .map(|e| e.id)
            .collect();
        for object in owned {
            if !self.objects.contains(object) {
                continue;
            }
            self.abandon_waiters(object, KERR_DIED)?;
            self.destroy_object(object)?;
        }
        Ok(())
    }

    /// Whether `thread` is blocked on `reason`.
    pub(crate) fn is_waiting_on(&self, thread: ObjectId, reason: crate::thread::WaitReason) -> bool {
        self.objects
            .thread(thread)
            .map(|t| t.state == ThreadState::Waiting(reason))
            .unwrap_or(false)
    }
}
