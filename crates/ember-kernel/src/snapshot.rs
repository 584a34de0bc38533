//! Kernel save/restore.
//!
//! The kernel writes three sections: its own object graph and scheduler state (`KERN`), the
//! memory system (`MEMS`) and the HAL providers (`HAL_`). Restore decodes and cross-checks all
//! three before anything live is replaced, so a bad image leaves the running kernel untouched.

use std::collections::{BTreeMap, BTreeSet};

use ember_mem::{ChunkId, MemorySystem, SpaceId};
use ember_snapshot::{
    Absorb, Mode, SectionTag, Snapshot, SnapshotError, StateSerializer,
};
use tracing::debug;

use crate::device::LogicalDevice;
use crate::handle::{HandleSlot, HandleTable};
use crate::ipc::{Message, Server, Session};
use crate::kernel::Kernel;
use crate::object::{ChunkObject, KernelObject, ObjectEntry, ObjectId, ObjectKind, ObjectTable};
use crate::process::{Process, ProcessState};
use crate::scheduler::Scheduler;
use crate::sync::{Mutex, Semaphore, Timer, TimerRequest};
use crate::thread::{Context, ExitInfo, ExitKind, Thread, ThreadState, WaitReason, PRIORITY_MAX};
use crate::time::GuestClock;

type SnapResult<T> = ember_snapshot::Result<T>;

const KERNEL_SECTION_VERSION: u16 = 1;
const MAX_OBJECTS: usize = 1 << 20;
const MAX_LIST: usize = 1 << 16;
const MAX_HANDLE_SLOTS: usize = (1 << 16) + 1;
const MAX_MESSAGES: usize = 1 << 20;

impl Absorb for ObjectId {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> SnapResult<()> {
        s.absorb_u64(&mut self.0)
    }
}

impl Absorb for ExitInfo {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> SnapResult<()> {
        let mut kind = self.kind.to_u8();
        s.absorb_u8(&mut kind)?;
        self.kind = ExitKind::from_u8(kind).ok_or(SnapshotError::Corrupt("unknown exit kind"))?;
        s.absorb_i32(&mut self.reason)
    }
}

impl Absorb for Context {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> SnapResult<()> {
        s.absorb(&mut self.regs)?;
        s.absorb_u32(&mut self.flags)
    }
}

impl Absorb for Message {
    fn absorb(&mut self, s: &mut StateSerializer<'_>) -> SnapResult<()> {
        s.absorb_u32(&mut self.id)?;
        s.absorb(&mut self.server)?;
        s.absorb(&mut self.session)?;
        s.absorb(&mut self.client)?;
        s.absorb_i32(&mut self.function)?;
        s.absorb(&mut self.args)
    }
}

fn absorb_ids(s: &mut StateSerializer<'_>, ids: &mut Vec<ObjectId>) -> SnapResult<()> {
    s.absorb_vec(ids, MAX_LIST, |s, id| s.absorb(id))
}

fn absorb_thread_state(s: &mut StateSerializer<'_>, state: &mut ThreadState) -> SnapResult<()> {
    let (mut tag, mut a, mut b): (u8, u64, u32) = match *state {
        ThreadState::Ready => (0, 0, 0),
        ThreadState::Running => (1, 0, 0),
        ThreadState::Suspended => (2, 0, 0),
        ThreadState::Dead => (3, 0, 0),
        ThreadState::Waiting(WaitReason::Object(o)) => (4, o.0, 0),
        ThreadState::Waiting(WaitReason::Request) => (5, 0, 0),
        ThreadState::Waiting(WaitReason::Sleep { until_us }) => (6, until_us, 0),
        ThreadState::Waiting(WaitReason::Join(t)) => (7, t.0, 0),
        ThreadState::Waiting(WaitReason::Receive { server, buffer }) => (8, server.0, buffer),
        ThreadState::Waiting(WaitReason::Reply(session)) => (9, session.0, 0),
    };
    s.absorb_u8(&mut tag)?;
    s.absorb_u64(&mut a)?;
    s.absorb_u32(&mut b)?;
    *state = match tag {
        0 => ThreadState::Ready,
        1 => ThreadState::Running,
        2 => ThreadState::Suspended,
        3 => ThreadState::Dead,
        4 => ThreadState::Waiting(WaitReason::Object(ObjectId(a))),
        5 => ThreadState::Waiting(WaitReason::Request),
        6 => ThreadState::Waiting(WaitReason::Sleep { until_us: a }),
        7 => ThreadState::Waiting(WaitReason::Join(ObjectId(a))),
        8 => ThreadState::Waiting(WaitReason::Receive {
            server: ObjectId(a),
            buffer: b,
        }),
        9 => ThreadState::Waiting(WaitReason::Reply(ObjectId(a))),
        _ => return Err(SnapshotError::Corrupt("unknown thread state")),
    };
    Ok(())
}

fn absorb_handles(s: &mut StateSerializer<'_>, table: &mut HandleTable) -> SnapResult<()> {
    s.absorb_vec(&mut table.slots, MAX_HANDLE_SLOTS, |s, slot: &mut HandleSlot| {
        s.absorb_u16(&mut slot.generation)?;
        s.absorb(&mut slot.object)
    })?;
    let mut free: Vec<u16> = table.free.iter().copied().collect();
    s.absorb_vec(&mut free, MAX_HANDLE_SLOTS, |s, i| s.absorb_u16(i))?;
    if s.is_reading() {
        table.free = free.into();
        table.live = table.slots.iter().filter(|sl| sl.object.is_some()).count();
    }
    Ok(())
}

fn absorb_process(s: &mut StateSerializer<'_>, p: &mut Process) -> SnapResult<()> {
    s.absorb_u64(&mut p.space.0)?;
    absorb_handles(s, &mut p.handles)?;
    absorb_ids(s, &mut p.threads)?;
    s.absorb(&mut p.primary)?;
    let mut state = p.state.to_u8();
    s.absorb_u8(&mut state)?;
    p.state = ProcessState::from_u8(state).ok_or(SnapshotError::Corrupt("unknown process state"))?;
    s.absorb(&mut p.exit)?;
    s.absorb_string(&mut p.exe_path)?;
    s.absorb_string(&mut p.cmdline)
}

fn absorb_thread(s: &mut StateSerializer<'_>, t: &mut Thread) -> SnapResult<()> {
    s.absorb(&mut t.process)?;
    s.absorb_u8(&mut t.base_priority)?;
    s.absorb_u8(&mut t.priority)?;
    absorb_thread_state(s, &mut t.state)?;
    s.absorb(&mut t.context)?;
    absorb_ids(s, &mut t.joiners)?;
    s.absorb(&mut t.exit)?;
    s.absorb_u32(&mut t.request_count)?;
    let mut stack = t.stack.map(|c| c.0);
    s.absorb(&mut stack)?;
    t.stack = stack.map(ChunkId);
    absorb_ids(s, &mut t.held)?;
    s.absorb_bool(&mut t.suspend_after_wait)
}

fn absorb_body(s: &mut StateSerializer<'_>, body: &mut KernelObject) -> SnapResult<()> {
    match body {
        KernelObject::Process(p) => absorb_process(s, p),
        KernelObject::Thread(t) => absorb_thread(s, t),
        KernelObject::Chunk(c) => s.absorb_u64(&mut c.chunk.0),
        KernelObject::Mutex(m) => {
            s.absorb(&mut m.holder)?;
            s.absorb_u32(&mut m.count)?;
            absorb_ids(s, &mut m.waiters)
        }
        KernelObject::Semaphore(sem) => {
            s.absorb_i32(&mut sem.count)?;
            absorb_ids(s, &mut sem.waiters)
        }
        KernelObject::Timer(t) => {
            let mut present = t.pending.is_some();
            s.absorb_bool(&mut present)?;
            let mut req = t.pending.unwrap_or(TimerRequest {
                thread: ObjectId(0),
                status_addr: 0,
                deadline_us: 0,
            });
            if present {
                s.absorb(&mut req.thread)?;
                s.absorb_u32(&mut req.status_addr)?;
                s.absorb_u64(&mut req.deadline_us)?;
            }
            t.pending = present.then_some(req);
            Ok(())
        }
        KernelObject::Server(srv) => {
            s.absorb(&mut srv.owner_thread)?;
            let mut queue: Vec<u32> = srv.queue.iter().copied().collect();
            s.absorb_vec(&mut queue, MAX_MESSAGES, |s, id| s.absorb_u32(id))?;
            srv.queue = queue.into();
            let mut receiver = srv.receiver.map(|(t, _)| t);
            let mut buffer = srv.receiver.map_or(0, |(_, b)| b);
            s.absorb(&mut receiver)?;
            s.absorb_u32(&mut buffer)?;
            srv.receiver = receiver.map(|t| (t, buffer));
            Ok(())
        }
        KernelObject::Session(sess) => {
            s.absorb(&mut sess.server)?;
            s.absorb(&mut sess.outstanding)
        }
        KernelObject::LogicalDevice(d) => {
            s.absorb_u8(&mut d.major)?;
            s.absorb_u8(&mut d.minor)?;
            s.absorb_u16(&mut d.build)
        }
    }
}

/// An empty body of `kind` for the reader to fill in.
fn blank_body(kind: ObjectKind, handle_capacity: usize) -> KernelObject {
    match kind {
        ObjectKind::Process => KernelObject::Process(Process::new(
            SpaceId(0),
            HandleTable::new(handle_capacity),
            String::new(),
            String::new(),
        )),
        ObjectKind::Thread => KernelObject::Thread(Thread::new(ObjectId(0), 0, Context::default())),
        ObjectKind::Chunk => KernelObject::Chunk(ChunkObject { chunk: ChunkId(0) }),
        ObjectKind::Mutex => KernelObject::Mutex(Mutex::default()),
        ObjectKind::Semaphore => KernelObject::Semaphore(Semaphore::default()),
        ObjectKind::Timer => KernelObject::Timer(Timer::default()),
        ObjectKind::Server => KernelObject::Server(Server::default()),
        ObjectKind::Session => KernelObject::Session(Session {
            server: None,
            outstanding: None,
        }),
        ObjectKind::LogicalDevice => KernelObject::LogicalDevice(LogicalDevice::default()),
    }
}

fn absorb_entry(
    s: &mut StateSerializer<'_>,
    e: &mut ObjectEntry,
    handle_capacity: usize,
) -> SnapResult<()> {
    s.absorb(&mut e.id)?;
    let mut tag = e.kind().tag();
    s.absorb_u8(&mut tag)?;
    if s.is_reading() {
        let kind = ObjectKind::from_tag(tag).ok_or(SnapshotError::Corrupt("unknown object kind"))?;
        e.body = blank_body(kind, handle_capacity);
    }
    s.absorb_string(&mut e.name)?;
    s.absorb(&mut e.owner)?;
    s.absorb_u32(&mut e.refs)?;
    s.absorb_bool(&mut e.pinned)?;
    s.absorb_bool(&mut e.pending_destroy)?;
    absorb_body(s, &mut e.body)
}

/// Everything in the `KERN` section, detached from a live kernel.
#[derive(Debug, Default)]
struct KernelImage {
    now_us: u64,
    remainder: u128,
    next_id: u64,
    entries: Vec<ObjectEntry>,
    current: Option<ObjectId>,
    slice_used: u64,
    /// `(priority, thread)` most urgent first, queue order within a level.
    ready: Vec<(u8, ObjectId)>,
    next_message: u32,
    messages: Vec<Message>,
}

impl KernelImage {
    fn capture(k: &Kernel) -> Self {
        let (now_us, remainder) = k.clock.raw_parts();
        Self {
            now_us,
            remainder,
            next_id: k.objects.next_id,
            entries: k.objects.entries().cloned().collect(),
            current: k.scheduler.current(),
            slice_used: k.scheduler.slice_used(),
            ready: k.scheduler.ready().collect(),
            next_message: k.next_message,
            messages: k.messages.values().copied().collect(),
        }
    }

    fn walk(&mut self, s: &mut StateSerializer<'_>, handle_capacity: usize) -> SnapResult<()> {
        s.absorb_u64(&mut self.now_us)?;
        let mut rem_lo = self.remainder as u64;
        let mut rem_hi = (self.remainder >> 64) as u64;
        s.absorb_u64(&mut rem_lo)?;
        s.absorb_u64(&mut rem_hi)?;
        self.remainder = (u128::from(rem_hi) << 64) | u128::from(rem_lo);

        s.absorb_u64(&mut self.next_id)?;
        let count = s.absorb_count(self.entries.len(), MAX_OBJECTS)?;
        match s.mode() {
            Mode::Write => {
                for e in &mut self.entries {
                    absorb_entry(s, e, handle_capacity)?;
                }
            }
            Mode::Read => {
                self.entries.clear();
                for _ in 0..count {
                    let mut e = ObjectEntry {
                        id: ObjectId(0),
                        name: String::new(),
                        owner: None,
                        refs: 0,
                        pinned: false,
                        pending_destroy: false,
                        body: KernelObject::Mutex(Mutex::default()),
                    };
                    absorb_entry(s, &mut e, handle_capacity)?;
                    self.entries.push(e);
                }
            }
        }

        s.absorb(&mut self.current)?;
        s.absorb_u64(&mut self.slice_used)?;
        s.absorb_vec(&mut self.ready, MAX_OBJECTS, |s, (prio, t)| {
            s.absorb_u8(prio)?;
            s.absorb(t)
        })?;
        s.absorb_u32(&mut self.next_message)?;
        s.absorb_vec(&mut self.messages, MAX_MESSAGES, |s, m| s.absorb(m))
    }
}

/// Restored kernel state that has passed validation and is ready to swap in.
struct Staged {
    objects: ObjectTable,
    scheduler: Scheduler,
    clock: GuestClock,
    next_message: u32,
    messages: BTreeMap<u32, Message>,
}

fn corrupt(what: &'static str) -> SnapshotError {
    SnapshotError::Corrupt(what)
}

fn dangling(what: &'static str, id: ObjectId) -> SnapshotError {
    SnapshotError::DanglingReference { what, id: id.0 }
}

impl Kernel {
    /// Turn a decoded image into fresh kernel state, checking every reference between objects and
    /// into the staged memory system.
    fn build_staged(&self, image: KernelImage, mem: &MemorySystem) -> SnapResult<Staged> {
        let clock = GuestClock::from_raw_parts(self.config.cpu_hz, image.now_us, image.remainder)
            .ok_or(corrupt("guest clock remainder out of range"))?;

        let mut objects = ObjectTable::new(self.config.object_limit);
        objects.next_id = image.next_id;
        if image.entries.len() > self.config.object_limit {
            return Err(corrupt("more objects than the configured limit"));
        }
        for e in image.entries {
            if e.id.0 == 0 || e.id.0 >= image.next_id {
                return Err(corrupt("object id out of range"));
            }
            if objects.entries.insert(e.id, e).is_some() {
                return Err(corrupt("duplicate object id"));
            }
        }

        let messages: BTreeMap<u32, Message> = image.messages.into_iter().map(|m| (m.id, m)).collect();
        validate_graph(&objects, mem, &messages, image.next_message)?;

        let mut scheduler = Scheduler::new(self.config.quantum);
        let mut queued = BTreeSet::new();
        for (prio, t) in image.ready {
            let thread = objects.thread(t).map_err(|_| dangling("ready queue entry", t))?;
            if thread.state != ThreadState::Ready || thread.priority != prio || !queued.insert(t) {
                return Err(corrupt("ready queue disagrees with thread state"));
            }
            scheduler.enqueue(t, prio);
        }
        let ready_threads = objects
            .entries()
            .filter(|e| matches!(&e.body, KernelObject::Thread(t) if t.state == ThreadState::Ready))
            .count();
        if ready_threads != queued.len() {
            return Err(corrupt("ready thread missing from the run queue"));
        }
        let running: Vec<ObjectId> = objects
            .entries()
            .filter(|e| matches!(&e.body, KernelObject::Thread(t) if t.state == ThreadState::Running))
            .map(|e| e.id)
            .collect();
        match (image.current, running.as_slice()) {
            (None, []) => {}
            (Some(c), [r]) if c == *r => {}
            _ => return Err(corrupt("running thread does not match the scheduler")),
        }
        scheduler.set_current(image.current);
        scheduler.set_slice_used(image.slice_used);

        Ok(Staged {
            objects,
            scheduler,
            clock,
            next_message: image.next_message,
            messages,
        })
    }
}

fn expect_kind(
    objects: &ObjectTable,
    id: ObjectId,
    kind: ObjectKind,
    what: &'static str,
) -> SnapResult<()> {
    match objects.kind_of(id) {
        Ok(k) if k == kind => Ok(()),
        _ => Err(dangling(what, id)),
    }
}

fn validate_graph(
    objects: &ObjectTable,
    mem: &MemorySystem,
    messages: &BTreeMap<u32, Message>,
    next_message: u32,
) -> SnapResult<()> {
    let mut handle_refs: BTreeMap<ObjectId, u32> = BTreeMap::new();

    for e in objects.entries() {
        if let Some(owner) = e.owner {
            expect_kind(objects, owner, ObjectKind::Process, "object owner")?;
        }
        match &e.body {
            KernelObject::Process(p) => {
                if mem.space(p.space).is_err() && p.state != ProcessState::Dead {
                    return Err(SnapshotError::DanglingReference {
                        what: "process address space",
                        id: p.space.0,
                    });
                }
                let table = &p.handles;
                if table.slots.first().map_or(true, |s| s.object.is_some()) {
                    return Err(corrupt("handle table placeholder slot"));
                }
                for slot in &table.slots {
                    if let Some(o) = slot.object {
                        if !objects.contains(o) {
                            return Err(dangling("handle", o));
                        }
                        *handle_refs.entry(o).or_default() += 1;
                    }
                }
                for &i in &table.free {
                    let slot = table.slots.get(usize::from(i)).ok_or(corrupt("free handle slot"))?;
                    if i == 0 || slot.object.is_some() {
                        return Err(corrupt("free list names a live slot"));
                    }
                }
                if table.live > table.capacity {
                    return Err(corrupt("handle table over capacity"));
                }
                for &t in &p.threads {
                    let thread = objects.thread(t).map_err(|_| dangling("process thread", t))?;
                    if thread.process != e.id {
                        return Err(corrupt("thread listed under the wrong process"));
                    }
                }
                if let Some(primary) = p.primary {
                    if !p.threads.contains(&primary) {
                        return Err(dangling("primary thread", primary));
                    }
                }
            }
            KernelObject::Thread(t) => {
                expect_kind(objects, t.process, ObjectKind::Process, "thread process")?;
                if t.priority > PRIORITY_MAX || t.base_priority > t.priority {
                    return Err(corrupt("thread priority out of range"));
                }
                match t.state {
                    ThreadState::Waiting(WaitReason::Object(o)) => {
                        let listed = match &objects.get(o).map_err(|_| dangling("wait object", o))?.body {
                            KernelObject::Mutex(m) => m.waiters.contains(&e.id),
                            KernelObject::Semaphore(s) => s.waiters.contains(&e.id),
                            _ => false,
                        };
                        if !listed {
                            return Err(corrupt("waiting thread not on its object's wait list"));
                        }
                    }
                    ThreadState::Waiting(WaitReason::Join(x)) => {
                        let target = objects.thread(x).map_err(|_| dangling("join target", x))?;
                        if !target.joiners.contains(&e.id) {
                            return Err(corrupt("joining thread not registered with its target"));
                        }
                    }
                    ThreadState::Waiting(WaitReason::Receive { server, .. }) => {
                        expect_kind(objects, server, ObjectKind::Server, "receive server")?;
                    }
                    ThreadState::Waiting(WaitReason::Reply(session)) => {
                        expect_kind(objects, session, ObjectKind::Session, "reply session")?;
                    }
                    _ => {}
                }
                for &j in &t.joiners {
                    expect_kind(objects, j, ObjectKind::Thread, "joiner")?;
                }
                for &m in &t.held {
                    let mutex = objects.mutex(m).map_err(|_| dangling("held mutex", m))?;
                    if mutex.holder != Some(e.id) {
                        return Err(corrupt("held mutex names another holder"));
                    }
                }
                if let Some(stack) = t.stack {
                    if mem.chunk(stack).is_err() {
                        return Err(SnapshotError::DanglingReference {
                            what: "thread stack",
                            id: stack.0,
                        });
                    }
                }
            }
            KernelObject::Chunk(c) => {
                if mem.chunk(c.chunk).is_err() {
                    return Err(SnapshotError::DanglingReference {
                        what: "chunk object",
                        id: c.chunk.0,
                    });
                }
            }
            KernelObject::Mutex(m) => {
                if let Some(h) = m.holder {
                    let holder = objects.thread(h).map_err(|_| dangling("mutex holder", h))?;
                    if !holder.held.contains(&e.id) || m.count == 0 {
                        return Err(corrupt("mutex holder does not hold it"));
                    }
                }
                for &w in &m.waiters {
                    expect_kind(objects, w, ObjectKind::Thread, "mutex waiter")?;
                }
            }
            KernelObject::Semaphore(s) => {
                if s.count < 0 {
                    return Err(corrupt("negative semaphore count"));
                }
                for &w in &s.waiters {
                    expect_kind(objects, w, ObjectKind::Thread, "semaphore waiter")?;
                }
            }
            KernelObject::Timer(t) => {
                if let Some(req) = t.pending {
                    expect_kind(objects, req.thread, ObjectKind::Thread, "timer request thread")?;
                }
            }
            KernelObject::Server(s) => {
                for id in &s.queue {
                    if messages.get(id).map(|m| m.server) != Some(e.id) {
                        return Err(corrupt("server queue names an unknown message"));
                    }
                }
                if let Some((t, _)) = s.receiver {
                    expect_kind(objects, t, ObjectKind::Thread, "server receiver")?;
                }
            }
            KernelObject::Session(s) => {
                if let Some(server) = s.server {
                    expect_kind(objects, server, ObjectKind::Server, "session server")?;
                }
            }
            KernelObject::LogicalDevice(_) => {}
        }
    }

    for e in objects.entries() {
        if handle_refs.get(&e.id).copied().unwrap_or(0) != e.refs {
            return Err(corrupt("reference count does not match open handles"));
        }
    }
    for m in messages.values() {
        if m.id == 0 || m.id >= next_message {
            return Err(corrupt("message id out of range"));
        }
        expect_kind(objects, m.server, ObjectKind::Server, "message server")?;
    }
    Ok(())
}

impl Snapshot for Kernel {
    fn do_state(&mut self, s: &mut StateSerializer<'_>) -> SnapResult<()> {
        let capacity = self.config.handle_capacity;
        match s.mode() {
            Mode::Write => {
                let mut image = KernelImage::capture(self);
                s.section(SectionTag::KERNEL, KERNEL_SECTION_VERSION, |s, _| {
                    image.walk(s, capacity)
                })?;
                self.mem.do_state(s)?;
                self.hal.do_state(s)
            }
            Mode::Read => {
                let mut image = KernelImage::default();
                s.section(SectionTag::KERNEL, KERNEL_SECTION_VERSION, |s, _| {
                    image.walk(s, capacity)
                })?;
                let mem = self.mem.stage_restore(s)?;
                let hal = self.hal.stage_restore(s)?;
                let staged = self.build_staged(image, &mem)?;

                self.objects = staged.objects;
                self.scheduler = staged.scheduler;
                self.clock = staged.clock;
                self.next_message = staged.next_message;
                self.messages = staged.messages;
                self.mem = mem;
                self.hal.commit_restore(hal);
                debug!(objects = self.objects.len(), "kernel state restored");
                Ok(())
            }
        }
    }
}
