//! The kernel proper: object table, scheduler, guest clock and the memory and HAL state they
//! act on. Every mutation of kernel state goes through a method on [`Kernel`].

mod handles;
mod ipc_ops;
mod sync_ops;
mod threads;

use std::collections::BTreeMap;

use ember_hal::HalRegistry;
use ember_mem::{ChunkId, ChunkSpec, MemoryConfig, MemorySystem};
use tracing::debug;

use crate::config::KernelConfig;
use crate::dispatch::ServiceTable;
use crate::error::{KernelError, Result};
use crate::handle::HandleTable;
use crate::ipc::Message;
use crate::object::{ChunkObject, KernelObject, ObjectId, ObjectKind, ObjectTable};
use crate::process::{Process, ProcessState};
use crate::scheduler::Scheduler;
use crate::thread::{Context, Thread, PRIORITY_MAX, REG_PC, REG_SP};
use crate::time::GuestClock;

pub use threads::PANIC_ACCESS_VIOLATION;

/// Result of a kernel operation that may put the calling thread to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Finished immediately with this status.
    Completed(i32),
    /// The thread is now waiting; its result register is written when it is woken.
    Blocked,
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) objects: ObjectTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) clock: GuestClock,
    pub(crate) mem: MemorySystem,
    pub(crate) hal: HalRegistry,
    pub(crate) services: ServiceTable,
    pub(crate) messages: BTreeMap<u32, Message>,
    pub(crate) next_message: u32,
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("objects", &self.objects.len())
            .field("current", &self.scheduler.current())
            .field("now_us", &self.clock.now_us())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn new(config: KernelConfig, mem: MemoryConfig) -> Self {
        Self {
            objects: ObjectTable::new(config.object_limit),
            scheduler: Scheduler::new(config.quantum),
            clock: GuestClock::new(config.cpu_hz),
            mem: MemorySystem::new(mem),
            hal: HalRegistry::new(),
            services: ServiceTable::with_builtin(),
            messages: BTreeMap::new(),
            next_message: 1,
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &GuestClock {
        &self.clock
    }

    pub fn mem(&self) -> &MemorySystem {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut MemorySystem {
        &mut self.mem
    }

    pub fn hal(&self) -> &HalRegistry {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut HalRegistry {
        &mut self.hal
    }

    /// Tear the kernel down, keeping only its HAL registry.
    pub fn into_hal(self) -> HalRegistry {
        self.hal
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceTable {
        &mut self.services
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> + '_ {
        self.messages.values()
    }

    /// Drop every process, thread and object and return to an empty kernel. Registered HAL
    /// providers and services survive; object identities keep counting up.
    pub fn reset(&mut self) {
        let next_id = self.objects.next_id;
        self.objects = ObjectTable::new(self.config.object_limit);
        self.objects.next_id = next_id;
        self.scheduler.clear();
        self.clock.reset();
        self.mem.clear();
        self.messages.clear();
        debug!("kernel reset");
    }

    pub fn process(&self, id: ObjectId) -> Result<&Process> {
        self.objects.process(id)
    }

    pub fn thread(&self, id: ObjectId) -> Result<&Thread> {
        self.objects.thread(id)
    }

    /// Live process identities at this instant.
    pub fn processes(&self) -> Vec<ObjectId> {
        self.objects.ids_of_kind(ObjectKind::Process).collect()
    }

    /// Threads of `process` at this instant, in creation order.
    pub fn threads_of(&self, process: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.objects.process(process)?.threads.clone())
    }

    pub fn name_of(&self, id: ObjectId) -> Result<&str> {
        Ok(self.objects.get(id)?.name())
    }

    /// Create an empty process with its own address space. The process is held by the host until
    /// [`release_host_ref`](Self::release_host_ref).
    pub fn create_process(
        &mut self,
        name: &str,
        exe_path: &str,
        cmdline: &str,
    ) -> Result<ObjectId> {
        let space = self.mem.create_space();
        let handles = HandleTable::new(self.config.handle_capacity);
        let body = Process::new(space, handles, exe_path.to_string(), cmdline.to_string());
        let id = match self.objects.insert(name, None, KernelObject::Process(body)) {
            Ok(id) => id,
            Err(e) => {
                self.mem.destroy_space(space)?;
                return Err(e);
            }
        };
        self.objects.get_mut(id)?.pinned = true;
        debug!(process = id.0, name, space = space.0, "created process");
        Ok(id)
    }

    /// Drop the host's hold on a pinned object; it is destroyed once nothing else keeps it.
    pub fn release_host_ref(&mut self, id: ObjectId) -> Result<()> {
        self.objects.get_mut(id)?.pinned = false;
        self.maybe_destroy(id)
    }

    /// Create a suspended thread in `process` with a freshly committed stack.
    ///
    /// The thread starts at `entry` with `arg` in r0 and the stack pointer at the top of its
    /// stack chunk.
    pub fn create_thread(
        &mut self,
        process: ObjectId,
        name: &str,
        entry: u32,
        stack_size: u64,
        priority: u8,
        arg: u32,
    ) -> Result<ObjectId> {
        if priority > PRIORITY_MAX {
            return Err(KernelError::InvalidArgument("thread priority out of range"));
        }
        let p = self.objects.process(process)?;
        if matches!(p.state, ProcessState::Exiting | ProcessState::Dead) {
            return Err(KernelError::Died("process is exiting"));
        }
        let space = p.space;
        let stack_size = if stack_size == 0 {
            self.config.default_stack_size
        } else {
            stack_size
        };

        let stack = self
            .mem
            .reserve(space, ChunkSpec::local(format!("{name}$stack"), stack_size))?;
        let (base, size) = {
            let c = self.mem.chunk(stack)?;
            (c.base(), c.reserved_size())
        };
        if let Err(e) = self.mem.commit(stack, 0, size) {
            self.mem.release(stack)?;
            return Err(e.into());
        }

        let mut context = Context::default();
        context.regs[0] = arg;
        context.regs[REG_PC] = entry;
        context.regs[REG_SP] = u32::try_from(base + size)
            .map_err(|_| KernelError::InvalidArgument("stack outside 32-bit address range"))?;
        let mut thread = Thread::new(process, priority, context);
        thread.stack = Some(stack);

        let id = match self
            .objects
            .insert(name, Some(process), KernelObject::Thread(thread))
        {
            Ok(id) => id,
            Err(e) => {
                self.mem.release(stack)?;
                return Err(e);
            }
        };
        let p = self.objects.process_mut(process)?;
        p.threads.push(id);
        if p.primary.is_none() {
            p.primary = Some(id);
        }
        debug!(thread = id.0, process = process.0, name, priority, "created thread");
        Ok(id)
    }

    /// Mark a loaded process as running and resume its primary thread.
    pub fn start_process(&mut self, process: ObjectId) -> Result<()> {
        let p = self.objects.process_mut(process)?;
        if p.state != ProcessState::Loading {
            return Err(KernelError::InvalidArgument("process already started"));
        }
        let primary = p
            .primary
            .ok_or(KernelError::InvalidArgument("process has no threads"))?;
        p.state = ProcessState::Running;
        self.resume_thread(primary)
    }

    /// Reserve and optionally commit a chunk for `process` and wrap it in a kernel object.
    ///
    /// Global chunks are owned by nobody and live while handles to them exist; local chunks die
    /// with their process.
    pub fn create_chunk(
        &mut self,
        process: ObjectId,
        spec: ChunkSpec,
        initial_size: u64,
    ) -> Result<ObjectId> {
        let space = self.objects.process(process)?.space;
        let global = spec.region.is_global();
        let name = spec.name.clone();
        if global && !name.is_empty() && self.objects.find_global(ObjectKind::Chunk, &name).is_some()
        {
            return Err(KernelError::AlreadyExists {
                kind: ObjectKind::Chunk,
                name,
            });
        }
        let chunk = self.mem.reserve(space, spec)?;
        if let Err(e) = self.mem.adjust(chunk, initial_size) {
            self.mem.release(chunk)?;
            return Err(e.into());
        }
        let owner = (!global).then_some(process);
        match self
            .objects
            .insert(name, owner, KernelObject::Chunk(ChunkObject { chunk }))
        {
            Ok(id) => Ok(id),
            Err(e) => {
                self.mem.release(chunk)?;
                Err(e)
            }
        }
    }

    /// The address-space chunk behind a chunk object.
    pub fn chunk_of(&self, object: ObjectId) -> Result<ChunkId> {
        Ok(self.objects.chunk(object)?.chunk)
    }

    /// Register a host logical device driver that guest code can open by name.
    pub fn register_logical_device(
        &mut self,
        name: &str,
        device: crate::device::LogicalDevice,
    ) -> Result<ObjectId> {
        if self
            .objects
            .find_global(ObjectKind::LogicalDevice, name)
            .is_some()
        {
            return Err(KernelError::AlreadyExists {
                kind: ObjectKind::LogicalDevice,
                name: name.to_string(),
            });
        }
        let id = self
            .objects
            .insert(name, None, KernelObject::LogicalDevice(device))?;
        self.objects.get_mut(id)?.pinned = true;
        debug!(device = id.0, name, "registered logical device");
        Ok(id)
    }

    /// Read a guest string of `len` bytes at `addr` in `process`'s address space.
    pub(crate) fn read_guest_string(&self, process: ObjectId, addr: u32, len: u32) -> Result<String> {
        const MAX_NAME: u32 = 256;
        if len > MAX_NAME {
            return Err(KernelError::InvalidArgument("name too long"));
        }
        let space = self.objects.process(process)?.space;
        let mut buf = vec![0u8; len as usize];
        self.mem.read(space, u64::from(addr), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Copy `bytes` into a guest buffer of `max` bytes and return the length written.
    pub(crate) fn write_guest_bytes(
        &mut self,
        process: ObjectId,
        addr: u32,
        max: u32,
        bytes: &[u8],
    ) -> Result<u32> {
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|&len| len <= max)
            .ok_or(KernelError::Overflow("guest buffer too small"))?;
        let space = self.objects.process(process)?.space;
        self.mem.write(space, u64::from(addr), bytes)?;
        Ok(len)
    }

    pub(crate) fn alloc_message_id(&mut self) -> Result<u32> {
        let id = self.next_message;
        self.next_message = self
            .next_message
            .checked_add(1)
            .ok_or(KernelError::ResourceExhausted("message identities exhausted"))?;
        Ok(id)
    }
}
