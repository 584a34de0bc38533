//! Debugger and scripting access to one guest process.
//!
//! Every accessor reports unmapped memory as [`AccessError::Unmapped`]; nothing here can fault
//! a guest thread or panic the host. Listings are copies taken at the time of the call.

use ember_kernel::{ExitInfo, Kernel, ObjectId, ProcessState, ThreadState};
use ember_mem::{AccessType, ChunkId, SpaceId};

use crate::error::AccessError;

/// Point-in-time description of a guest thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ObjectId,
    pub name: String,
    pub priority: u8,
    pub state: ThreadState,
    pub pc: u32,
    pub exit: Option<ExitInfo>,
}

/// Point-in-time description of a guest process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ObjectId,
    pub name: String,
    pub exe_path: String,
    pub state: ProcessState,
    pub exit: Option<ExitInfo>,
    pub threads: usize,
}

impl ProcessInfo {
    pub(crate) fn collect(kernel: &Kernel, id: ObjectId) -> Option<Self> {
        let p = kernel.process(id).ok()?;
        Some(Self {
            id,
            name: kernel.name_of(id).ok()?.to_string(),
            exe_path: p.exe_path().to_string(),
            state: p.state(),
            exit: p.exit_info(),
            threads: p.threads().len(),
        })
    }
}

/// Read/write window onto one process's address space.
pub struct ProcessView<'a> {
    kernel: &'a mut Kernel,
    process: ObjectId,
    space: SpaceId,
}

impl<'a> ProcessView<'a> {
    pub(crate) fn new(kernel: &'a mut Kernel, process: ObjectId) -> Result<Self, AccessError> {
        let space = kernel
            .process(process)
            .map_err(|_| AccessError::NoSuchProcess(process))?
            .space();
        Ok(Self {
            kernel,
            process,
            space,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.process
    }

    pub fn name(&self) -> &str {
        self.kernel.name_of(self.process).unwrap_or_default()
    }

    pub fn exe_path(&self) -> &str {
        self.kernel
            .process(self.process)
            .map(|p| p.exe_path())
            .unwrap_or_default()
    }

    pub fn cmdline(&self) -> &str {
        self.kernel
            .process(self.process)
            .map(|p| p.cmdline())
            .unwrap_or_default()
    }

    /// The process's threads in creation order.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let Ok(ids) = self.kernel.threads_of(self.process) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| {
                let t = self.kernel.thread(id).ok()?;
                Some(ThreadInfo {
                    id,
                    name: self.kernel.name_of(id).ok()?.to_string(),
                    priority: t.priority(),
                    state: t.state(),
                    pc: t.context().pc(),
                    exit: t.exit_info(),
                })
            })
            .collect()
    }

    /// Copy `size` bytes starting at `addr`. Reads honour the read permission, which every
    /// default chunk layout grants.
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, AccessError> {
        self.kernel
            .mem()
            .validate(self.space, addr, size, AccessType::Read)
            .map_err(|fault| AccessError::Unmapped { addr: fault.addr })?;
        let mut out = Vec::new();
        out.try_reserve_exact(size)
            .map_err(|_| AccessError::Unmapped { addr })?;
        out.resize(size, 0);
        self.read_into(addr, &mut out)?;
        Ok(out)
    }

    pub fn read_into(&self, addr: u64, dst: &mut [u8]) -> Result<(), AccessError> {
        self.kernel
            .mem()
            .read(self.space, addr, dst)
            .map_err(|fault| AccessError::Unmapped { addr: fault.addr })
    }

    /// Store `bytes` at `addr`, ignoring chunk protection so breakpoints can be patched into
    /// code. Nothing is written unless every touched page is committed.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), AccessError> {
        let end = addr
            .checked_add(bytes.len() as u64)
            .ok_or(AccessError::Unmapped { addr })?;
        let page = self.kernel.mem().page_size();
        let mut cur = addr;
        while cur < end {
            self.locate(cur)?;
            cur = (cur & !(page - 1)) + page;
        }

        let mut done = 0usize;
        while done < bytes.len() {
            let at = addr + done as u64;
            let (chunk, offset, avail) = self.locate(at)?;
            let n = usize::try_from(avail)
                .unwrap_or(usize::MAX)
                .min(bytes.len() - done);
            self.kernel
                .mem_mut()
                .write_chunk(chunk, offset, &bytes[done..done + n])
                .map_err(|_| AccessError::Unmapped { addr: at })?;
            done += n;
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, AccessError> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, AccessError> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, AccessError> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, AccessError> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// The committed chunk page under `addr`: `(chunk, offset, bytes left in the chunk)`.
    fn locate(&self, addr: u64) -> Result<(ChunkId, u64, u64), AccessError> {
        let unmapped = AccessError::Unmapped { addr };
        let mem = self.kernel.mem();
        let id = mem
            .space(self.space)
            .map_err(|_| unmapped)?
            .chunk_at(addr)
            .ok_or(unmapped)?;
        let chunk = mem.chunk(id).map_err(|_| unmapped)?;
        let offset = addr - chunk.base();
        if !chunk.is_page_committed(offset) {
            return Err(unmapped);
        }
        Ok((id, offset, chunk.reserved_size() - offset))
    }
}
