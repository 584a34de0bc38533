use std::collections::BTreeSet;
use std::path::PathBuf;

use ember_hal::{attr, DeviceAttributes, DeviceConfig, HalCategory, HalProvider, KernelAttributes};
use ember_kernel::{codes, Intent, Kernel, ObjectId, ProcessState, PRIORITY_MAX};
use ember_mem::{ChunkSpec, SpaceView};
use ember_snapshot::{Compression, Mode, SectionTag, Snapshot, SnapshotError, StateSerializer};
use tracing::{debug, trace, warn};

use crate::config::SystemConfig;
use crate::control::{Command, ControlHandle};
use crate::core::{ExecutableCore, ExitReason, PANIC_UNDEFINED_INSTRUCTION};
use crate::error::{AccessError, Result, SystemError};
use crate::loader::{DriveMedia, DriveTable, ImageLoader, LoadedImage};
use crate::view::{ProcessInfo, ProcessView};

const SYSTEM_SECTION_VERSION: u16 = 1;
const MAX_LOADED: usize = 4096;
const MAX_DRIVES: usize = 26;

/// What one call to [`System::run_loop`] ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// Every slice ran; call again to keep going.
    Running,
    /// The control surface asked for a pause.
    Paused,
    /// No thread can run and no deadline is pending, but loaded processes are still alive.
    Idle,
    /// Every loaded process has ended.
    Exited,
    /// Not started, shut down, or an exit was requested.
    Stopped,
    /// An earlier error left the instance inconsistent. Only `reset` or `shutdown` recover.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Faulted(String),
    Shutdown,
}

/// One emulated handset: kernel, execution core, image loader and drive table, driven by
/// [`run_loop`](Self::run_loop).
pub struct System {
    config: SystemConfig,
    kernel: Kernel,
    core: Box<dyn ExecutableCore>,
    loader: Box<dyn ImageLoader>,
    drives: DriveTable,
    control: ControlHandle,
    phase: Phase,
    /// Processes started through [`load`](Self::load). The host keeps them listed after they
    /// die so their exit information stays readable.
    loaded: Vec<ObjectId>,
    /// Device selected by `set_device`, applied by the next reset.
    pending_device: Option<u8>,
    /// Categories registered through `add_new_hal`; they survive a reset.
    user_hal: BTreeSet<HalCategory>,
}

impl core::fmt::Debug for System {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("System")
            .field("phase", &self.phase)
            .field("device_index", &self.config.device_index)
            .field("loaded", &self.loaded)
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}

impl System {
    pub fn new(
        config: SystemConfig,
        core: impl ExecutableCore + 'static,
        loader: impl ImageLoader + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let kernel = Kernel::new(config.kernel.clone(), config.memory.clone());
        Ok(Self {
            config,
            kernel,
            core: Box::new(core),
            loader: Box::new(loader),
            drives: DriveTable::new(),
            control: ControlHandle::new(),
            phase: Phase::Created,
            loaded: Vec::new(),
            pending_device: None,
            user_hal: BTreeSet::new(),
        })
    }

    /// Register the default HAL providers for the active device and start accepting work.
    /// Providers added earlier through [`add_new_hal`](Self::add_new_hal) take precedence.
    pub fn startup(&mut self) -> Result<()> {
        match self.phase {
            Phase::Created | Phase::Shutdown => {}
            Phase::Running | Phase::Faulted(_) => return Err(SystemError::AlreadyStarted),
        }
        self.install_default_hal()?;
        self.phase = Phase::Running;
        debug!(device = %self.device().name, "system started");
        Ok(())
    }

    /// Tear down every process and kernel object. Registered HAL providers and mounts stay.
    pub fn shutdown(&mut self) {
        self.kernel.reset();
        self.loaded.clear();
        self.phase = Phase::Shutdown;
        debug!("system shut down");
    }

    /// Return to a freshly started state on a new kernel, applying any pending device change.
    ///
    /// Clears a fault and a pending exit request. Providers added through
    /// [`add_new_hal`](Self::add_new_hal) are moved onto the new kernel.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(index) = self.pending_device.take() {
            self.config.device_index = index;
        }
        let fresh = Kernel::new(self.config.kernel.clone(), self.config.memory.clone());
        let old = std::mem::replace(&mut self.kernel, fresh);
        for (category, provider) in old.into_hal().into_providers() {
            if self.user_hal.contains(&category) {
                self.kernel.hal_mut().register(category, provider)?;
            }
        }
        self.install_default_hal()?;
        self.loaded.clear();
        self.control.clear_exit();
        self.core.flush();
        self.phase = Phase::Running;
        debug!(device = %self.device().name, "system reset");
        Ok(())
    }

    fn install_default_hal(&mut self) -> Result<()> {
        let device = self.device().clone();
        let hal = self.kernel.hal_mut();
        if !hal.contains(HalCategory::VARIANT) {
            hal.register(HalCategory::VARIANT, Box::new(DeviceAttributes::new(device)))?;
        }
        if !hal.contains(HalCategory::KERNEL) {
            hal.register(
                HalCategory::KERNEL,
                Box::new(KernelAttributes::new(
                    self.config.language,
                    self.config.os_version,
                )),
            )?;
        }
        Ok(())
    }

    fn require_running(&self) -> Result<()> {
        match &self.phase {
            Phase::Running => Ok(()),
            Phase::Created | Phase::Shutdown => Err(SystemError::NotStarted),
            Phase::Faulted(reason) => Err(SystemError::Faulted(reason.clone())),
        }
    }

    /// Load the image at `guest_path`, map it into a new process and make its primary thread
    /// ready. Returns the process.
    pub fn load(&mut self, guest_path: &str, args: &str) -> Result<ObjectId> {
        self.require_running()?;
        let image = self.loader.load(guest_path, &self.drives)?;
        let process = self.kernel.create_process(&image.name, guest_path, args)?;
        if let Err(e) = self.map_image(process, &image) {
            warn!(path = guest_path, error = %e, "failed to start image");
            if let Err(cleanup) = self
                .kernel
                .kill_process(process, codes::KERR_GENERAL)
                .and_then(|()| self.kernel.release_host_ref(process))
            {
                warn!(process = process.0, error = %cleanup, "failed to discard half-loaded process");
            }
            return Err(e);
        }
        self.loaded.push(process);
        debug!(process = process.0, path = guest_path, args, "loaded image");
        Ok(process)
    }

    fn map_image(&mut self, process: ObjectId, image: &LoadedImage) -> Result<()> {
        let k = &mut self.kernel;
        let size = image.code.len() as u64;
        // Code chunks are global, so the name must be unique across processes.
        let spec = ChunkSpec::code(format!("{}.code{}", image.name, process.0), size);
        let chunk = k.create_chunk(process, spec, size)?;
        k.open_handle(process, chunk)?;
        let id = k.chunk_of(chunk)?;
        k.mem_mut().write_chunk(id, 0, &image.code)?;

        let base = k.mem().chunk(id)?.base();
        let entry = u32::try_from(base + u64::from(image.entry_offset))
            .map_err(|_| SystemError::InvalidConfig("code region outside 32-bit address space"))?;
        k.create_thread(
            process,
            "Main",
            entry,
            u64::from(image.stack_size),
            image.priority.min(PRIORITY_MAX),
            0,
        )?;
        k.start_process(process)?;
        Ok(())
    }

    /// Drive up to `slices_per_loop` scheduler quanta.
    ///
    /// Queued commands, the exit flag and the pause flag are handled before every quantum.
    /// An error escaping the kernel marks the instance faulted and this and every later call
    /// returns [`LoopStatus::Fatal`].
    pub fn run_loop(&mut self) -> LoopStatus {
        match self.phase {
            Phase::Running => {}
            Phase::Faulted(_) => return LoopStatus::Fatal,
            Phase::Created | Phase::Shutdown => return LoopStatus::Stopped,
        }
        for _ in 0..self.config.slices_per_loop {
            self.apply_commands();
            if self.control.should_exit() {
                return LoopStatus::Stopped;
            }
            if self.control.is_paused() {
                return LoopStatus::Paused;
            }
            match self.run_slice() {
                Ok(None) => {}
                Ok(Some(status)) => return status,
                Err(e) => {
                    self.fault(e);
                    return LoopStatus::Fatal;
                }
            }
        }
        LoopStatus::Running
    }

    fn run_slice(&mut self) -> Result<Option<LoopStatus>> {
        let Some(thread) = self.kernel.schedule()? else {
            let status = if !self.loaded.is_empty() && !self.guests_alive() {
                LoopStatus::Exited
            } else {
                LoopStatus::Idle
            };
            return Ok(Some(status));
        };

        let process = self.kernel.thread(thread)?.process();
        let space = self.kernel.process(process)?.space();
        let budget = self.kernel.scheduler().slice_remaining().max(1);
        let mut ctx = *self.kernel.context(thread)?;
        let exit = {
            let mut mem = SpaceView::new(self.kernel.mem_mut(), space);
            self.core.run(&mut ctx, &mut mem, budget)
        };
        *self.kernel.context_mut(thread)? = ctx;
        self.kernel.account(exit.executed);
        trace!(thread = thread.0, executed = exit.executed, reason = ?exit.reason, "slice");

        match exit.reason {
            ExitReason::BudgetExhausted => {}
            ExitReason::ServiceCall => match self.kernel.dispatch(thread)? {
                Intent::Reschedule => self.kernel.yield_quantum(),
                Intent::Continue | Intent::Blocked | Intent::Exited => {}
            },
            ExitReason::Halt => self.kernel.exit_thread(thread, ctx.regs[0] as i32)?,
            ExitReason::Fault(fault) => self.kernel.thread_fault(thread, fault)?,
            ExitReason::Undefined { pc } => {
                warn!(thread = thread.0, pc = %format_args!("{pc:#010x}"), "undefined instruction");
                self.kernel.panic_thread(thread, PANIC_UNDEFINED_INSTRUCTION)?;
            }
        }
        Ok(None)
    }

    fn guests_alive(&self) -> bool {
        self.loaded.iter().any(|&p| {
            self.kernel
                .process(p)
                .is_ok_and(|p| p.state() != ProcessState::Dead)
        })
    }

    fn fault(&mut self, e: SystemError) {
        warn!(error = %e, "emulation faulted");
        self.phase = Phase::Faulted(e.to_string());
    }

    fn apply_commands(&mut self) {
        for command in self.control.drain() {
            match command {
                Command::Mount {
                    drive,
                    media,
                    host_path,
                } => self.drives.mount(drive, media, host_path),
                Command::SetDevice(index) => {
                    if let Err(e) = self.set_device(index) {
                        warn!(index, error = %e, "ignored device change");
                    }
                }
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.phase, Phase::Faulted(_))
    }

    pub fn fault_reason(&self) -> Option<&str> {
        match &self.phase {
            Phase::Faulted(reason) => Some(reason),
            _ => None,
        }
    }

    /// A handle other host threads can use to pause, stop or queue commands.
    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn unpause(&self) -> bool {
        self.control.unpause()
    }

    pub fn request_exit(&self) {
        self.control.request_exit();
    }

    pub fn should_exit(&self) -> bool {
        self.control.should_exit()
    }

    /// Mount a drive immediately. Other threads go through [`ControlHandle::mount`].
    pub fn mount(&mut self, drive: char, media: DriveMedia, host_path: impl Into<PathBuf>) {
        self.drives.mount(drive, media, host_path);
    }

    pub fn drives(&self) -> &DriveTable {
        &self.drives
    }

    /// Select the device to emulate from the next [`reset`](Self::reset) on.
    pub fn set_device(&mut self, index: u8) -> Result<()> {
        if usize::from(index) >= self.config.devices.len() {
            return Err(SystemError::InvalidDevice {
                index,
                count: self.config.devices.len(),
            });
        }
        self.pending_device = Some(index);
        debug!(index, "device change pending until reset");
        Ok(())
    }

    /// The device currently emulated.
    pub fn device(&self) -> &DeviceConfig {
        // `validate` and `set_device` keep the index in range.
        &self.config.devices[usize::from(self.config.device_index)]
    }

    pub fn pending_device(&self) -> Option<u8> {
        self.pending_device
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Register a provider for `category`. Before [`startup`](Self::startup) this replaces the
    /// default provider for that category; afterwards a second registration is rejected.
    pub fn add_new_hal(
        &mut self,
        category: HalCategory,
        provider: Box<dyn HalProvider>,
    ) -> Result<()> {
        self.kernel.hal_mut().register(category, provider)?;
        self.user_hal.insert(category);
        Ok(())
    }

    pub fn get_hal(&self, category: HalCategory) -> Result<&dyn HalProvider> {
        Ok(self.kernel.hal().get(category)?)
    }

    pub fn language(&self) -> i32 {
        self.kernel
            .hal()
            .query(HalCategory::KERNEL, attr::LANGUAGE)
            .unwrap_or(self.config.language)
    }

    pub fn set_language(&mut self, language: i32) -> Result<()> {
        if self.kernel.hal().contains(HalCategory::KERNEL) {
            self.kernel
                .hal_mut()
                .update(HalCategory::KERNEL, attr::LANGUAGE, language)?;
        } else if language < 0 {
            return Err(SystemError::InvalidConfig("language code must not be negative"));
        }
        self.config.language = language;
        Ok(())
    }

    pub fn os_version(&self) -> (u8, u8) {
        match self.kernel.hal().query(HalCategory::KERNEL, attr::OS_VERSION) {
            Ok(packed) => ((packed >> 8) as u8, packed as u8),
            Err(_) => self.config.os_version,
        }
    }

    pub fn set_os_version(&mut self, major: u8, minor: u8) -> Result<()> {
        if self.kernel.hal().contains(HalCategory::KERNEL) {
            let packed = i32::from(major) << 8 | i32::from(minor);
            self.kernel
                .hal_mut()
                .update(HalCategory::KERNEL, attr::OS_VERSION, packed)?;
        }
        self.config.os_version = (major, minor);
        Ok(())
    }

    /// Every live process, including dead ones the host still holds.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.kernel
            .processes()
            .into_iter()
            .filter_map(|id| ProcessInfo::collect(&self.kernel, id))
            .collect()
    }

    /// Processes started through [`load`](Self::load), in load order.
    pub fn loaded(&self) -> &[ObjectId] {
        &self.loaded
    }

    /// The process whose thread holds the CPU.
    pub fn current_process(&self) -> Option<ObjectId> {
        let thread = self.kernel.scheduler().current()?;
        self.kernel.thread(thread).ok().map(|t| t.process())
    }

    /// Debug access to one process's memory and threads.
    pub fn process_view(
        &mut self,
        process: ObjectId,
    ) -> std::result::Result<ProcessView<'_>, AccessError> {
        ProcessView::new(&mut self.kernel, process)
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// Save or restore the whole instance, depending on the serializer's mode.
    ///
    /// Requires a paused system. A failed restore leaves the instance as it was; a successful
    /// one also clears a fault.
    pub fn do_state(&mut self, s: &mut StateSerializer<'_>) -> Result<()> {
        if matches!(self.phase, Phase::Created | Phase::Shutdown) {
            return Err(SystemError::NotStarted);
        }
        if !self.control.is_paused() {
            return Err(SystemError::NotPaused);
        }
        match s.mode() {
            Mode::Write => {
                self.require_running()?;
                let mut image = SystemImage::capture(self);
                s.section(SectionTag::SYSTEM, SYSTEM_SECTION_VERSION, |s, _| image.walk(s))?;
                self.kernel.do_state(s)?;
            }
            Mode::Read => {
                let mut image = SystemImage::default();
                s.section(SectionTag::SYSTEM, SYSTEM_SECTION_VERSION, |s, _| image.walk(s))?;
                let drives = image.check(&self.config)?;
                if let Err(e) = self.kernel.do_state(s) {
                    warn!(error = %e, "snapshot restore failed");
                    return Err(e.into());
                }

                self.pending_device = image.pending_device;
                self.drives = drives;
                self.loaded = image
                    .loaded
                    .into_iter()
                    .map(ObjectId)
                    .filter(|&p| self.kernel.process(p).is_ok())
                    .collect();
                if let Ok(lang) = self.kernel.hal().query(HalCategory::KERNEL, attr::LANGUAGE) {
                    self.config.language = lang;
                }
                self.config.os_version = self.os_version();
                self.core.flush();
                self.phase = Phase::Running;
                debug!(processes = self.loaded.len(), "system state restored");
            }
        }
        Ok(())
    }

    /// Snapshot the paused instance into a new image.
    pub fn save_state(&mut self, compression: Compression) -> Result<Vec<u8>> {
        let mut w = StateSerializer::writer(compression);
        self.do_state(&mut w)?;
        Ok(w.into_bytes()?)
    }

    /// Restore the paused instance from `image`.
    pub fn load_state(&mut self, image: &[u8]) -> Result<()> {
        let mut r = StateSerializer::reader(image)?;
        self.do_state(&mut r)
    }
}

#[derive(Debug, Default)]
struct DriveImage {
    letter: u8,
    media: u8,
    path: String,
}

/// Host-side state saved in the `SYS_` section, ahead of the kernel.
#[derive(Debug, Default)]
struct SystemImage {
    device_index: u8,
    pending_device: Option<u8>,
    loaded: Vec<u64>,
    drives: Vec<DriveImage>,
}

fn media_to_u8(media: DriveMedia) -> u8 {
    match media {
        DriveMedia::Physical => 0,
        DriveMedia::Rom => 1,
        DriveMedia::Ram => 2,
    }
}

fn media_from_u8(v: u8) -> Option<DriveMedia> {
    match v {
        0 => Some(DriveMedia::Physical),
        1 => Some(DriveMedia::Rom),
        2 => Some(DriveMedia::Ram),
        _ => None,
    }
}

impl SystemImage {
    fn capture(system: &System) -> Self {
        Self {
            device_index: system.config.device_index,
            pending_device: system.pending_device,
            loaded: system.loaded.iter().map(|p| p.0).collect(),
            drives: system
                .drives
                .iter()
                .map(|(letter, mount)| DriveImage {
                    letter: letter as u8,
                    media: media_to_u8(mount.media),
                    path: mount.host_path.to_string_lossy().into_owned(),
                })
                .collect(),
        }
    }

    fn walk(&mut self, s: &mut StateSerializer<'_>) -> ember_snapshot::Result<()> {
        s.absorb_u8(&mut self.device_index)?;
        s.absorb(&mut self.pending_device)?;
        s.absorb_vec(&mut self.loaded, MAX_LOADED, |s, id| s.absorb_u64(id))?;
        s.absorb_vec(&mut self.drives, MAX_DRIVES, |s, d| {
            s.absorb_u8(&mut d.letter)?;
            s.absorb_u8(&mut d.media)?;
            s.absorb_string(&mut d.path)
        })
    }

    /// Validate against the running configuration and rebuild the drive table.
    fn check(&self, config: &SystemConfig) -> ember_snapshot::Result<DriveTable> {
        if self.device_index != config.device_index {
            return Err(SnapshotError::Corrupt("image was taken on a different device"));
        }
        if let Some(index) = self.pending_device {
            if usize::from(index) >= config.devices.len() {
                return Err(SnapshotError::DanglingReference {
                    what: "device",
                    id: u64::from(index),
                });
            }
        }
        let mut drives = DriveTable::new();
        for d in &self.drives {
            if !d.letter.is_ascii_lowercase() {
                return Err(SnapshotError::Corrupt("bad drive letter"));
            }
            let media = media_from_u8(d.media).ok_or(SnapshotError::Corrupt("bad drive media"))?;
            drives.mount(char::from(d.letter), media, &d.path);
        }
        Ok(drives)
    }
}
