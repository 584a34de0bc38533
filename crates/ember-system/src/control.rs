//! Thread-safe control surface for a running [`System`](crate::System).
//!
//! A UI or debugger thread holds a [`ControlHandle`] while the emulation loop runs elsewhere.
//! Flags are read by the loop at quantum boundaries; commands that change kernel or memory
//! state are queued and applied there too, never in the middle of a quantum.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::loader::DriveMedia;

/// A deferred request from outside the emulation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Mount {
        drive: char,
        media: DriveMedia,
        host_path: PathBuf,
    },
    /// Select the device used from the next reset on.
    SetDevice(u8),
}

#[derive(Debug, Default)]
struct Shared {
    paused: AtomicBool,
    exit: AtomicBool,
    commands: Mutex<VecDeque<Command>>,
}

/// Cloneable handle for pausing, stopping and queueing work on a [`System`](crate::System).
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    shared: Arc<Shared>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the loop at the next quantum boundary. Returns whether this call changed the state.
    pub fn pause(&self) -> bool {
        !self.shared.paused.swap(true, Ordering::AcqRel)
    }

    /// Let a paused loop continue. Returns whether this call changed the state.
    pub fn unpause(&self) -> bool {
        self.shared.paused.swap(false, Ordering::AcqRel)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Ask the loop to stop for good. Checked once per quantum boundary.
    pub fn request_exit(&self) {
        self.shared.exit.store(true, Ordering::Release);
    }

    pub fn should_exit(&self) -> bool {
        self.shared.exit.load(Ordering::Acquire)
    }

    pub fn mount(&self, drive: char, media: DriveMedia, host_path: impl Into<PathBuf>) {
        self.push(Command::Mount {
            drive,
            media,
            host_path: host_path.into(),
        });
    }

    pub fn set_device(&self, index: u8) {
        self.push(Command::SetDevice(index));
    }

    pub fn push(&self, command: Command) {
        self.queue().push_back(command);
    }

    /// Take every queued command in submission order.
    pub fn drain(&self) -> Vec<Command> {
        self.queue().drain(..).collect()
    }

    pub(crate) fn clear_exit(&self) {
        self.shared.exit.store(false, Ordering::Release);
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Command>> {
        // Every critical section is a single push or drain; poisoning carries no torn state.
        self.shared
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
