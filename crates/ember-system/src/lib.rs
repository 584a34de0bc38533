//! Host-facing surface of the kernel emulator.
//!
//! A [`System`] ties a [`Kernel`](ember_kernel::Kernel) to an [`ExecutableCore`] and an
//! [`ImageLoader`]. Host tooling constructs it, calls [`System::startup`], loads an executable
//! and then calls [`System::run_loop`] repeatedly; each call drives a bounded number of scheduler
//! quanta. Other host threads steer the loop through a [`ControlHandle`], and debuggers inspect
//! guest processes through [`ProcessView`].
//!
//! ```
//! use ember_system::core::bytecode::{ByteCodeCore, Program};
//! use ember_system::{FlatLoader, LoopStatus, System, SystemConfig};
//!
//! let mut program = Program::new();
//! program.movi(0, 7).halt();
//! let loader = FlatLoader::new().with_image("z:\\sys\\bin\\hello.exe", program.into_bytes());
//!
//! let mut system = System::new(SystemConfig::default(), ByteCodeCore::new(), loader).unwrap();
//! system.startup().unwrap();
//! let process = system.load("z:\\sys\\bin\\hello.exe", "").unwrap();
//! assert_eq!(system.run_loop(), LoopStatus::Exited);
//!
//! let info = system.processes().into_iter().find(|p| p.id == process).unwrap();
//! assert_eq!(info.exit.unwrap().reason, 7);
//! ```
#![forbid(unsafe_code)]

mod config;
mod control;
pub mod core;
mod error;
mod loader;
mod system;
mod view;

pub use crate::config::{SystemConfig, DEFAULT_LANGUAGE};
pub use crate::control::{Command, ControlHandle};
pub use crate::core::{CoreExit, ExecutableCore, ExitReason, PANIC_UNDEFINED_INSTRUCTION};
pub use crate::error::{AccessError, LoadError, Result, SystemError};
pub use crate::loader::{
    normalize_path, DriveMedia, DriveTable, FlatLoader, ImageLoader, LoadedImage, Mount,
    DEFAULT_PRIORITY, IMAGE_HEADER_LEN, IMAGE_MAGIC,
};
pub use crate::system::{LoopStatus, System};
pub use crate::view::{ProcessInfo, ProcessView, ThreadInfo};
