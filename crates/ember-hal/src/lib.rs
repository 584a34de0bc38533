//! Hardware abstraction layer registry.
//!
//! Guest code queries device and kernel properties through HAL groups. Each group is served by
//! one [`HalProvider`]; the [`HalRegistry`] maps categories to providers and never replaces a
//! registration once made.
#![forbid(unsafe_code)]

mod device;
mod error;
mod provider;
mod registry;

pub use crate::device::{attr, DeviceAttributes, DeviceConfig, KernelAttributes};
pub use crate::error::{HalError, Result};
pub use crate::provider::{HalCategory, HalProvider};
pub use crate::registry::{HalRegistry, StagedHal};
