use core::fmt;

use crate::error::{HalError, Result};

/// Identifier of a HAL group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HalCategory(pub u32);

impl HalCategory {
    /// Kernel-level properties such as the UI language and OS version.
    pub const KERNEL: HalCategory = HalCategory(0);
    /// Board/variant properties: machine uid, memory, CPU, display.
    pub const VARIANT: HalCategory = HalCategory(1);

    pub fn name(self) -> Option<&'static str> {
        match self {
            HalCategory::KERNEL => Some("KERNEL"),
            HalCategory::VARIANT => Some("VARIANT"),
            _ => None,
        }
    }
}

impl fmt::Display for HalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "HAL_{}", self.0),
        }
    }
}

/// A pluggable property provider for one HAL category.
///
/// Attribute values are 32-bit signed integers, matching what the guest receives in a register.
/// State saved through [`save_state`](Self::save_state) is opaque to the registry.
pub trait HalProvider: Send {
    fn category(&self) -> HalCategory;

    fn get(&self, attribute: u32) -> Result<i32>;

    fn set(&mut self, attribute: u32, _value: i32) -> Result<()> {
        Err(HalError::ReadOnly {
            category: self.category(),
            attribute,
        })
    }

    /// Serialize mutable provider state. Providers with no mutable state save nothing.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Check that `bytes` would load cleanly without changing the provider.
    fn check_state(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            Ok(())
        } else {
            Err(HalError::BadState {
                category: self.category(),
                reason: "provider has no state",
            })
        }
    }

    /// Replace mutable state with `bytes`, which has already passed
    /// [`check_state`](Self::check_state).
    fn load_state(&mut self, _bytes: &[u8]) {}
}
