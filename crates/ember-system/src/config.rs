use ember_hal::DeviceConfig;
use ember_kernel::KernelConfig;
use ember_mem::MemoryConfig;

use crate::error::{Result, SystemError};

/// Language code reported through the kernel HAL group by default (UK English).
pub const DEFAULT_LANGUAGE: i32 = 1;

/// Configuration for [`System`](crate::System).
///
/// `devices` lists every handset the instance can emulate; `device_index` picks the active one.
/// The HAL providers registered at startup are built from the active device, `language` and
/// `os_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub kernel: KernelConfig,
    pub memory: MemoryConfig,
    pub devices: Vec<DeviceConfig>,
    pub device_index: u8,
    pub language: i32,
    /// Reported OS version as `(major, minor)`.
    pub os_version: (u8, u8),
    /// Scheduler quanta driven by one call to [`System::run_loop`](crate::System::run_loop).
    pub slices_per_loop: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            memory: MemoryConfig::default(),
            devices: vec![DeviceConfig::default(), DeviceConfig::communicator()],
            device_index: 0,
            language: DEFAULT_LANGUAGE,
            os_version: (9, 4),
            slices_per_loop: 64,
        }
    }
}

impl SystemConfig {
    /// The default device list with the communicator-class handset active.
    #[must_use]
    pub fn communicator() -> Self {
        Self {
            device_index: 1,
            ..Self::default()
        }
    }

    /// Short quanta and few slices per loop, so host tooling sees thread switches and loop
    /// boundaries after a handful of guest instructions.
    ///
    /// Intended for tests and step-through debugging.
    #[must_use]
    pub fn fine_grained() -> Self {
        let mut cfg = Self::default();
        cfg.kernel.quantum = 64;
        cfg.slices_per_loop = 4;
        cfg
    }

    pub fn active_device(&self) -> Option<&DeviceConfig> {
        self.devices.get(usize::from(self.device_index))
    }

    pub fn validate(&self) -> Result<()> {
        if self.active_device().is_none() {
            return Err(SystemError::InvalidDevice {
                index: self.device_index,
                count: self.devices.len(),
            });
        }
        if self.kernel.quantum == 0 {
            return Err(SystemError::InvalidConfig("kernel quantum must be non-zero"));
        }
        if self.kernel.cpu_hz == 0 {
            return Err(SystemError::InvalidConfig("virtual CPU frequency must be non-zero"));
        }
        if !self.memory.page_size.is_power_of_two() {
            return Err(SystemError::InvalidConfig("page size must be a power of two"));
        }
        if self.slices_per_loop == 0 {
            return Err(SystemError::InvalidConfig("slices_per_loop must be non-zero"));
        }
        if self.language < 0 {
            return Err(SystemError::InvalidConfig("language code must not be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        SystemConfig::default().validate().unwrap();
        SystemConfig::fine_grained().validate().unwrap();

        let cfg = SystemConfig::communicator();
        cfg.validate().unwrap();
        assert_eq!(cfg.active_device().unwrap().display_width, 640);
    }

    #[test]
    fn rejects_missing_device() {
        let cfg = SystemConfig {
            device_index: 9,
            ..SystemConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(SystemError::InvalidDevice { index: 9, count: 2 })
        ));
    }

    #[test]
    fn rejects_odd_page_size() {
        let mut cfg = SystemConfig::default();
        cfg.memory.page_size = 3000;
        assert!(matches!(cfg.validate(), Err(SystemError::InvalidConfig(_))));
    }
}
