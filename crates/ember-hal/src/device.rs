//! Default providers backed by the active device description.

use crate::error::{HalError, Result};
use crate::provider::{HalCategory, HalProvider};

/// Attribute ids understood by the default providers.
pub mod attr {
    pub const MACHINE_UID: u32 = 5;
    pub const CPU_SPEED: u32 = 11;
    pub const MEMORY_RAM: u32 = 17;
    pub const DISPLAY_X_PIXELS: u32 = 26;
    pub const DISPLAY_Y_PIXELS: u32 = 27;
    pub const DISPLAY_STATE: u32 = 30;

    pub const LANGUAGE: u32 = 64;
    pub const OS_VERSION: u32 = 65;
}

/// Static description of an emulated handset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Firmware identifier, e.g. `"RM-1"`.
    pub firmware_code: String,
    pub machine_uid: u32,
    pub ram_bytes: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub cpu_speed_khz: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Generic S60v3".to_string(),
            firmware_code: "generic".to_string(),
            machine_uid: 0x2000_60B0,
            ram_bytes: 64 * 1024 * 1024,
            display_width: 240,
            display_height: 320,
            cpu_speed_khz: 369_000,
        }
    }
}

impl DeviceConfig {
    /// A QVGA-landscape communicator-class device with more memory.
    pub fn communicator() -> Self {
        Self {
            name: "Generic Communicator".to_string(),
            firmware_code: "communicator".to_string(),
            machine_uid: 0x2000_2D83,
            ram_bytes: 128 * 1024 * 1024,
            display_width: 640,
            display_height: 360,
            cpu_speed_khz: 434_000,
        }
    }
}

/// [`HalCategory::VARIANT`] provider: hardware properties of the active device.
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    device: DeviceConfig,
    display_on: bool,
}

impl DeviceAttributes {
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            display_on: true,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }
}

fn as_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

impl HalProvider for DeviceAttributes {
    fn category(&self) -> HalCategory {
        HalCategory::VARIANT
    }

    fn get(&self, attribute: u32) -> Result<i32> {
        Ok(match attribute {
            attr::MACHINE_UID => self.device.machine_uid as i32,
            attr::CPU_SPEED => as_i32(self.device.cpu_speed_khz),
            attr::MEMORY_RAM => as_i32(self.device.ram_bytes),
            attr::DISPLAY_X_PIXELS => as_i32(self.device.display_width),
            attr::DISPLAY_Y_PIXELS => as_i32(self.device.display_height),
            attr::DISPLAY_STATE => i32::from(self.display_on),
            _ => {
                return Err(HalError::UnknownAttribute {
                    category: self.category(),
                    attribute,
                })
            }
        })
    }

    fn set(&mut self, attribute: u32, value: i32) -> Result<()> {
        match attribute {
            attr::DISPLAY_STATE => match value {
                0 | 1 => {
                    self.display_on = value == 1;
                    Ok(())
                }
                _ => Err(HalError::InvalidValue {
                    category: self.category(),
                    attribute,
                    value,
                }),
            },
            attr::MACHINE_UID
            | attr::CPU_SPEED
            | attr::MEMORY_RAM
            | attr::DISPLAY_X_PIXELS
            | attr::DISPLAY_Y_PIXELS => Err(HalError::ReadOnly {
                category: self.category(),
                attribute,
            }),
            _ => Err(HalError::UnknownAttribute {
                category: self.category(),
                attribute,
            }),
        }
    }

    fn save_state(&self) -> Vec<u8> {
        vec![u8::from(self.display_on)]
    }

    fn check_state(&self, bytes: &[u8]) -> Result<()> {
        match bytes {
            [0 | 1] => Ok(()),
            _ => Err(HalError::BadState {
                category: self.category(),
                reason: "expected a single display-state byte",
            }),
        }
    }

    fn load_state(&mut self, bytes: &[u8]) {
        self.display_on = bytes.first() == Some(&1);
    }
}

/// [`HalCategory::KERNEL`] provider: language and OS version.
///
/// The OS version is packed as `major << 8 | minor`.
#[derive(Debug, Clone)]
pub struct KernelAttributes {
    language: i32,
    os_version: (u8, u8),
}

impl KernelAttributes {
    pub fn new(language: i32, os_version: (u8, u8)) -> Self {
        Self {
            language,
            os_version,
        }
    }

    pub fn language(&self) -> i32 {
        self.language
    }

    pub fn os_version(&self) -> (u8, u8) {
        self.os_version
    }
}

impl HalProvider for KernelAttributes {
    fn category(&self) -> HalCategory {
        HalCategory::KERNEL
    }

    fn get(&self, attribute: u32) -> Result<i32> {
        match attribute {
            attr::LANGUAGE => Ok(self.language),
            attr::OS_VERSION => {
                Ok(i32::from(self.os_version.0) << 8 | i32::from(self.os_version.1))
            }
            _ => Err(HalError::UnknownAttribute {
                category: self.category(),
                attribute,
            }),
        }
    }

    fn set(&mut self, attribute: u32, value: i32) -> Result<()> {
        match attribute {
            attr::LANGUAGE if value >= 0 => {
                self.language = value;
                Ok(())
            }
            attr::LANGUAGE => Err(HalError::InvalidValue {
                category: self.category(),
                attribute,
                value,
            }),
            attr::OS_VERSION => {
                let packed = u16::try_from(value).map_err(|_| HalError::InvalidValue {
                    category: self.category(),
                    attribute,
                    value,
                })?;
                self.os_version = ((packed >> 8) as u8, packed as u8);
                Ok(())
            }
            _ => Err(HalError::UnknownAttribute {
                category: self.category(),
                attribute,
            }),
        }
    }

    fn save_state(&self) -> Vec<u8> {
        let mut out = self.language.to_le_bytes().to_vec();
        out.extend_from_slice(&[self.os_version.0, self.os_version.1]);
        out
    }

    fn check_state(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() == 6 && i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) >= 0 {
            Ok(())
        } else {
            Err(HalError::BadState {
                category: self.category(),
                reason: "expected language:i32 and version:u8x2",
            })
        }
    }

    fn load_state(&mut self, bytes: &[u8]) {
        if let [a, b, c, d, major, minor] = *bytes {
            self.language = i32::from_le_bytes([a, b, c, d]);
            self.os_version = (major, minor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_attributes_reflect_config() {
        let dev = DeviceAttributes::new(DeviceConfig::default());
        assert_eq!(dev.get(attr::DISPLAY_X_PIXELS).unwrap(), 240);
        assert_eq!(dev.get(attr::MEMORY_RAM).unwrap(), 64 * 1024 * 1024);
        assert_eq!(dev.get(attr::DISPLAY_STATE).unwrap(), 1);
    }

    #[test]
    fn display_state_is_the_only_writable_device_attribute() {
        let mut dev = DeviceAttributes::new(DeviceConfig::default());
        dev.set(attr::DISPLAY_STATE, 0).unwrap();
        assert_eq!(dev.get(attr::DISPLAY_STATE).unwrap(), 0);
        assert!(matches!(
            dev.set(attr::MEMORY_RAM, 1),
            Err(HalError::ReadOnly { .. })
        ));
        assert!(matches!(
            dev.set(attr::DISPLAY_STATE, 2),
            Err(HalError::InvalidValue { .. })
        ));
    }

    #[test]
    fn kernel_attributes_pack_version() {
        let mut k = KernelAttributes::new(1, (9, 4));
        assert_eq!(k.get(attr::OS_VERSION).unwrap(), 0x0904);
        k.set(attr::OS_VERSION, 0x0902).unwrap();
        assert_eq!(k.os_version(), (9, 2));
        assert!(k.set(attr::LANGUAGE, -1).is_err());
    }

    #[test]
    fn kernel_state_reloads() {
        let k = KernelAttributes::new(13, (9, 1));
        let saved = k.save_state();
        let mut other = KernelAttributes::new(1, (9, 4));
        other.check_state(&saved).unwrap();
        other.load_state(&saved);
        assert_eq!(other.language(), 13);
        assert_eq!(other.os_version(), (9, 1));
        assert!(other.check_state(&saved[..5]).is_err());
    }
}
