#![cfg(not(target_arch = "wasm32"))]

use std::thread;

use ember_hal::{attr, HalCategory, HalError, HalProvider};
use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{DriveMedia, FlatLoader, LoopStatus, System, SystemConfig, SystemError};

const SPIN: &str = "c:\\sys\\bin\\spin.exe";

fn spinning() -> System {
    let mut p = Program::new();
    let top = p.here();
    p.addi(1, 1).b_to(top);
    let loader = FlatLoader::new().with_image(SPIN, p.into_bytes());
    let mut s = System::new(SystemConfig::fine_grained(), ByteCodeCore::new(), loader).unwrap();
    s.startup().unwrap();
    s.load(SPIN, "").unwrap();
    s
}

#[test]
fn pause_from_another_thread_stops_progress() {
    let mut s = spinning();
    let control = s.control();
    let changed = thread::spawn(move || control.pause()).join().unwrap();
    assert!(changed);

    assert_eq!(s.run_loop(), LoopStatus::Paused);
    assert_eq!(s.run_loop(), LoopStatus::Paused);
    assert_eq!(s.kernel().clock().now_us(), 0);

    assert!(s.unpause());
    assert_eq!(s.run_loop(), LoopStatus::Running);
    assert!(s.kernel().clock().now_us() > 0);
}

#[test]
fn exit_request_stops_until_reset() {
    let mut s = spinning();
    let control = s.control();
    thread::spawn(move || control.request_exit()).join().unwrap();

    assert!(s.should_exit());
    assert_eq!(s.run_loop(), LoopStatus::Stopped);
    assert_eq!(s.run_loop(), LoopStatus::Stopped);

    s.reset().unwrap();
    assert!(!s.should_exit());
    assert!(s.loaded().is_empty());
    s.load(SPIN, "").unwrap();
    assert_eq!(s.run_loop(), LoopStatus::Running);
}

#[test]
fn queued_mount_is_applied_at_the_next_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = spinning();
    let control = s.control();
    let path = dir.path().to_path_buf();
    thread::spawn(move || control.mount('E', DriveMedia::Physical, path))
        .join()
        .unwrap();

    assert!(s.drives().get('e').is_none());
    s.run_loop();
    let mount = s.drives().get('e').unwrap();
    assert_eq!(mount.media, DriveMedia::Physical);
    assert_eq!(mount.host_path, dir.path());
}

#[test]
fn device_change_waits_for_reset() {
    let mut s = spinning();
    assert_eq!(
        s.get_hal(HalCategory::VARIANT)
            .unwrap()
            .get(attr::DISPLAY_X_PIXELS)
            .unwrap(),
        240
    );

    s.control().set_device(1);
    s.run_loop();
    assert_eq!(s.pending_device(), Some(1));
    assert_eq!(s.device().display_width, 240);

    s.reset().unwrap();
    assert_eq!(s.pending_device(), None);
    assert_eq!(s.device().name, "Generic Communicator");
    assert_eq!(
        s.get_hal(HalCategory::VARIANT)
            .unwrap()
            .get(attr::DISPLAY_X_PIXELS)
            .unwrap(),
        640
    );
}

#[test]
fn out_of_range_device_is_rejected() {
    let mut s = spinning();
    assert!(matches!(
        s.set_device(9),
        Err(SystemError::InvalidDevice { index: 9, count: 2 })
    ));
    // A bad queued index is dropped with a warning; the loop keeps going.
    s.control().set_device(9);
    assert_eq!(s.run_loop(), LoopStatus::Running);
    assert_eq!(s.pending_device(), None);
}

struct Battery {
    level: i32,
}

const BATTERY: HalCategory = HalCategory(7);

impl HalProvider for Battery {
    fn category(&self) -> HalCategory {
        BATTERY
    }

    fn get(&self, attribute: u32) -> ember_hal::Result<i32> {
        match attribute {
            0 => Ok(self.level),
            _ => Err(HalError::UnknownAttribute {
                category: BATTERY,
                attribute,
            }),
        }
    }
}

#[test]
fn host_providers_survive_reset() {
    let mut s = spinning();
    s.add_new_hal(BATTERY, Box::new(Battery { level: 80 })).unwrap();
    assert!(matches!(
        s.add_new_hal(BATTERY, Box::new(Battery { level: 10 })),
        Err(SystemError::Hal(HalError::DuplicateCategory(BATTERY)))
    ));

    s.set_language(42).unwrap();
    s.set_os_version(9, 2).unwrap();
    s.reset().unwrap();

    assert_eq!(s.get_hal(BATTERY).unwrap().get(0).unwrap(), 80);
    // Default providers are rebuilt from the configuration, which tracked the changes.
    assert_eq!(s.language(), 42);
    assert_eq!(s.os_version(), (9, 2));
}
