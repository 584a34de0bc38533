#![cfg(not(target_arch = "wasm32"))]

use std::fs;

use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{
    DriveMedia, FlatLoader, LoadError, LoadedImage, LoopStatus, System, SystemConfig, SystemError,
};

fn system() -> System {
    let mut s =
        System::new(SystemConfig::default(), ByteCodeCore::new(), FlatLoader::new()).unwrap();
    s.startup().unwrap();
    s
}

#[test]
fn loads_a_headered_image_from_a_mounted_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("sys").join("bin")).unwrap();

    let mut p = Program::new();
    p.movi(0, 0x55).halt();
    // Two padding bytes ahead of the entry point.
    let mut code = vec![0xEE, 0xEE];
    code.extend_from_slice(p.as_bytes());
    let image = LoadedImage {
        name: String::new(),
        code,
        entry_offset: 2,
        stack_size: 0x2000,
        priority: 33,
    };
    fs::write(dir.path().join("sys").join("bin").join("app.exe"), image.to_bytes()).unwrap();

    let mut s = system();
    s.mount('C', DriveMedia::Physical, dir.path());
    let pid = s.load("C:\\Sys\\Bin\\App.exe", "-x 1").unwrap();

    let view = s.process_view(pid).unwrap();
    assert_eq!(view.name(), "App");
    assert_eq!(view.exe_path(), "C:\\Sys\\Bin\\App.exe");
    assert_eq!(view.cmdline(), "-x 1");
    let main = &view.threads()[0];
    assert_eq!(main.priority, 33);
    assert_eq!(view.read_u8(u64::from(main.pc)).unwrap(), 0x02);

    assert_eq!(s.run_loop(), LoopStatus::Exited);
    assert_eq!(s.processes()[0].exit.unwrap().reason, 0x55);
}

#[test]
fn missing_file_and_unmounted_drive_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = system();
    s.mount('c', DriveMedia::Physical, dir.path());

    assert!(matches!(
        s.load("c:\\sys\\bin\\nope.exe", ""),
        Err(SystemError::Load(LoadError::NotFound(_)))
    ));
    assert!(matches!(
        s.load("d:\\sys\\bin\\app.exe", ""),
        Err(SystemError::Load(LoadError::NotMounted('d')))
    ));
    assert!(matches!(
        s.load("c:\\..\\escape.exe", ""),
        Err(SystemError::Load(LoadError::BadPath(_)))
    ));
    assert!(s.processes().is_empty());
}

#[test]
fn malformed_image_creates_no_process() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("empty.exe"), b"").unwrap();
    let mut s = system();
    s.mount('c', DriveMedia::Physical, dir.path());

    assert!(matches!(
        s.load("c:\\empty.exe", ""),
        Err(SystemError::Load(LoadError::Malformed { .. }))
    ));
    assert!(s.processes().is_empty());
    assert!(s.loaded().is_empty());
}

#[test]
fn loading_requires_startup() {
    let mut s =
        System::new(SystemConfig::default(), ByteCodeCore::new(), FlatLoader::new()).unwrap();
    assert!(matches!(
        s.load("c:\\app.exe", ""),
        Err(SystemError::NotStarted)
    ));
}
