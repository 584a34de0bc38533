#![cfg(not(target_arch = "wasm32"))]

use ember_kernel::{selector, Call, Kernel, KernelError, ServiceDef, ServiceOutcome, GLOBAL_TARGET};
use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{FlatLoader, LoopStatus, System, SystemConfig, SystemError};

const APP: &str = "c:\\sys\\bin\\app.exe";
const OK: &str = "c:\\sys\\bin\\ok.exe";
const CORRUPT: u16 = 0x0100;

fn corrupt(_: &mut Kernel, _: &Call) -> ember_kernel::Result<ServiceOutcome> {
    Err(KernelError::InvariantViolation("scheduler queues disagree".into()))
}

fn faulted_system() -> System {
    let mut p = Program::new();
    p.svc(selector(GLOBAL_TARGET, CORRUPT)).halt();
    let mut ok = Program::new();
    ok.movi(0, 1).halt();
    let loader = FlatLoader::new()
        .with_image(APP, p.into_bytes())
        .with_image(OK, ok.into_bytes());
    let mut s = System::new(SystemConfig::fine_grained(), ByteCodeCore::new(), loader).unwrap();
    s.startup().unwrap();
    s.kernel_mut()
        .services_mut()
        .register(
            GLOBAL_TARGET,
            CORRUPT,
            ServiceDef {
                name: "corrupt",
                args: 0,
                handler: corrupt,
            },
        )
        .unwrap();
    s.load(APP, "").unwrap();
    assert_eq!(s.run_loop(), LoopStatus::Fatal);
    s
}

#[test]
fn kernel_inconsistency_latches_fatal() {
    let mut s = faulted_system();
    assert!(s.is_faulted());
    assert!(s.fault_reason().unwrap().contains("scheduler queues disagree"));

    let clock = s.kernel().clock().now_us();
    for _ in 0..3 {
        assert_eq!(s.run_loop(), LoopStatus::Fatal);
    }
    assert_eq!(s.kernel().clock().now_us(), clock);
    assert!(matches!(s.load(APP, ""), Err(SystemError::Faulted(_))));
    assert!(matches!(s.startup(), Err(SystemError::AlreadyStarted)));
}

#[test]
fn reset_recovers_a_faulted_instance() {
    let mut s = faulted_system();
    s.reset().unwrap();
    assert!(!s.is_faulted());
    assert!(s.processes().is_empty());
    assert_eq!(s.run_loop(), LoopStatus::Idle);

    // The fresh kernel only has the built-in services, so the call is now merely unsupported.
    s.load(APP, "").unwrap();
    assert_eq!(s.run_loop(), LoopStatus::Exited);
    assert_eq!(s.processes()[0].exit.unwrap().reason, -5);
}

#[test]
fn shutdown_then_startup_also_recovers() {
    let mut s = faulted_system();
    s.shutdown();
    assert!(!s.is_faulted());
    assert_eq!(s.run_loop(), LoopStatus::Stopped);
    s.startup().unwrap();

    // Shutdown keeps the kernel's service table, so steer clear of the broken service.
    let pid = s.load(OK, "").unwrap();
    assert_eq!(s.run_loop(), LoopStatus::Exited);
    assert_eq!(s.processes()[0].id, pid);
    assert_eq!(s.processes()[0].exit.unwrap().reason, 1);
}
