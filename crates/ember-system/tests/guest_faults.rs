#![cfg(not(target_arch = "wasm32"))]

use ember_kernel::codes::KERR_NOT_SUPPORTED;
use ember_kernel::{selector, ExitInfo, ExitKind, GLOBAL_TARGET, PANIC_ACCESS_VIOLATION, REG_PC};
use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{FlatLoader, LoopStatus, System, SystemConfig, PANIC_UNDEFINED_INSTRUCTION};

const APP: &str = "c:\\sys\\bin\\app.exe";

fn run_to_exit(code: Vec<u8>) -> ExitInfo {
    let loader = FlatLoader::new().with_image(APP, code);
    let mut s = System::new(SystemConfig::fine_grained(), ByteCodeCore::new(), loader).unwrap();
    s.startup().unwrap();
    let pid = s.load(APP, "").unwrap();
    let mut status = LoopStatus::Running;
    for _ in 0..16 {
        status = s.run_loop();
        if status != LoopStatus::Running {
            break;
        }
    }
    assert_eq!(status, LoopStatus::Exited);
    let exit = s
        .processes()
        .into_iter()
        .find(|p| p.id == pid)
        .and_then(|p| p.exit)
        .unwrap();
    exit
}

#[test]
fn store_into_code_panics_with_access_violation() {
    let mut p = Program::new();
    // r1 = address of this instruction, inside the code chunk.
    p.mov(1, REG_PC as u8).str(0, 1).movi(0, 1).halt();
    let exit = run_to_exit(p.into_bytes());
    assert_eq!(
        exit,
        ExitInfo {
            kind: ExitKind::Panic,
            reason: PANIC_ACCESS_VIOLATION,
        }
    );
}

#[test]
fn load_from_unmapped_memory_panics() {
    let mut p = Program::new();
    p.movi(1, 0x10).ldr(0, 1).halt();
    let exit = run_to_exit(p.into_bytes());
    assert_eq!(exit.kind, ExitKind::Panic);
    assert_eq!(exit.reason, PANIC_ACCESS_VIOLATION);
}

#[test]
fn undefined_opcode_panics_the_thread() {
    let mut p = Program::new();
    p.nop();
    let mut code = p.into_bytes();
    code.push(0xEE);
    let exit = run_to_exit(code);
    assert_eq!(exit.kind, ExitKind::Panic);
    assert_eq!(exit.reason, PANIC_UNDEFINED_INSTRUCTION);
}

#[test]
fn unimplemented_service_returns_not_supported_and_continues() {
    let mut p = Program::new();
    // The result lands in r0, which halt reports as the exit reason.
    p.svc(selector(GLOBAL_TARGET, 0x7777)).halt();
    let exit = run_to_exit(p.into_bytes());
    assert_eq!(exit.kind, ExitKind::Exit);
    assert_eq!(exit.reason, KERR_NOT_SUPPORTED);
}
