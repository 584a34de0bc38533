#![cfg(not(target_arch = "wasm32"))]

use ember_kernel::{ordinal, selector, ProcessState, GLOBAL_TARGET, REG_SP};
use ember_system::core::bytecode::{ByteCodeCore, Program};
use ember_system::{FlatLoader, LoadedImage, LoopStatus, System, SystemConfig};

fn global(ordinal: u16) -> u32 {
    selector(GLOBAL_TARGET, ordinal)
}

fn headered(code: Vec<u8>, priority: u8) -> Vec<u8> {
    LoadedImage {
        name: String::new(),
        code,
        entry_offset: 0,
        stack_size: 0x1000,
        priority,
    }
    .to_bytes()
}

#[test]
fn lone_sleeper_fast_forwards_the_clock() {
    let mut p = Program::new();
    p.movi(0, 500)
        .svc(global(ordinal::global::SLEEP_US))
        // r2 = a scratch word just below the stack top.
        .mov(2, REG_SP as u8)
        .addi(2, 16u32.wrapping_neg())
        .mov(0, 2)
        .svc(global(ordinal::global::TIME_NOW_US))
        .ldr(0, 2)
        .halt();
    let loader = FlatLoader::new().with_image("c:\\sys\\bin\\nap.exe", p.into_bytes());
    let mut s = System::new(SystemConfig::fine_grained(), ByteCodeCore::new(), loader).unwrap();
    s.startup().unwrap();
    let pid = s.load("c:\\sys\\bin\\nap.exe", "").unwrap();

    assert_eq!(s.run_loop(), LoopStatus::Exited);
    let exit = s.processes()[0].exit.unwrap();
    assert_eq!(s.processes()[0].id, pid);
    // Six instructions at 100 MHz round down to no time at all.
    assert_eq!(exit.reason, 500);
    assert_eq!(s.kernel().clock().now_us(), 500);
}

#[test]
fn sleeping_thread_yields_to_lower_priority_work() {
    let mut sleeper = Program::new();
    sleeper
        .movi(0, 1_000)
        .svc(global(ordinal::global::SLEEP_US))
        .halt();
    let mut spinner = Program::new();
    let top = spinner.here();
    spinner.addi(1, 1).b_to(top);

    let loader = FlatLoader::new()
        .with_image("c:\\sys\\bin\\sleeper.exe", headered(sleeper.into_bytes(), 30))
        .with_image("c:\\sys\\bin\\spinner.exe", headered(spinner.into_bytes(), 5));
    let mut s = System::new(SystemConfig::fine_grained(), ByteCodeCore::new(), loader).unwrap();
    s.startup().unwrap();
    let sleeper = s.load("c:\\sys\\bin\\sleeper.exe", "").unwrap();
    let spinner = s.load("c:\\sys\\bin\\spinner.exe", "").unwrap();
    let spin_thread = s.kernel().threads_of(spinner).unwrap()[0];

    let mut loops = 0;
    while s.kernel().process(sleeper).unwrap().state() != ProcessState::Dead {
        assert_eq!(s.run_loop(), LoopStatus::Running);
        loops += 1;
        assert!(loops < 10_000, "sleeper never woke");
    }

    assert!(s.kernel().clock().now_us() >= 1_000);
    assert!(s.kernel().context(spin_thread).unwrap().regs[1] > 0);
    assert_eq!(
        s.kernel().process(spinner).unwrap().state(),
        ProcessState::Running
    );
}
