#![cfg(not(target_arch = "wasm32"))]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ember_system::core::bytecode::Program;

fn resolve_cli_exe() -> PathBuf {
    // Use the workspace `target/` dir rather than `CARGO_BIN_EXE_*`, which is not set in every
    // test invocation mode.
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let target_dir = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| repo_root.join("target"));
    let exe_name = format!("ember{}", std::env::consts::EXE_SUFFIX);
    let debug_exe = target_dir.join("debug").join(&exe_name);
    let release_exe = target_dir.join("release").join(&exe_name);
    if debug_exe.exists() {
        debug_exe
    } else if release_exe.exists() {
        release_exe
    } else {
        panic!(
            "expected ember binary at {} or {}",
            debug_exe.display(),
            release_exe.display()
        );
    }
}

fn install(drive: &Path, name: &str, program: &Program) {
    let bin = drive.join("sys").join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    std::fs::write(bin.join(name), program.as_bytes()).unwrap();
}

fn run(args: &[&str]) -> Output {
    let output = Command::new(resolve_cli_exe())
        .args(args)
        .output()
        .expect("failed to run ember CLI");
    assert!(
        output.status.success(),
        "ember exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

#[test]
fn runs_an_image_to_completion() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut p = Program::new();
    p.movi(0, 7).halt();
    install(tmp.path(), "hello.exe", &p);

    let mount = format!("c={}", tmp.path().display());
    let output = run(&[
        "--mount",
        &mount,
        "--list-processes",
        "c:\\sys\\bin\\hello.exe",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("hello\tc:\\sys\\bin\\hello.exe\tExit 7"),
        "unexpected listing:\n{stdout}"
    );
}

#[test]
fn snapshot_written_by_one_run_resumes_in_the_next() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut p = Program::new();
    let top = p.here();
    p.addi(1, 1).b_to(top);
    install(tmp.path(), "spin.exe", &p);
    let snapshot = tmp.path().join("spin.snap");
    let snapshot = snapshot.to_str().expect("temp path should be UTF-8");

    let mount = format!("c={}", tmp.path().display());
    run(&[
        "--mount",
        &mount,
        "--max-loops",
        "3",
        "--snapshot-save",
        snapshot,
        "c:\\sys\\bin\\spin.exe",
    ]);
    let output = run(&[
        "--snapshot-load",
        snapshot,
        "--max-loops",
        "3",
        "--list-processes",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("spin\tc:\\sys\\bin\\spin.exe\tRunning"),
        "unexpected listing:\n{stdout}"
    );
}

#[test]
fn missing_image_fails_with_context() {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mount = format!("c={}", tmp.path().display());
    let output = Command::new(resolve_cli_exe())
        .args(["--mount", &mount, "c:\\sys\\bin\\absent.exe"])
        .output()
        .expect("failed to run ember CLI");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load"), "stderr:\n{stderr}");
}
