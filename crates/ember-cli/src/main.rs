#![forbid(unsafe_code)]

// Native-only tool. The wasm32 stub keeps `--workspace` builds for wasm targets compiling.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs;
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use ember_snapshot::Compression;
    use ember_system::core::bytecode::ByteCodeCore;
    use ember_system::{DriveMedia, FlatLoader, LoopStatus, ProcessInfo, System, SystemConfig};
    use tracing::{debug, info, warn};
    use tracing_subscriber::EnvFilter;

    #[derive(Debug, Parser)]
    #[command(about = "Run byte-code guest executables on the HLE kernel")]
    pub struct Args {
        /// Guest path of the executable to start, e.g. `c:\sys\bin\app.exe`.
        #[arg(required_unless_present = "snapshot_load")]
        exe: Option<String>,

        /// Command line passed to the guest process.
        #[arg(long, default_value = "")]
        args: String,

        /// Mount a host directory as a guest drive (`LETTER=DIR`). Repeatable.
        #[arg(long = "mount", value_parser = parse_mount)]
        mounts: Vec<(char, PathBuf)>,

        /// Index of the emulated device: 0 for the default handset, 1 for the communicator.
        #[arg(long, default_value_t = 0)]
        device: u8,

        /// Instructions per scheduler quantum.
        #[arg(long)]
        quantum: Option<u64>,

        /// Stop after this many emulation loops even if guests are still running.
        #[arg(long, default_value_t = 100_000)]
        max_loops: u64,

        /// Restore a snapshot before running instead of starting `exe`.
        #[arg(long)]
        snapshot_load: Option<PathBuf>,

        /// Save a snapshot on exit.
        #[arg(long)]
        snapshot_save: Option<PathBuf>,

        /// Print every guest process and its exit status on exit.
        #[arg(long)]
        list_processes: bool,
    }

    fn parse_mount(s: &str) -> std::result::Result<(char, PathBuf), String> {
        let (letter, dir) = s
            .split_once('=')
            .ok_or_else(|| format!("expected LETTER=DIR, got {s:?}"))?;
        let mut chars = letter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Ok((c, PathBuf::from(dir))),
            _ => Err(format!("{letter:?} is not a drive letter")),
        }
    }

    pub fn main() -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();

        let args = Args::parse();

        let mut config = SystemConfig {
            device_index: args.device,
            ..SystemConfig::default()
        };
        if let Some(quantum) = args.quantum {
            config.kernel.quantum = quantum;
        }

        let mut system = System::new(config, ByteCodeCore::new(), FlatLoader::new())
            .context("invalid system configuration")?;
        for (letter, dir) in &args.mounts {
            system.mount(*letter, DriveMedia::Physical, dir);
        }
        system.startup()?;

        if let Some(path) = &args.snapshot_load {
            let image = fs::read(path)
                .with_context(|| format!("failed to read snapshot: {}", path.display()))?;
            system.pause();
            system
                .load_state(&image)
                .with_context(|| format!("failed to restore snapshot: {}", path.display()))?;
            system.unpause();
            info!(path = %path.display(), "restored snapshot");
        } else if let Some(exe) = &args.exe {
            let pid = system
                .load(exe, &args.args)
                .with_context(|| format!("failed to load {exe}"))?;
            debug!(process = pid.0, exe, "started guest");
        }

        let mut loops = 0u64;
        while loops < args.max_loops {
            loops += 1;
            match system.run_loop() {
                LoopStatus::Running | LoopStatus::Paused => {}
                LoopStatus::Idle => {
                    warn!("every guest thread is blocked with nothing left to wake it");
                    break;
                }
                LoopStatus::Exited | LoopStatus::Stopped => break,
                LoopStatus::Fatal => {
                    let reason = system.fault_reason().unwrap_or("unknown error");
                    bail!("emulation faulted after {loops} loops: {reason}");
                }
            }
        }
        info!(
            loops,
            guest_us = system.kernel().clock().now_us(),
            "emulation stopped"
        );

        if let Some(path) = &args.snapshot_save {
            system.pause();
            let image = system
                .save_state(Compression::Lz4)
                .context("failed to snapshot the system")?;
            fs::write(path, image)
                .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
        }

        if args.list_processes {
            for p in system.processes() {
                println!("{}", describe(&p));
            }
        }
        Ok(())
    }

    fn describe(p: &ProcessInfo) -> String {
        let status = match p.exit {
            Some(exit) => format!("{:?} {}", exit.kind, exit.reason),
            None => format!("{:?}", p.state),
        };
        format!(
            "{}\t{}\t{}\t{}\tthreads={}",
            p.id.0, p.name, p.exe_path, status, p.threads
        )
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
