#![cfg(not(target_arch = "wasm32"))]

use ember_kernel::{
    codes, ordinal, selector, Call, Handle, Intent, Kernel, KernelConfig, KernelError, ObjectId,
    ObjectKind, Result, ServiceDef, ServiceOutcome, ServiceTable, ThreadState, GLOBAL_TARGET,
    REG_SELECTOR, REG_SP,
};
use ember_mem::{ChunkSpec, MemoryConfig};

struct Guest {
    k: Kernel,
    process: ObjectId,
    thread: ObjectId,
    data: u32,
}

fn guest() -> Guest {
    let mut k = Kernel::new(KernelConfig::default(), MemoryConfig::default());
    let process = k.create_process("guest", "guest.exe", "").unwrap();
    let thread = k.create_thread(process, "main", 0x1000, 0, 10, 0).unwrap();
    let chunk = k
        .create_chunk(process, ChunkSpec::local("data", 0x4000), 0x4000)
        .unwrap();
    let id = k.chunk_of(chunk).unwrap();
    let data = k.mem().chunk(id).unwrap().base() as u32;
    k.start_process(process).unwrap();
    assert_eq!(k.schedule().unwrap(), Some(thread));
    Guest {
        k,
        process,
        thread,
        data,
    }
}

impl Guest {
    fn write(&mut self, addr: u32, bytes: &[u8]) {
        let space = self.k.process(self.process).unwrap().space();
        self.k.mem_mut().write(space, u64::from(addr), bytes).unwrap();
    }

    fn call(&mut self, target: u8, ord: u16, regs: &[u32]) -> (Intent, u32) {
        let ctx = self.k.context_mut(self.thread).unwrap();
        ctx.regs[REG_SELECTOR] = selector(target, ord);
        ctx.regs[..regs.len()].copy_from_slice(regs);
        let intent = self.k.dispatch(self.thread).unwrap();
        (intent, self.k.context(self.thread).unwrap().regs[0])
    }
}

#[test]
fn unknown_selector_reports_not_supported() {
    let mut g = guest();
    let (intent, r0) = g.call(GLOBAL_TARGET, 0x7777, &[]);
    assert_eq!(intent, Intent::Continue);
    assert_eq!(r0, codes::KERR_NOT_SUPPORTED as u32);
    assert_eq!(g.k.thread(g.thread).unwrap().state(), ThreadState::Running);
}

#[test]
fn arguments_past_the_registers_come_from_the_stack() {
    let mut g = guest();
    g.write(g.data, b"worker");

    let sp = g.k.context(g.thread).unwrap().regs[REG_SP] - 16;
    g.write(sp, &17u32.to_le_bytes());
    g.write(sp + 4, &0xABCDu32.to_le_bytes());
    g.k.context_mut(g.thread).unwrap().regs[REG_SP] = sp;

    let (intent, r0) = g.call(
        GLOBAL_TARGET,
        ordinal::global::THREAD_CREATE,
        &[g.data, 6, 0x4000, 0x2000],
    );
    assert_eq!(intent, Intent::Continue);

    let worker = g.k.resolve_handle(g.process, g.thread, Handle(r0)).unwrap();
    let t = g.k.thread(worker).unwrap();
    assert_eq!(g.k.name_of(worker).unwrap(), "worker");
    assert_eq!(t.priority(), 17);
    assert_eq!(t.state(), ThreadState::Suspended);
    assert_eq!(t.context().regs[0], 0xABCD);
    assert_eq!(t.context().pc(), 0x4000);
}

#[test]
fn stale_handles_are_reported_to_the_guest() {
    let mut g = guest();
    let (_, r0) = g.call(ObjectKind::Mutex.tag(), ordinal::mutex::WAIT, &[0x0000_7fff]);
    assert_eq!(r0, codes::KERR_BAD_HANDLE as u32);

    let (_, h) = g.call(GLOBAL_TARGET, ordinal::global::TIMER_CREATE, &[]);
    let (_, r0) = g.call(GLOBAL_TARGET, ordinal::global::CLOSE_HANDLE, &[h]);
    assert_eq!(r0, codes::KERR_NONE as u32);
    let (_, r0) = g.call(ObjectKind::Timer.tag(), ordinal::timer::CANCEL, &[h]);
    assert_eq!(r0, codes::KERR_BAD_HANDLE as u32);
}

#[test]
fn handles_of_the_wrong_kind_are_rejected() {
    let mut g = guest();
    let (_, h) = g.call(GLOBAL_TARGET, ordinal::global::TIMER_CREATE, &[]);
    let (_, r0) = g.call(ObjectKind::Mutex.tag(), ordinal::mutex::WAIT, &[h]);
    assert_eq!(r0, codes::KERR_BAD_HANDLE as u32);
}

#[test]
fn semaphore_services_block_and_release() {
    let mut g = guest();
    g.write(g.data, b"sem");
    let (_, h) = g.call(
        GLOBAL_TARGET,
        ordinal::global::SEMAPHORE_CREATE,
        &[g.data, 3, 0, 0],
    );
    let sem_target = ObjectKind::Semaphore.tag();

    let (intent, _) = g.call(sem_target, ordinal::semaphore::WAIT, &[h]);
    assert_eq!(intent, Intent::Blocked);
    assert!(matches!(
        g.k.thread(g.thread).unwrap().state(),
        ThreadState::Waiting(_)
    ));

    let sem = g.k.resolve_handle(g.process, g.thread, Handle(h)).unwrap();
    g.k.semaphore_signal(sem, 2).unwrap();
    assert_eq!(g.k.thread(g.thread).unwrap().state(), ThreadState::Ready);
    assert_eq!(g.k.objects().semaphore(sem).unwrap().count(), 1);
}

#[test]
fn thread_exit_reports_exited() {
    let mut g = guest();
    let (intent, _) = g.call(GLOBAL_TARGET, ordinal::global::THREAD_EXIT, &[5]);
    assert_eq!(intent, Intent::Exited);
    assert_eq!(g.k.process(g.process).unwrap().exit_info().unwrap().reason, 5);
}

#[test]
fn time_is_written_to_guest_memory() {
    let mut g = guest();
    g.k.sleep(g.thread, 1_234).unwrap();
    assert_eq!(g.k.schedule().unwrap(), Some(g.thread));

    let out = g.data + 0x100;
    let (_, r0) = g.call(GLOBAL_TARGET, ordinal::global::TIME_NOW_US, &[out]);
    assert_eq!(r0, codes::KERR_NONE as u32);

    let space = g.k.process(g.process).unwrap().space();
    let mut raw = [0u8; 8];
    g.k.mem().read(space, u64::from(out), &mut raw).unwrap();
    assert_eq!(u64::from_le_bytes(raw), 1_234);
}

fn noop(_: &mut Kernel, _: &Call) -> Result<ServiceOutcome> {
    Ok(ServiceOutcome::value(0))
}

#[test]
fn builtin_table_rejects_a_second_registration() {
    let mut table = ServiceTable::with_builtin();
    assert_eq!(table.get(GLOBAL_TARGET, ordinal::global::YIELD).unwrap().name, "yield");
    let thread = ObjectKind::Thread.tag();
    assert!(table.get(thread, ordinal::thread::LOGON).is_some());

    let before = table.len();
    let def = ServiceDef {
        name: "shadow",
        args: 0,
        handler: noop,
    };
    assert!(matches!(
        table.register(GLOBAL_TARGET, ordinal::global::YIELD, def),
        Err(KernelError::DuplicateService { target: GLOBAL_TARGET, .. })
    ));
    assert_eq!(table.len(), before);
}

#[test]
fn yield_service_leaves_the_quantum_to_the_host() {
    let mut g = guest();
    let quantum = g.k.scheduler().quantum();

    let (intent, ret) = g.call(GLOBAL_TARGET, ordinal::global::YIELD, &[]);
    assert_eq!(intent, Intent::Reschedule);
    assert_eq!(ret, codes::KERR_NONE as u32);
    assert_eq!(g.k.scheduler().slice_remaining(), quantum);

    g.k.yield_quantum();
    assert_eq!(g.k.scheduler().slice_remaining(), 0);
    // Alone at its priority, the thread gets a fresh quantum.
    assert_eq!(g.k.schedule().unwrap(), Some(g.thread));
    assert_eq!(g.k.scheduler().slice_remaining(), quantum);
}
