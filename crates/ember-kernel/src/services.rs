//! The kernel's built-in services.

use ember_hal::HalCategory;
use ember_mem::ChunkSpec;
use tracing::info;

use crate::dispatch::{Call, ServiceDef, ServiceHandler, ServiceOutcome, ServiceTable, GLOBAL_TARGET};
use crate::error::{KernelError, Result};
use crate::ipc::MESSAGE_ARGS;
use crate::kernel::Kernel;
use crate::object::{ObjectId, ObjectKind};
use crate::thread::ExitInfo;

/// Exit kind reported for a thread or process that is still alive.
pub const EXIT_PENDING: u32 = 3;

/// Service ordinals, grouped by target.
pub mod ordinal {
    pub mod global {
        pub const CLOSE_HANDLE: u16 = 0x00;
        pub const DUPLICATE_HANDLE: u16 = 0x01;
        pub const OPEN_BY_NAME: u16 = 0x02;
        pub const WAIT_FOR_ANY_REQUEST: u16 = 0x03;
        pub const REQUEST_COMPLETE: u16 = 0x04;
        pub const SLEEP_US: u16 = 0x05;
        pub const TIME_NOW_US: u16 = 0x06;
        pub const HAL_GET: u16 = 0x07;
        pub const HAL_SET: u16 = 0x08;
        pub const THREAD_CREATE: u16 = 0x09;
        pub const CHUNK_CREATE_LOCAL: u16 = 0x0A;
        pub const CHUNK_CREATE_GLOBAL: u16 = 0x0B;
        pub const MUTEX_CREATE: u16 = 0x0C;
        pub const SEMAPHORE_CREATE: u16 = 0x0D;
        pub const TIMER_CREATE: u16 = 0x0E;
        pub const SERVER_CREATE: u16 = 0x0F;
        pub const SESSION_CONNECT: u16 = 0x10;
        pub const MESSAGE_COMPLETE: u16 = 0x11;
        pub const THREAD_EXIT: u16 = 0x12;
        pub const DEBUG_PRINT: u16 = 0x13;
        pub const YIELD: u16 = 0x14;
    }

    pub mod process {
        pub const KILL: u16 = 0x00;
        pub const EXIT_REASON: u16 = 0x01;
        pub const EXIT_KIND: u16 = 0x02;
        pub const EXE_PATH: u16 = 0x03;
        pub const COMMAND_LINE: u16 = 0x04;
        pub const NAME: u16 = 0x05;
        pub const ID: u16 = 0x06;
    }

    pub mod thread {
        pub const RESUME: u16 = 0x00;
        pub const SUSPEND: u16 = 0x01;
        pub const KILL: u16 = 0x02;
        pub const SET_PRIORITY: u16 = 0x03;
        pub const PRIORITY: u16 = 0x04;
        pub const LOGON: u16 = 0x05;
        pub const EXIT_REASON: u16 = 0x06;
        pub const EXIT_KIND: u16 = 0x07;
        pub const ID: u16 = 0x08;
    }

    pub mod chunk {
        pub const BASE: u16 = 0x00;
        pub const SIZE: u16 = 0x01;
        pub const MAX_SIZE: u16 = 0x02;
        pub const ADJUST: u16 = 0x03;
        pub const COMMIT: u16 = 0x04;
        pub const DECOMMIT: u16 = 0x05;
    }

    pub mod mutex {
        pub const WAIT: u16 = 0x00;
        pub const SIGNAL: u16 = 0x01;
        pub const IS_HELD: u16 = 0x02;
    }

    pub mod semaphore {
        pub const WAIT: u16 = 0x00;
        pub const SIGNAL: u16 = 0x01;
        pub const COUNT: u16 = 0x02;
    }

    pub mod timer {
        pub const AFTER: u16 = 0x00;
        pub const CANCEL: u16 = 0x01;
    }

    pub mod server {
        pub const RECEIVE: u16 = 0x00;
    }

    pub mod session {
        pub const SEND_RECEIVE: u16 = 0x00;
    }

    pub mod logical_device {
        pub const QUERY_VERSION: u16 = 0x00;
    }
}

pub(crate) fn register_builtin(table: &mut ServiceTable) {
    use ordinal::*;

    let g = GLOBAL_TARGET;
    let p = ObjectKind::Process.tag();
    let t = ObjectKind::Thread.tag();
    let c = ObjectKind::Chunk.tag();
    let m = ObjectKind::Mutex.tag();
    let s = ObjectKind::Semaphore.tag();
    let tm = ObjectKind::Timer.tag();
    let sv = ObjectKind::Server.tag();
    let ss = ObjectKind::Session.tag();
    let ld = ObjectKind::LogicalDevice.tag();

    let builtin: &[(u8, u16, &'static str, u8, ServiceHandler)] = &[
        (g, global::CLOSE_HANDLE, "close_handle", 1, close_handle),
        (g, global::DUPLICATE_HANDLE, "duplicate_handle", 2, duplicate_handle),
        (g, global::OPEN_BY_NAME, "open_by_name", 3, open_by_name),
        (g, global::WAIT_FOR_ANY_REQUEST, "wait_for_any_request", 0, wait_for_any_request),
        (g, global::REQUEST_COMPLETE, "request_complete", 3, request_complete),
        (g, global::SLEEP_US, "sleep_us", 1, sleep_us),
        (g, global::TIME_NOW_US, "time_now_us", 1, time_now_us),
        (g, global::HAL_GET, "hal_get", 3, hal_get),
        (g, global::HAL_SET, "hal_set", 3, hal_set),
        (g, global::THREAD_CREATE, "thread_create", 6, thread_create),
        (g, global::CHUNK_CREATE_LOCAL, "chunk_create_local", 4, chunk_create_local),
        (g, global::CHUNK_CREATE_GLOBAL, "chunk_create_global", 4, chunk_create_global),
        (g, global::MUTEX_CREATE, "mutex_create", 3, mutex_create),
        (g, global::SEMAPHORE_CREATE, "semaphore_create", 4, semaphore_create),
        (g, global::TIMER_CREATE, "timer_create", 0, timer_create),
        (g, global::SERVER_CREATE, "server_create", 2, server_create),
        (g, global::SESSION_CONNECT, "session_connect", 2, session_connect),
        (g, global::MESSAGE_COMPLETE, "message_complete", 2, message_complete),
        (g, global::THREAD_EXIT, "thread_exit", 1, thread_exit),
        (g, global::DEBUG_PRINT, "debug_print", 2, debug_print),
        (g, global::YIELD, "yield", 0, yield_now),
        (p, process::KILL, "process_kill", 1, process_kill),
        (p, process::EXIT_REASON, "process_exit_reason", 0, process_exit_reason),
        (p, process::EXIT_KIND, "process_exit_kind", 0, process_exit_kind),
        (p, process::EXE_PATH, "process_exe_path", 2, process_exe_path),
        (p, process::COMMAND_LINE, "process_command_line", 2, process_command_line),
        (p, process::NAME, "process_name", 2, object_name),
        (p, process::ID, "process_id", 0, object_id),
        (t, thread::RESUME, "thread_resume", 0, thread_resume),
        (t, thread::SUSPEND, "thread_suspend", 0, thread_suspend),
        (t, thread::KILL, "thread_kill", 1, thread_kill),
        (t, thread::SET_PRIORITY, "thread_set_priority", 1, thread_set_priority),
        (t, thread::PRIORITY, "thread_priority", 0, thread_priority),
        (t, thread::LOGON, "thread_logon", 0, thread_logon),
        (t, thread::EXIT_REASON, "thread_exit_reason", 0, thread_exit_reason),
        (t, thread::EXIT_KIND, "thread_exit_kind", 0, thread_exit_kind),
        (t, thread::ID, "thread_id", 0, object_id),
        (c, chunk::BASE, "chunk_base", 0, chunk_base),
        (c, chunk::SIZE, "chunk_size", 0, chunk_size),
        (c, chunk::MAX_SIZE, "chunk_max_size", 0, chunk_max_size),
        (c, chunk::ADJUST, "chunk_adjust", 1, chunk_adjust),
        (c, chunk::COMMIT, "chunk_commit", 2, chunk_commit),
        (c, chunk::DECOMMIT, "chunk_decommit", 2, chunk_decommit),
        (m, mutex::WAIT, "mutex_wait", 0, mutex_wait),
        (m, mutex::SIGNAL, "mutex_signal", 0, mutex_signal),
        (m, mutex::IS_HELD, "mutex_is_held", 0, mutex_is_held),
        (s, semaphore::WAIT, "semaphore_wait", 0, semaphore_wait),
        (s, semaphore::SIGNAL, "semaphore_signal", 1, semaphore_signal),
        (s, semaphore::COUNT, "semaphore_count", 0, semaphore_count),
        (tm, timer::AFTER, "timer_after", 2, timer_after),
        (tm, timer::CANCEL, "timer_cancel", 0, timer_cancel),
        (sv, server::RECEIVE, "server_receive", 1, server_receive),
        (ss, session::SEND_RECEIVE, "session_send_receive", 2, session_send_receive),
        (ld, logical_device::QUERY_VERSION, "ldd_query_version", 1, ldd_query_version),
    ];

    for &(target, ordinal, name, args, handler) in builtin {
        table
            .register(target, ordinal, ServiceDef { name, args, handler })
            .expect("builtin service table is consistent");
    }
}

/// Open a handle to a freshly created object, destroying it if the handle cannot be made.
fn hand_out(k: &mut Kernel, process: ObjectId, object: ObjectId) -> Result<ServiceOutcome> {
    match k.open_handle(process, object) {
        Ok(h) => Ok(ServiceOutcome::value(h.0)),
        Err(e) => {
            k.destroy_object(object)?;
            Err(e)
        }
    }
}

fn guest_name(k: &Kernel, call: &Call, ptr: usize) -> Result<String> {
    k.read_guest_string(call.process, call.arg(ptr), call.arg(ptr + 1))
}

fn exit_kind(exit: Option<ExitInfo>) -> u32 {
    exit.map_or(EXIT_PENDING, |e| u32::from(e.kind.to_u8()))
}

fn close_handle(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.close_handle(call.process, call.handle(0))?;
    Ok(ServiceOutcome::ok())
}

fn duplicate_handle(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let target = k.resolve_kind(call.process, call.thread, call.handle(1), ObjectKind::Process)?;
    let h = k.duplicate_handle(call.process, call.thread, call.handle(0), target)?;
    Ok(ServiceOutcome::value(h.0))
}

fn open_by_name(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let kind = u8::try_from(call.arg(0))
        .ok()
        .and_then(ObjectKind::from_tag)
        .ok_or(KernelError::InvalidArgument("unknown object kind"))?;
    let name = guest_name(k, call, 1)?;
    let h = k.open_by_name(call.process, kind, &name)?;
    Ok(ServiceOutcome::value(h.0))
}

fn wait_for_any_request(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(k.wait_for_any_request(call.thread)?.into())
}

fn request_complete(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let target = k.resolve_kind(call.process, call.thread, call.handle(0), ObjectKind::Thread)?;
    k.complete_request(target, call.arg(1), call.arg_i32(2))?;
    Ok(ServiceOutcome::ok())
}

fn sleep_us(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    match k.sleep(call.thread, u64::from(call.arg(0)))? {
        crate::kernel::WaitOutcome::Completed(_) => Ok(ServiceOutcome::yield_now()),
        blocked => Ok(blocked.into()),
    }
}

fn time_now_us(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let now = k.clock.now_us();
    let space = k.objects.process(call.process)?.space;
    k.mem.write(space, u64::from(call.arg(0)), &now.to_le_bytes())?;
    Ok(ServiceOutcome::ok())
}

fn hal_get(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let value = k.hal.query(HalCategory(call.arg(0)), call.arg(1))?;
    let space = k.objects.process(call.process)?.space;
    k.mem.write(space, u64::from(call.arg(2)), &value.to_le_bytes())?;
    Ok(ServiceOutcome::ok())
}

fn hal_set(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.hal
        .update(HalCategory(call.arg(0)), call.arg(1), call.arg_i32(2))?;
    Ok(ServiceOutcome::ok())
}

fn thread_create(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    let priority =
        u8::try_from(call.arg(4)).map_err(|_| KernelError::InvalidArgument("thread priority"))?;
    let thread = k.create_thread(
        call.process,
        &name,
        call.arg(2),
        u64::from(call.arg(3)),
        priority,
        call.arg(5),
    )?;
    match k.open_handle(call.process, thread) {
        Ok(h) => Ok(ServiceOutcome::value(h.0)),
        Err(e) => {
            k.kill_thread(thread, e.guest_code())?;
            Err(e)
        }
    }
}

fn create_chunk(k: &mut Kernel, call: &Call, spec: ChunkSpec) -> Result<ServiceOutcome> {
    let chunk = k.create_chunk(call.process, spec, u64::from(call.arg(3)))?;
    hand_out(k, call.process, chunk)
}

fn chunk_create_local(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    create_chunk(k, call, ChunkSpec::local(name, u64::from(call.arg(2))))
}

fn chunk_create_global(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    create_chunk(k, call, ChunkSpec::shared(name, u64::from(call.arg(2))))
}

fn mutex_create(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    let mutex = k.create_mutex(call.process, &name, call.arg(2) != 0)?;
    hand_out(k, call.process, mutex)
}

fn semaphore_create(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    let sem = k.create_semaphore(call.process, &name, call.arg_i32(2), call.arg(3) != 0)?;
    hand_out(k, call.process, sem)
}

fn timer_create(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let timer = k.create_timer(call.process, "")?;
    hand_out(k, call.process, timer)
}

fn server_create(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    let server = k.create_server(call.thread, &name)?;
    hand_out(k, call.process, server)
}

fn session_connect(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let name = guest_name(k, call, 0)?;
    let session = k.connect(call.process, &name)?;
    hand_out(k, call.process, session)
}

fn message_complete(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.complete_message(call.thread, call.arg(0), call.arg_i32(1))?;
    Ok(ServiceOutcome::ok())
}

fn thread_exit(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.exit_thread(call.thread, call.arg_i32(0))?;
    Ok(ServiceOutcome::exited())
}

fn debug_print(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let text = guest_name(k, call, 0)?;
    info!(target: "ember::guest", thread = call.thread.0, "{text}");
    Ok(ServiceOutcome::ok())
}

fn yield_now(_: &mut Kernel, _: &Call) -> Result<ServiceOutcome> {
    Ok(ServiceOutcome::yield_now())
}

fn object_id(_: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(ServiceOutcome::value(call.target()?.0 as u32))
}

fn object_name(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let target = call.target()?;
    let name = k.objects.get(target)?.name.clone();
    let len = k.write_guest_bytes(call.process, call.arg(0), call.arg(1), name.as_bytes())?;
    Ok(ServiceOutcome::value(len))
}

fn process_kill(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let target = call.target()?;
    k.kill_process(target, call.arg_i32(0))?;
    if target == call.process {
        return Ok(ServiceOutcome::exited());
    }
    Ok(ServiceOutcome::ok())
}

fn process_exit_reason(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let exit = k.objects.process(call.target()?)?.exit;
    Ok(ServiceOutcome::code(exit.map_or(0, |e| e.reason)))
}

fn process_exit_kind(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let exit = k.objects.process(call.target()?)?.exit;
    Ok(ServiceOutcome::value(exit_kind(exit)))
}

fn process_exe_path(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let path = k.objects.process(call.target()?)?.exe_path.clone();
    let len = k.write_guest_bytes(call.process, call.arg(0), call.arg(1), path.as_bytes())?;
    Ok(ServiceOutcome::value(len))
}

fn process_command_line(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let cmdline = k.objects.process(call.target()?)?.cmdline.clone();
    let len = k.write_guest_bytes(call.process, call.arg(0), call.arg(1), cmdline.as_bytes())?;
    Ok(ServiceOutcome::value(len))
}

fn thread_resume(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.resume_thread(call.target()?)?;
    Ok(ServiceOutcome::ok())
}

fn thread_suspend(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.suspend_thread(call.target()?)?;
    Ok(ServiceOutcome::ok())
}

fn thread_kill(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let target = call.target()?;
    k.kill_thread(target, call.arg_i32(0))?;
    if target == call.thread {
        return Ok(ServiceOutcome::exited());
    }
    Ok(ServiceOutcome::ok())
}

fn thread_set_priority(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let priority =
        u8::try_from(call.arg(0)).map_err(|_| KernelError::InvalidArgument("thread priority"))?;
    k.set_thread_priority(call.target()?, priority)?;
    Ok(ServiceOutcome::ok())
}

fn thread_priority(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let t = k.objects.thread(call.target()?)?;
    Ok(ServiceOutcome::value(u32::from(t.priority)))
}

fn thread_logon(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(k.logon(call.thread, call.target()?)?.into())
}

fn thread_exit_reason(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let exit = k.objects.thread(call.target()?)?.exit;
    Ok(ServiceOutcome::code(exit.map_or(0, |e| e.reason)))
}

fn thread_exit_kind(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let exit = k.objects.thread(call.target()?)?.exit;
    Ok(ServiceOutcome::value(exit_kind(exit)))
}

fn chunk_base(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    Ok(ServiceOutcome::value(k.mem.chunk(chunk)?.base() as u32))
}

fn chunk_size(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    Ok(ServiceOutcome::value(k.mem.chunk(chunk)?.top() as u32))
}

fn chunk_max_size(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    Ok(ServiceOutcome::value(k.mem.chunk(chunk)?.reserved_size() as u32))
}

fn chunk_adjust(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    k.mem.adjust(chunk, u64::from(call.arg(0)))?;
    Ok(ServiceOutcome::ok())
}

fn chunk_commit(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    k.mem
        .commit(chunk, u64::from(call.arg(0)), u64::from(call.arg(1)))?;
    Ok(ServiceOutcome::ok())
}

fn chunk_decommit(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let chunk = k.chunk_of(call.target()?)?;
    k.mem
        .decommit(chunk, u64::from(call.arg(0)), u64::from(call.arg(1)))?;
    Ok(ServiceOutcome::ok())
}

fn mutex_wait(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(k.mutex_wait(call.thread, call.target()?)?.into())
}

fn mutex_signal(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.mutex_signal(call.thread, call.target()?)?;
    Ok(ServiceOutcome::ok())
}

fn mutex_is_held(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let held = k.mutex_is_held(call.thread, call.target()?)?;
    Ok(ServiceOutcome::value(u32::from(held)))
}

fn semaphore_wait(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(k.semaphore_wait(call.thread, call.target()?)?.into())
}

fn semaphore_signal(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.semaphore_signal(call.target()?, call.arg_i32(0))?;
    Ok(ServiceOutcome::ok())
}

fn semaphore_count(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let count = k.objects.semaphore(call.target()?)?.count;
    Ok(ServiceOutcome::code(count))
}

fn timer_after(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.timer_after(call.thread, call.target()?, call.arg(0), u64::from(call.arg(1)))?;
    Ok(ServiceOutcome::ok())
}

fn timer_cancel(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    k.timer_cancel(call.target()?)?;
    Ok(ServiceOutcome::ok())
}

fn server_receive(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    Ok(k.receive(call.thread, call.target()?, call.arg(0))?.into())
}

fn session_send_receive(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let mut args = [0u32; MESSAGE_ARGS];
    let ptr = call.arg(1);
    if ptr != 0 {
        let space = k.objects.process(call.process)?.space;
        let mut raw = [0u8; MESSAGE_ARGS * 4];
        k.mem.read(space, u64::from(ptr), &mut raw)?;
        for (arg, bytes) in args.iter_mut().zip(raw.chunks_exact(4)) {
            *arg = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
    }
    Ok(k
        .send_receive(call.thread, call.target()?, call.arg_i32(0), args)?
        .into())
}

fn ldd_query_version(k: &mut Kernel, call: &Call) -> Result<ServiceOutcome> {
    let version = k.objects.logical_device(call.target()?)?.packed_version();
    let space = k.objects.process(call.process)?.space;
    k.mem.write(space, u64::from(call.arg(0)), &version)?;
    Ok(ServiceOutcome::ok())
}
