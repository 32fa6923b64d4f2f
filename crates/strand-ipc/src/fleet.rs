//! Worker fleet lifecycle and message plumbing.
//!
//! The supervisor maps the shared table, opens one pipe pair per process,
//! and forks `W` workers. Each process then:
//!
//! - closes every pipe end it does not own (it keeps its own read end and
//!   every sibling's write end)
//! - installs signal handlers that funnel through a self-pipe
//! - starts a single-threaded strand runtime and a receive task draining its
//!   pipe
//! - runs the user work loop as a task until it asks to quit or a signal
//!   arrives
//!
//! Message sends serialize on the destination's ticket lock; uninterested
//! destinations are skipped by consulting the shared interest bitmaps
//! without writing a byte. `get` and `gather` are request/response built on
//! top: the requester allocates an opaque handle, the responder echoes it in
//! a `MSG_GET_RESPONSE` frame, and the dispatcher drops responses that
//! arrive after the carried deadline.
//!
//! Fork safety: [`spawn`] must run before the strand runtime starts; worker
//! threads do not survive a fork. Each process initializes its own runtime
//! right after the fork.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::sys::signal::{kill, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use strand_rt::sync::Channel;
use strand_rt::{Deadline, Direction};

use crate::frame::{FrameHeader, FRAME_HEADER_LEN};
use crate::shm::SharedTable;
use crate::{IpcError, MSG_GET_RESPONSE, SHM_GATHER_LOCK};

/// Handler for a plain message: `(src_worker, body)`.
pub type MessageHandler = Arc<dyn Fn(u8, Vec<u8>) + Send + Sync>;

/// Handler for a get request: `(token, src_worker)`. Reply via
/// [`send_get_response`].
pub type GetHandler = Arc<dyn Fn(GetToken, u8) + Send + Sync>;

/// Requests the system worker count (one per CPU core).
pub const NWORKERS_SYSTEM: u8 = 0xFF;

/// Wire sentinel for an infinite get deadline.
const WIRE_DEADLINE_INF: i64 = i64::MAX;

/// Get payload prefix: handle (u64), deadline (i64), size (u64), all LE.
const GET_PAYLOAD_LEN: usize = 24;

/// Grace granted to responses racing the requester's deadline.
const GET_RESPONSE_GRACE_MS: i64 = 50;

// ---------------------------------------------------------------------------
// Process-local fleet state
// ---------------------------------------------------------------------------

struct Fleet {
    table: SharedTable,
    handlers: Mutex<Vec<Option<MessageHandler>>>,
    cleaners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    inflight: Mutex<FxHashMap<u64, Channel<Vec<u8>>>>,
    get_seq: AtomicU64,
}

static FLEET: OnceLock<Fleet> = OnceLock::new();

/// This process's worker id; 0 until assigned (the supervisor is also 0).
static SPID: AtomicU8 = AtomicU8::new(0);

/// Last signal delivered to this process, 0 when none.
static SIG_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Write end of the supervisor's signal self-pipe.
static SIG_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

fn fleet() -> Result<&'static Fleet, IpcError> {
    FLEET.get().ok_or(IpcError::NotInitialized)
}

/// This process's worker id (0 = supervisor).
pub fn spid() -> u8 {
    SPID.load(Ordering::Relaxed)
}

/// Number of worker processes in the fleet.
pub fn n_workers() -> u8 {
    FLEET.get().map(|f| f.table.n_workers()).unwrap_or(0)
}

/// Number of workers currently running.
pub fn n_active() -> u32 {
    FLEET.get().map(|f| f.table.n_active()).unwrap_or(0)
}

/// Last signal observed by this process, 0 when none.
pub fn signal_received() -> i32 {
    SIG_RECEIVED.load(Ordering::Relaxed)
}

extern "C" fn on_signal(sig: libc::c_int) {
    SIG_RECEIVED.store(sig, Ordering::Relaxed);
    let fd = SIG_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // Async-signal-safe: a raw write on the self-pipe.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Create the shared table and pipes for `n` workers (plus supervisor).
///
/// `NWORKERS_SYSTEM` selects one worker per CPU core. Must run once per
/// process group, in the future supervisor, before [`spawn`].
pub fn init(n: u8) -> Result<(), IpcError> {
    if FLEET.get().is_some() {
        return Err(IpcError::AlreadyInitialized);
    }

    let ncpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let n = if n == NWORKERS_SYSTEM {
        ncpus.min(usize::from(u8::MAX) - 1) as u8
    } else {
        n
    };
    if usize::from(n) > ncpus {
        log::warn!("number of workers ({}) exceeds number of CPUs ({})", n, ncpus);
    }

    let table = SharedTable::create(n)?;

    let mut cpu: u8 = 0;
    for w in 0..=n {
        let (rd, wr) = nix::unistd::pipe2(
            nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC,
        )
        .map_err(IpcError::System)?;
        table.set_worker_pipe(w, rd.into_raw_fd(), wr.into_raw_fd());
        // Workers spread over cores round-robin; the supervisor floats.
        if w > 0 {
            table.worker(w).set_cpu(cpu);
            cpu = ((usize::from(cpu) + 1) % ncpus) as u8;
        }
    }

    let fleet = Fleet {
        table,
        handlers: Mutex::new(vec![None; 256]),
        cleaners: Mutex::new(Vec::new()),
        inflight: Mutex::new(FxHashMap::default()),
        get_seq: AtomicU64::new(1),
    };
    if FLEET.set(fleet).is_err() {
        return Err(IpcError::AlreadyInitialized);
    }

    register_get_response_dispatcher();
    Ok(())
}

// ---------------------------------------------------------------------------
// Fork and per-process bring-up
// ---------------------------------------------------------------------------

/// Fork the workers and run the fleet to completion.
///
/// Each worker runs `post_spawn(spid)` once, then loops `work()` until it
/// returns non-zero or a signal arrives; the supervisor runs
/// `parent_post_spawn(0)` and then supervises until every worker exits.
/// Worker processes never return: they `exit` with the work loop's code.
///
/// Must be called before the strand runtime starts in this process; every
/// process initializes its own single-threaded runtime after the fork.
pub fn spawn(
    work: impl FnMut() -> i32 + Send + 'static,
    post_spawn: Option<Box<dyn FnOnce(u8) -> i32 + Send>>,
    parent_post_spawn: Option<Box<dyn FnOnce(u8) -> i32 + Send>>,
) -> Result<(), IpcError> {
    let fleet = fleet()?;
    if strand_rt::current().is_some() {
        // Worker threads do not survive fork; refuse rather than deadlock.
        return Err(IpcError::RuntimeActive);
    }

    let n = fleet.table.n_workers();
    if n == 0 {
        // Degenerate fleet: the supervisor runs the work loop itself.
        return solo_main(work, post_spawn);
    }

    // Each forked child takes its own copy-on-write instance; the options
    // stay populated in the parent.
    let mut work_slot = Some(work);
    let mut ps_slot = Some(post_spawn);
    for w in 1..=n {
        // Safety: the child re-initializes its runtime and only uses
        // fork-safe state (shared table, raw fds) before doing so.
        match unsafe { nix::unistd::fork() }.map_err(IpcError::System)? {
            nix::unistd::ForkResult::Child => {
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP as libc::c_ulong);
                }
                let work = work_slot.take().expect("work closure present in child");
                let ps = ps_slot.take().expect("post-spawn slot present in child");
                worker_main(w, work, ps);
                // worker_main never returns
            }
            nix::unistd::ForkResult::Parent { .. } => {}
        }
    }

    supervisor_main(parent_post_spawn)
}

/// Zero-worker mode: the calling process is both supervisor and worker.
fn solo_main(
    mut work: impl FnMut() -> i32 + Send + 'static,
    post_spawn: Option<Box<dyn FnOnce(u8) -> i32 + Send>>,
) -> Result<(), IpcError> {
    init_process(0);
    log::info!("worker/0 started (solo)");

    let sched = strand_rt::init(1);
    sched.spawn(receive_loop);

    let handle = sched.spawn(move || {
        let mut code = 0;
        if let Some(ps) = post_spawn {
            code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ps(0)))
                .unwrap_or(1);
        }
        while code == 0 && signal_received() == 0 {
            code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut work))
                .unwrap_or(1);
        }
    });
    handle.join();

    run_cleaners();
    if let Ok(fleet) = fleet() {
        fleet.table.worker(0).set_active(false);
    }
    log::info!("worker/0 exit (solo)");
    Ok(())
}

/// Per-process bring-up common to workers and the supervisor.
fn init_process(w: u8) {
    let fleet = FLEET.get().expect("fleet initialized before fork");
    SPID.store(w, Ordering::Relaxed);

    let name = if w == 0 {
        "strand-sup\0".to_string()
    } else {
        format!("worker/{}\0", w)
    };
    unsafe {
        libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong);
    }

    if w != 0 {
        let cpu = fleet.table.worker(w).cpu();
        let mut set = nix::sched::CpuSet::new();
        if set.set(usize::from(cpu)).is_ok() {
            if let Err(e) = nix::sched::sched_setaffinity(Pid::from_raw(0), &set) {
                log::debug!("worker/{} set affinity to cpu {} failed: {}", w, cpu, e);
            } else {
                log::debug!("worker/{} scheduled on cpu {}", w, cpu);
            }
        }
    } else {
        // Supervisor signal notification self-pipe.
        match nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC) {
            Ok((rd, wr)) => {
                SIG_PIPE_RD.store(rd.into_raw_fd(), Ordering::Relaxed);
                SIG_PIPE_WR.store(wr.into_raw_fd(), Ordering::Relaxed);
            }
            Err(e) => log::error!("opening signal notification pipe failed: {}", e),
        }
    }

    // Keep only this process's pipe ends: its own read end, peers' write
    // ends.
    let n = fleet.table.n_workers();
    for v in 0..=n {
        let slot = fleet.table.worker(v);
        if v == w {
            let _ = nix::unistd::close(slot.write_fd());
        } else {
            let _ = nix::unistd::close(slot.read_fd());
        }
    }

    unsafe {
        let handler = SigHandler::Handler(on_signal);
        let _ = nix::sys::signal::signal(Signal::SIGHUP, handler);
        let _ = nix::sys::signal::signal(Signal::SIGQUIT, handler);
        let _ = nix::sys::signal::signal(Signal::SIGTERM, handler);
        let _ = nix::sys::signal::signal(Signal::SIGINT, handler);
        let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        if w == 0 {
            let _ = nix::sys::signal::signal(Signal::SIGCHLD, handler);
        }
    }

    let slot = fleet.table.worker(w);
    slot.set_pid(nix::unistd::getpid().as_raw());
    slot.set_active(true);
    if w != 0 {
        fleet.table.worker_started();
    }
}

/// Read end of the supervisor's signal self-pipe.
static SIG_PIPE_RD: AtomicI32 = AtomicI32::new(-1);

/// Worker process body; never returns.
fn worker_main(
    w: u8,
    mut work: impl FnMut() -> i32 + Send + 'static,
    post_spawn: Option<Box<dyn FnOnce(u8) -> i32 + Send>>,
) -> ! {
    init_process(w);
    log::info!("worker/{} started", w);

    let sched = strand_rt::init(1);
    sched.spawn(receive_loop);

    let quit = Arc::new(AtomicI32::new(0));
    let q2 = Arc::clone(&quit);
    let handle = sched.spawn(move || {
        let mut code = 0;
        if let Some(ps) = post_spawn {
            code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ps(spid()))) {
                Ok(c) => c,
                Err(_) => {
                    log::error!("unhandled panic in post spawn delegate");
                    1
                }
            };
        }
        while code == 0 && signal_received() == 0 {
            code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(&mut work)) {
                Ok(c) => c,
                Err(_) => {
                    if signal_received() == 0 {
                        log::error!("unhandled panic in work loop");
                    }
                    1
                }
            };
        }
        q2.store(code, Ordering::SeqCst);
    });
    handle.join();

    run_cleaners();
    let fleet = FLEET.get().expect("fleet initialized");
    fleet.table.worker(w).set_active(false);
    fleet.table.worker_stopped();
    log::info!("worker/{} exit", w);

    std::process::exit(quit.load(Ordering::SeqCst));
}

/// Supervisor body: run the post-spawn delegate, then reap and forward
/// signals until every worker has exited.
fn supervisor_main(
    parent_post_spawn: Option<Box<dyn FnOnce(u8) -> i32 + Send>>,
) -> Result<(), IpcError> {
    init_process(0);
    let fleet = fleet()?;
    log::info!("supervisor started (pid {})", nix::unistd::getpid());

    let sched = strand_rt::init(1);
    sched.spawn(receive_loop);

    if let Some(pps) = parent_post_spawn {
        let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pps(0))) {
            Ok(c) => c,
            Err(_) => {
                log::error!("unhandled panic in parent post spawn delegate");
                1
            }
        };
        if code != 0 {
            SIG_RECEIVED.store(libc::SIGTERM, Ordering::Relaxed);
        }
    }

    let handle = sched.spawn(supervisor_loop);
    handle.join();

    run_cleaners();
    fleet.table.worker(0).set_active(false);
    let rd = SIG_PIPE_RD.swap(-1, Ordering::Relaxed);
    let wr = SIG_PIPE_WR.swap(-1, Ordering::Relaxed);
    if rd >= 0 {
        let _ = nix::unistd::close(rd);
    }
    if wr >= 0 {
        let _ = nix::unistd::close(wr);
    }
    log::info!("supervisor exiting ({})", signal_received());
    Ok(())
}

fn supervisor_loop() {
    let fleet = FLEET.get().expect("fleet initialized");
    let n = fleet.table.n_workers();
    let mut done: u32 = 0;

    loop {
        // Collect exits regardless of whether the SIGCHLD flag survived a
        // racing signal.
        while reap_one(fleet, false) {
            done += 1;
        }

        let sig = SIG_RECEIVED.swap(0, Ordering::Relaxed);
        if sig != 0 && sig != libc::SIGCHLD {
            log::debug!("forwarding signal {} to workers", sig);
            for w in 1..=n {
                let slot = fleet.table.worker(w);
                // A zero pid means the worker never finished bring-up; a
                // kill(0) would signal the whole process group.
                if slot.is_active() && slot.pid() > 0 {
                    if let Err(e) = kill(Pid::from_raw(slot.pid()), Signal::SIGTERM) {
                        log::debug!("kill worker/{} failed: {}", w, e);
                    }
                }
            }
            while done < u32::from(n) {
                if !reap_one(fleet, true) {
                    break;
                }
                done += 1;
            }
            break;
        }

        if done >= u32::from(n) {
            log::debug!("all workers exited ({}/{})", done, n);
            break;
        }

        wait_for_signal();
    }
}

/// Block on the signal self-pipe, with a periodic re-check.
fn wait_for_signal() {
    let fd = SIG_PIPE_RD.load(Ordering::Relaxed);
    if fd < 0 {
        std::thread::sleep(Duration::from_millis(50));
        return;
    }
    let _ = strand_rt::fdwait(fd, Direction::Read, Deadline::after(Duration::from_millis(500)));
    let mut buf = [0u8; 16];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }
}

/// Reap one exited child; marks its slot inactive. Returns whether a child
/// was collected.
fn reap_one(fleet: &Fleet, block: bool) -> bool {
    let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };
    match waitpid(None, flags) {
        Ok(WaitStatus::Exited(pid, status)) => {
            mark_exited(fleet, pid.as_raw());
            log::debug!("worker pid {} exited, status {}", pid, status);
            true
        }
        Ok(WaitStatus::Signaled(pid, sig, _)) => {
            mark_exited(fleet, pid.as_raw());
            log::debug!("worker pid {} killed by {:?}", pid, sig);
            true
        }
        Ok(_) => false,
        Err(e) => {
            log::trace!("waitpid failed: {}", e);
            false
        }
    }
}

fn mark_exited(fleet: &Fleet, pid: i32) {
    let n = fleet.table.n_workers();
    for w in 1..=n {
        let slot = fleet.table.worker(w);
        if slot.pid() == pid {
            slot.set_active(false);
            break;
        }
    }
}

fn run_cleaners() {
    if let Some(fleet) = FLEET.get() {
        let cleaners: Vec<_> = fleet.cleaners.lock().drain(..).collect();
        for cleaner in cleaners {
            cleaner();
        }
    }
}

// ---------------------------------------------------------------------------
// Handler registry
// ---------------------------------------------------------------------------

/// Register the handler for message `id` and advertise interest.
///
/// Registered before `spawn`, the handler (and interest bits) are inherited
/// by every worker; registered inside a worker, only that worker's bit is
/// set.
pub fn register_handler(id: u8, handler: impl Fn(u8, Vec<u8>) + Send + Sync + 'static) {
    let Ok(fleet) = fleet() else {
        log::error!("registering a handler before ipc::init");
        return;
    };
    fleet.handlers.lock()[usize::from(id)] = Some(Arc::new(handler));
    set_interest_bits(fleet, id, true);
}

/// Remove the handler for message `id` and withdraw interest.
pub fn unregister_handler(id: u8) {
    let Ok(fleet) = fleet() else {
        return;
    };
    fleet.handlers.lock()[usize::from(id)] = None;
    set_interest_bits(fleet, id, false);
}

fn set_interest_bits(fleet: &Fleet, id: u8, enabled: bool) {
    let n = fleet.table.n_workers();
    if spid() == 0 {
        for w in 1..=n {
            fleet.table.worker(w).set_interest(id, enabled);
        }
    } else {
        fleet.table.worker(spid()).set_interest(id, enabled);
    }
}

/// Register a cleanup handler run when this process's fleet role ends.
pub fn register_cleaner(f: impl FnOnce() + Send + 'static) {
    if let Ok(fleet) = fleet() {
        fleet.cleaners.lock().insert(0, Box::new(f));
    }
}

// ---------------------------------------------------------------------------
// Shared locks
// ---------------------------------------------------------------------------

/// Acquire the named shared spin lock, yielding cooperatively.
pub fn spin_lock(idx: u8, deadline: Deadline) -> bool {
    match fleet() {
        Ok(fleet) => fleet.table.shared_lock(idx).acquire(deadline),
        Err(_) => false,
    }
}

/// Release the named shared spin lock.
pub fn spin_unlock(idx: u8) {
    if let Ok(fleet) = fleet() {
        fleet.table.shared_lock(idx).release();
    }
}

// ---------------------------------------------------------------------------
// Send / broadcast
// ---------------------------------------------------------------------------

/// Send `data` as message `id` to worker `dst`.
///
/// Validates the destination (not self, in range, interested) before taking
/// its ticket lock; the header and body stream in `PIPE_BUF`-sized chunks.
/// Returns bytes of body sent.
pub fn send(dst: u8, id: u8, data: &[u8]) -> Result<usize, IpcError> {
    let fleet = fleet()?;
    let me = spid();

    if dst == me || dst > fleet.table.n_workers() {
        log::warn!("{} is an invalid send destination", dst);
        return Err(IpcError::InvalidDestination);
    }
    let slot = fleet.table.worker(dst);
    if !slot.is_active() || !slot.has_interest(id) {
        log::trace!("worker {} does not handle message {:#04x}", dst, id);
        return Err(IpcError::NotSupported);
    }

    let header = FrameHeader::new(id, me, data.len() as u64);
    let guard = slot
        .lock
        .guard(Deadline::Inf)
        .ok_or(IpcError::Timeout)?;

    let fd = slot.write_fd();
    write_all(fd, &header.encode())?;
    for chunk in data.chunks(libc::PIPE_BUF) {
        write_all(fd, chunk)?;
    }
    drop(guard);

    Ok(data.len())
}

/// Send message `id` to every interested worker except the sender.
///
/// The buffer is copied once into a shared blob; per-destination sends run
/// as tasks. Returns the number of destinations.
pub fn broadcast(id: u8, data: &[u8]) -> u8 {
    let Ok(fleet) = fleet() else {
        return 0;
    };
    let blob: Arc<Vec<u8>> = Arc::new(data.to_vec());
    let me = spid();
    let n = fleet.table.n_workers();
    let mut count = 0u8;

    for w in 1..=n {
        if w == me {
            continue;
        }
        let slot = fleet.table.worker(w);
        if !slot.is_active() || !slot.has_interest(id) {
            continue;
        }
        count += 1;
        let blob = Arc::clone(&blob);
        match strand_rt::current() {
            Some(sched) => {
                sched.spawn(move || {
                    if let Err(e) = send(w, id, &blob) {
                        log::warn!("broadcast of {:#04x} to {} failed: {}", id, w, e);
                    }
                });
            }
            None => {
                if let Err(e) = send(w, id, &blob) {
                    log::warn!("broadcast of {:#04x} to {} failed: {}", id, w, e);
                }
            }
        }
    }
    count
}

fn write_all(fd: RawFd, mut buf: &[u8]) -> Result<(), IpcError> {
    while !buf.is_empty() {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match nix::unistd::write(borrowed, buf) {
            Ok(0) => return Err(IpcError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {
                wait_io(fd, Direction::Write, Deadline::Inf)?;
            }
            Err(nix::errno::Errno::EPIPE) | Err(nix::errno::Errno::ECONNRESET) => {
                return Err(IpcError::Closed);
            }
            Err(e) => return Err(IpcError::System(e)),
        }
    }
    Ok(())
}

/// Readiness wait that works from tasks and plain threads alike.
fn wait_io(fd: RawFd, dir: Direction, deadline: Deadline) -> Result<(), IpcError> {
    if strand_rt::stack::in_task_context() {
        match strand_rt::fdwait(fd, dir, deadline) {
            Ok(_) => Ok(()),
            Err(strand_rt::IoWaitError::Timeout) => Err(IpcError::Timeout),
            Err(_) => Err(IpcError::Closed),
        }
    } else {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        let flags = match dir {
            Direction::Read => PollFlags::POLLIN,
            Direction::Write => PollFlags::POLLOUT,
        };
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let timeout = match deadline.remaining() {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::from(d.as_millis().min(u128::from(u16::MAX)) as u16),
        };
        let mut fds = [PollFd::new(borrowed, flags)];
        match poll(&mut fds, timeout) {
            Ok(0) => Err(IpcError::Timeout),
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EINTR) => Ok(()),
            Err(e) => Err(IpcError::System(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

/// Task body draining this process's pipe until its slot goes inactive.
fn receive_loop() {
    let Ok(fleet) = fleet() else {
        return;
    };
    let me = spid();
    log::trace!("ipc receive loop starting on worker/{}", me);

    while fleet.table.worker(me).is_active() {
        match receive_message(fleet, me, Deadline::Inf) {
            Ok(()) => {}
            Err(IpcError::Timeout) => {}
            Err(e) => {
                log::warn!("receiving message failed, aborting: {}", e);
                break;
            }
        }
    }
    log::trace!("ipc receive loop exiting on worker/{}", me);
}

/// Receive and dispatch one message from this worker's pipe.
fn receive_message(fleet: &Fleet, me: u8, deadline: Deadline) -> Result<(), IpcError> {
    let fd = fleet.table.worker(me).read_fd();

    let mut hdr_buf = [0u8; FRAME_HEADER_LEN];
    read_exact(fd, &mut hdr_buf, deadline)?;
    let header = FrameHeader::decode(&hdr_buf);
    log::trace!(
        "received header [{:#04x}|{:#04x}|{}]",
        header.id,
        header.src,
        header.len
    );

    let handler = fleet.handlers.lock()[usize::from(header.id)].clone();

    let len = header.len as usize;
    let mut body = vec![0u8; len];
    if len > 0 {
        read_exact(fd, &mut body, deadline)?;
    }

    let Some(handler) = handler else {
        // Unhandled id: body already drained, discard.
        log::trace!("discarding unsupported message {:#04x}", header.id);
        return Ok(());
    };

    let src = header.src;
    match strand_rt::current() {
        Some(sched) => {
            // Handler tasks run under the coroutine's top-level catch.
            sched.spawn(move || handler(src, body));
        }
        None => handler(src, body),
    }
    Ok(())
}

fn read_exact(fd: RawFd, buf: &mut [u8], deadline: Deadline) -> Result<(), IpcError> {
    let mut filled = 0;
    while filled < buf.len() {
        let want = (buf.len() - filled).min(libc::PIPE_BUF);
        match nix::unistd::read(fd, &mut buf[filled..filled + want]) {
            Ok(0) => return Err(IpcError::Closed),
            Ok(n) => filled += n,
            Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {
                wait_io(fd, Direction::Read, deadline)?;
            }
            Err(e) => return Err(IpcError::System(e)),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Get / gather
// ---------------------------------------------------------------------------

/// Opaque request token echoed back by a get responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetToken {
    handle: u64,
    deadline_ms: i64,
}

fn encode_get_payload(handle: u64, deadline_ms: i64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(GET_PAYLOAD_LEN + data.len());
    buf.extend_from_slice(&handle.to_le_bytes());
    buf.extend_from_slice(&deadline_ms.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

fn decode_get_payload(data: &[u8]) -> Option<(GetToken, &[u8])> {
    if data.len() < GET_PAYLOAD_LEN {
        return None;
    }
    let handle = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let deadline_ms = i64::from_le_bytes(data[8..16].try_into().ok()?);
    Some((
        GetToken {
            handle,
            deadline_ms,
        },
        &data[GET_PAYLOAD_LEN..],
    ))
}

/// Monotonic milliseconds, shared across the process group.
fn now_ms() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1000 + ts.tv_nsec() / 1_000_000,
        Err(_) => 0,
    }
}

fn wire_deadline(deadline: Deadline) -> i64 {
    match deadline.remaining() {
        None => WIRE_DEADLINE_INF,
        Some(d) => now_ms() + d.as_millis() as i64,
    }
}

/// Request/response to one worker.
///
/// Sends message `id` to `dst` carrying a fresh response handle and the
/// absolute deadline; suspends until the response arrives or the deadline
/// expires. Late responses are dropped by the dispatcher. Task context only.
pub fn get(id: u8, dst: u8, deadline: Deadline) -> Result<Vec<u8>, IpcError> {
    let fleet = fleet()?;
    if dst == 0 || dst == spid() {
        log::warn!("get to parent or current worker ({}) is not supported", dst);
        return Err(IpcError::InvalidDestination);
    }

    let handle = (u64::from(spid()) << 56) | fleet.get_seq.fetch_add(1, Ordering::Relaxed);
    let chan: Channel<Vec<u8>> = Channel::new(16);
    fleet.inflight.lock().insert(handle, chan.clone());

    let payload = encode_get_payload(handle, wire_deadline(deadline), &[]);
    let sent = send(dst, id, &payload);
    let result = match sent {
        Ok(_) => chan
            .receive(deadline)
            .map_err(|_| IpcError::Timeout),
        Err(e) => Err(e),
    };
    fleet.inflight.lock().remove(&handle);
    result
}

/// Broadcast a request and collect one response per active sibling.
///
/// Serialized fleet-wide on `SHM_GATHER_LOCK`; waits for `n_active - 1`
/// responses or the deadline and returns whatever arrived in time.
pub fn gather(id: u8, deadline: Deadline) -> Vec<Vec<u8>> {
    let Ok(fleet) = fleet() else {
        return Vec::new();
    };
    if fleet.table.n_workers() == 0 {
        log::warn!("gather {:#04x} not supported without workers", id);
        return Vec::new();
    }
    if !spin_lock(SHM_GATHER_LOCK, deadline) {
        log::warn!("acquiring the gather lock timed out");
        return Vec::new();
    }

    let handle = (u64::from(spid()) << 56) | fleet.get_seq.fetch_add(1, Ordering::Relaxed);
    let chan: Channel<Vec<u8>> = Channel::new(16);
    fleet.inflight.lock().insert(handle, chan.clone());

    let payload = encode_get_payload(handle, wire_deadline(deadline), &[]);
    let sent = broadcast(id, &payload);
    spin_unlock(SHM_GATHER_LOCK);

    let expected = (fleet.table.n_active().saturating_sub(1) as usize).min(usize::from(sent));
    log::trace!("gather {:#04x}: waiting for {} responses", id, expected);
    let results = chan.drain(expected, deadline);
    if results.len() < expected {
        log::warn!(
            "gather {:#04x}: {}/{} responses before deadline",
            id,
            results.len(),
            expected
        );
    }
    fleet.inflight.lock().remove(&handle);
    results
}

/// Register the handler invoked when a get request with message `id`
/// arrives. The handler replies via [`send_get_response`].
pub fn register_get_handler(id: u8, handler: impl Fn(GetToken, u8) + Send + Sync + 'static) {
    register_handler(id, move |src, data| match decode_get_payload(&data) {
        Some((token, _)) => handler(token, src),
        None => log::warn!("malformed get request for message {:#04x}", id),
    });
}

/// Reply to a get request: echoes the token and streams `data` back to the
/// requester as a `MSG_GET_RESPONSE` frame.
pub fn send_get_response(token: GetToken, to: u8, data: &[u8]) -> Result<usize, IpcError> {
    let payload = encode_get_payload(token.handle, token.deadline_ms, data);
    send(to, MSG_GET_RESPONSE, &payload)
}

/// Install the dispatcher matching responses to in-flight requests.
fn register_get_response_dispatcher() {
    register_handler(MSG_GET_RESPONSE, |src, data| {
        let Some((token, body)) = decode_get_payload(&data) else {
            log::warn!("malformed get response from {}", src);
            return;
        };

        // Allow a small grace so responses racing the deadline still land.
        let horizon = now_ms() + GET_RESPONSE_GRACE_MS;
        if token.deadline_ms != WIRE_DEADLINE_INF && token.deadline_ms < horizon {
            log::warn!(
                "dropping late get response from {} (deadline {} now {})",
                src,
                token.deadline_ms,
                horizon
            );
            return;
        }

        let chan = FLEET
            .get()
            .and_then(|f| f.inflight.lock().get(&token.handle).cloned());
        match chan {
            Some(chan) => {
                let _ = chan.send(body.to_vec());
            }
            None => log::trace!("get response from {} without a waiting request", src),
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_payload_roundtrip() {
        let payload = encode_get_payload(0x0102_0304_0506_0708, 123_456, b"hello");
        assert_eq!(payload.len(), GET_PAYLOAD_LEN + 5);
        let (token, body) = decode_get_payload(&payload).unwrap();
        assert_eq!(token.handle, 0x0102_0304_0506_0708);
        assert_eq!(token.deadline_ms, 123_456);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_get_payload_truncated() {
        assert!(decode_get_payload(&[0u8; 10]).is_none());
        assert!(decode_get_payload(&[]).is_none());
        // Exactly the prefix, empty body.
        let payload = encode_get_payload(1, WIRE_DEADLINE_INF, &[]);
        let (token, body) = decode_get_payload(&payload).unwrap();
        assert_eq!(token.deadline_ms, WIRE_DEADLINE_INF);
        assert!(body.is_empty());
    }

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_wire_deadline_inf() {
        assert_eq!(wire_deadline(Deadline::Inf), WIRE_DEADLINE_INF);
        let finite = wire_deadline(Deadline::after(Duration::from_millis(500)));
        assert!(finite >= now_ms());
        assert!(finite < WIRE_DEADLINE_INF);
    }
}
