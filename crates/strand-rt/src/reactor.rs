//! I/O readiness and timer reactor.
//!
//! One reactor per scheduler, started lazily on the first wait. A single
//! poller thread multiplexes epoll readiness with a min-heap of deadlines:
//! the epoll timeout is always the distance to the earliest live timer, so
//! timers piggy-back on the poll wait and need no extra ticker.
//!
//! Guarantees:
//! - at most one task per (fd, direction); a second wait returns `Busy`
//! - a wait resumes exactly once: readiness and deadline race through the
//!   task's wait token, and the loser's wake is discarded
//! - `Deadline::Inf` never fires
//! - the result distinguishes readability, writability, error/hangup, and
//!   timeout
//!
//! Timer cancellation is lazy: an entry whose token went stale (the task was
//! woken by readiness, or parked again since) is discarded at pop time.

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use std::collections::BinaryHeap;
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::deadline::Deadline;
use crate::scheduler::Scheduler;
use crate::task::{IoEvents, WaitToken, WakeReason};

/// Sentinel epoll user-data for the reactor's own wake pipe.
const WAKE_DATA: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Which readiness direction a task waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Failure modes of an I/O or timer wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWaitError {
    /// The deadline expired before the fd became ready.
    Timeout,
    /// Another task is already waiting on this (fd, direction).
    Busy,
    /// The wait was abandoned because the runtime is shutting down.
    Aborted,
}

impl fmt::Display for IoWaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoWaitError::Timeout => write!(f, "i/o wait timed out"),
            IoWaitError::Busy => write!(f, "another task already waits on this fd direction"),
            IoWaitError::Aborted => write!(f, "i/o wait aborted by shutdown"),
        }
    }
}

impl std::error::Error for IoWaitError {}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FdEntry {
    read: Option<WaitToken>,
    write: Option<WaitToken>,
}

impl FdEntry {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn flags(&self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLRDHUP;
        if self.read.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

struct TimerEntry {
    deadline: Instant,
    token: WaitToken,
    /// When the timer guards an I/O wait, the registration to clear on fire.
    io: Option<(RawFd, Direction)>,
}

// BinaryHeap is a max-heap; order by reversed deadline so the earliest
// entry is at the top.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

struct ReactorState {
    fds: FxHashMap<RawFd, FdEntry>,
    timers: BinaryHeap<TimerEntry>,
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

/// Shared epoll + timer-heap reactor.
pub struct Reactor {
    epoll: Epoll,
    wake_rd: OwnedFd,
    wake_wr: OwnedFd,
    state: Mutex<ReactorState>,
    stop: AtomicBool,
}

impl Reactor {
    /// Create the reactor and spawn its poller thread.
    pub(crate) fn start(sched: Weak<Scheduler>) -> nix::Result<Arc<Self>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let (wake_rd, wake_wr) = nix::unistd::pipe2(
            nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC,
        )?;

        epoll.add(
            &wake_rd,
            EpollEvent::new(EpollFlags::EPOLLIN, WAKE_DATA),
        )?;

        let reactor = Arc::new(Reactor {
            epoll,
            wake_rd,
            wake_wr,
            state: Mutex::new(ReactorState {
                fds: FxHashMap::default(),
                timers: BinaryHeap::new(),
            }),
            stop: AtomicBool::new(false),
        });

        let r2 = Arc::clone(&reactor);
        std::thread::Builder::new()
            .name("strand-reactor".into())
            .spawn(move || poller_loop(r2, sched))
            .expect("failed to spawn reactor thread");

        Ok(reactor)
    }

    /// Stop the poller thread. Outstanding waits never resume.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wakeup();
    }

    /// Nudge the poller out of `epoll_wait` to pick up new registrations.
    fn wakeup(&self) {
        // A full pipe already guarantees a pending wake.
        let _ = nix::unistd::write(&self.wake_wr, &[1u8]);
    }

    /// Register a readiness wait for `token`.
    ///
    /// Fails with `Busy` when a task is already waiting on this
    /// (fd, direction).
    pub(crate) fn register_io(
        &self,
        fd: RawFd,
        dir: Direction,
        deadline: Deadline,
        token: WaitToken,
    ) -> Result<(), IoWaitError> {
        let mut st = self.state.lock();
        let existed = st.fds.contains_key(&fd);
        let entry = st.fds.entry(fd).or_default();

        let slot = match dir {
            Direction::Read => &mut entry.read,
            Direction::Write => &mut entry.write,
        };
        if slot.is_some() {
            return Err(IoWaitError::Busy);
        }
        *slot = Some(token);

        let mut event = EpollEvent::new(entry.flags(), fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let res = if existed {
            self.epoll.modify(borrowed, &mut event)
        } else {
            self.epoll.add(borrowed, event)
        };
        if let Err(e) = res {
            log::warn!("epoll register fd {} failed: {}", fd, e);
            // Roll the slot back; report as an aborted wait.
            let entry = st.fds.get_mut(&fd).unwrap();
            match dir {
                Direction::Read => entry.read = None,
                Direction::Write => entry.write = None,
            }
            if entry.is_empty() {
                st.fds.remove(&fd);
            }
            return Err(IoWaitError::Aborted);
        }

        if let Deadline::At(at) = deadline {
            st.timers.push(TimerEntry {
                deadline: at,
                token,
                io: Some((fd, dir)),
            });
        }
        drop(st);
        self.wakeup();
        Ok(())
    }

    /// Register a pure timer wake for `token` at `at`.
    pub(crate) fn add_timer(&self, at: Instant, token: WaitToken) {
        let mut st = self.state.lock();
        st.timers.push(TimerEntry {
            deadline: at,
            token,
            io: None,
        });
        drop(st);
        self.wakeup();
    }

    /// Drop the registration for (fd, dir), updating epoll interest.
    /// Caller holds the state lock.
    fn clear_io_locked(&self, st: &mut ReactorState, fd: RawFd, dir: Direction) {
        let Some(entry) = st.fds.get_mut(&fd) else {
            return;
        };
        match dir {
            Direction::Read => entry.read = None,
            Direction::Write => entry.write = None,
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if entry.is_empty() {
            st.fds.remove(&fd);
            if let Err(e) = self.epoll.delete(borrowed) {
                // The fd may already be closed; epoll drops it on close.
                log::trace!("epoll delete fd {}: {}", fd, e);
            }
        } else {
            let mut event = EpollEvent::new(entry.flags(), fd as u64);
            if let Err(e) = self.epoll.modify(borrowed, &mut event) {
                log::trace!("epoll modify fd {}: {}", fd, e);
            }
        }
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Reactor")
            .field("fds", &st.fds.len())
            .field("timers", &st.timers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Poller loop
// ---------------------------------------------------------------------------

fn poller_loop(reactor: Arc<Reactor>, sched: Weak<Scheduler>) {
    let mut events = vec![EpollEvent::empty(); 64];
    log::trace!("reactor up");

    loop {
        if reactor.stop.load(Ordering::SeqCst) {
            break;
        }

        let timeout = {
            let st = reactor.state.lock();
            match st.timers.peek() {
                None => EpollTimeout::NONE,
                Some(top) => {
                    let ms = top
                        .deadline
                        .saturating_duration_since(Instant::now())
                        .as_millis() as u64;
                    // Round up so we never wake a hair early and busy-spin;
                    // cap to re-evaluate long sleeps periodically.
                    EpollTimeout::from((ms + 1).min(u16::MAX as u64 - 1) as u16)
                }
            }
        };

        let n = match reactor.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => {
                log::error!("epoll_wait failed: {}", e);
                break;
            }
        };

        let Some(sched) = sched.upgrade() else {
            break;
        };

        let mut st = reactor.state.lock();

        for ev in &events[..n] {
            if ev.data() == WAKE_DATA {
                let mut buf = [0u8; 64];
                while nix::unistd::read(reactor.wake_rd.as_raw_fd(), &mut buf).is_ok_and(|n| n > 0) {}
                continue;
            }

            let fd = ev.data() as RawFd;
            let flags = ev.events();
            let mut io = IoEvents::default();
            if flags.contains(EpollFlags::EPOLLIN) {
                io = io.union(IoEvents::READABLE);
            }
            if flags.contains(EpollFlags::EPOLLOUT) {
                io = io.union(IoEvents::WRITABLE);
            }
            if flags.contains(EpollFlags::EPOLLERR) {
                io = io.union(IoEvents::ERROR);
            }
            if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLRDHUP) {
                io = io.union(IoEvents::HANGUP);
            }

            let broken = io.contains(IoEvents::ERROR) || io.contains(IoEvents::HANGUP);
            let (wake_read, wake_write) = match st.fds.get(&fd) {
                Some(entry) => (
                    entry.read.is_some() && (io.contains(IoEvents::READABLE) || broken),
                    entry.write.is_some() && (io.contains(IoEvents::WRITABLE) || broken),
                ),
                None => (false, false),
            };

            if wake_read {
                if let Some(token) = st.fds.get_mut(&fd).and_then(|e| e.read.take()) {
                    sched.wake(token, WakeReason::Io(io));
                }
                reactor.clear_io_locked(&mut st, fd, Direction::Read);
            }
            if wake_write {
                if let Some(token) = st.fds.get_mut(&fd).and_then(|e| e.write.take()) {
                    sched.wake(token, WakeReason::Io(io));
                }
                reactor.clear_io_locked(&mut st, fd, Direction::Write);
            }
        }

        // Fire expired timers; stale tokens are tombstones and pop silently.
        let now = Instant::now();
        while st.timers.peek().is_some_and(|t| t.deadline <= now) {
            let entry = st.timers.pop().unwrap();
            if sched.wake(entry.token, WakeReason::Timeout) {
                if let Some((fd, dir)) = entry.io {
                    reactor.clear_io_locked(&mut st, fd, dir);
                }
            }
        }
    }

    log::trace!("reactor down");
}

// ---------------------------------------------------------------------------
// Task-facing waits
// ---------------------------------------------------------------------------

impl Scheduler {
    /// Park the current task until `fd` is ready in `dir` or `deadline`
    /// expires. See the module docs for the guarantees.
    pub fn fdwait(
        self: &Arc<Self>,
        fd: RawFd,
        dir: Direction,
        deadline: Deadline,
    ) -> Result<IoEvents, IoWaitError> {
        if deadline.expired() {
            return Err(IoWaitError::Timeout);
        }
        let reactor = self.reactor();
        let reason = self.park_current(|token| reactor.register_io(fd, dir, deadline, token))?;
        match reason {
            WakeReason::Io(events) => Ok(events),
            WakeReason::Timeout => Err(IoWaitError::Timeout),
            WakeReason::Abort => Err(IoWaitError::Aborted),
            WakeReason::Notified => Ok(IoEvents::default()),
        }
    }

    /// Park the current task until `deadline`. `Deadline::Inf` parks forever.
    pub fn sleep_until(self: &Arc<Self>, deadline: Deadline) {
        let reactor = self.reactor();
        let _ = self.park_current(|token| {
            if let Deadline::At(at) = deadline {
                reactor.add_timer(at, token);
            }
            Ok::<(), std::convert::Infallible>(())
        });
    }

    /// Park the current task for `dur`.
    pub fn sleep(self: &Arc<Self>, dur: std::time::Duration) {
        self.sleep_until(Deadline::after(dur));
    }
}

/// Readiness wait on the process-wide runtime.
pub fn fdwait(fd: RawFd, dir: Direction, deadline: Deadline) -> Result<IoEvents, IoWaitError> {
    crate::scheduler::current_or_panic().fdwait(fd, dir, deadline)
}

/// Readiness wait on anything that exposes a raw fd.
pub fn fdwait_on(
    fd: &impl AsRawFd,
    dir: Direction,
    deadline: Deadline,
) -> Result<IoEvents, IoWaitError> {
    fdwait(fd.as_raw_fd(), dir, deadline)
}

/// Sleep the current task for `dur` on the process-wide runtime.
pub fn sleep(dur: std::time::Duration) {
    crate::scheduler::current_or_panic().sleep(dur);
}

/// Sleep the current task until `deadline` on the process-wide runtime.
pub fn sleep_until(deadline: Deadline) {
    crate::scheduler::current_or_panic().sleep_until(deadline);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn test_sched() -> Arc<Scheduler> {
        let sched = Scheduler::new(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        });
        sched.start();
        sched
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let sched = test_sched();
        let s2 = Arc::clone(&sched);
        let start = Instant::now();
        let handle = sched.spawn(move || {
            s2.sleep(Duration::from_millis(30));
        });
        handle.join();
        assert!(start.elapsed() >= Duration::from_millis(30));
        sched.stop();
    }

    #[test]
    fn test_multiple_sleepers_ordered() {
        let sched = test_sched();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (i, ms) in [(0u32, 60u64), (1, 20), (2, 40)] {
            let s2 = Arc::clone(&sched);
            let order = Arc::clone(&order);
            handles.push(sched.spawn(move || {
                s2.sleep(Duration::from_millis(ms));
                order.lock().push(i);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(*order.lock(), vec![1, 2, 0]);
        sched.stop();
    }

    #[test]
    fn test_fdwait_timeout() {
        let sched = test_sched();
        let s2 = Arc::clone(&sched);
        let timed_out = Arc::new(AtomicBool::new(false));
        let t2 = Arc::clone(&timed_out);

        // A pipe with no writer activity: read-readiness never arrives.
        let (rd, _wr) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
        let raw = rd.as_raw_fd();
        let handle = sched.spawn(move || {
            let _keep = rd;
            let res = s2.fdwait(
                raw,
                Direction::Read,
                Deadline::after(Duration::from_millis(30)),
            );
            if res == Err(IoWaitError::Timeout) {
                t2.store(true, Ordering::SeqCst);
            }
        });
        handle.join();
        assert!(timed_out.load(Ordering::SeqCst));
        sched.stop();
    }

    #[test]
    fn test_fdwait_readable() {
        let sched = test_sched();
        let s2 = Arc::clone(&sched);

        let (rd, wr) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
        let raw = rd.as_raw_fd();
        let got = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        let handle = sched.spawn(move || {
            let _keep = rd;
            let res = s2.fdwait(raw, Direction::Read, Deadline::after(Duration::from_secs(5)));
            *g2.lock() = Some(res);
        });

        std::thread::sleep(Duration::from_millis(20));
        nix::unistd::write(&wr, b"x").unwrap();
        handle.join();

        let res = got.lock().take().unwrap();
        let events = res.unwrap();
        assert!(events.contains(IoEvents::READABLE));
        sched.stop();
    }

    #[test]
    fn test_fdwait_busy_second_waiter() {
        let sched = test_sched();
        let (rd, _wr) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap();
        let raw = rd.as_raw_fd();

        let s2 = Arc::clone(&sched);
        let first = sched.spawn(move || {
            let _ = s2.fdwait(
                raw,
                Direction::Read,
                Deadline::after(Duration::from_millis(200)),
            );
        });

        std::thread::sleep(Duration::from_millis(30));
        let s3 = Arc::clone(&sched);
        let busy = Arc::new(AtomicBool::new(false));
        let b2 = Arc::clone(&busy);
        let second = sched.spawn(move || {
            let res = s3.fdwait(
                raw,
                Direction::Read,
                Deadline::after(Duration::from_millis(50)),
            );
            if res == Err(IoWaitError::Busy) {
                b2.store(true, Ordering::SeqCst);
            }
        });

        second.join();
        first.join();
        drop(rd);
        assert!(busy.load(Ordering::SeqCst));
        sched.stop();
    }

    #[test]
    fn test_expired_deadline_fails_fast() {
        let sched = test_sched();
        let s2 = Arc::clone(&sched);
        let handle = sched.spawn(move || {
            let res = s2.fdwait(
                0,
                Direction::Read,
                Deadline::At(Instant::now() - Duration::from_millis(1)),
            );
            assert_eq!(res, Err(IoWaitError::Timeout));
        });
        handle.join();
        sched.stop();
    }
}
