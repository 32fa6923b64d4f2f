//! Async filesystem watcher over inotify.
//!
//! One non-blocking inotify fd per watcher. A single background task waits
//! for readability, drains the kernel event buffer, and dispatches each
//! event's callback as its own task, looked up in a descriptor → notifier
//! map. Kernel queue overflow invokes a dedicated callback. `unwatch` is
//! idempotent; dropping the watcher closes the fd and clears all notifiers.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_rt::{Deadline, Direction};

// ---------------------------------------------------------------------------
// Event bits
// ---------------------------------------------------------------------------

/// Filesystem event bits, 1:1 with the inotify constants.
pub struct Events;

impl Events {
    pub const ACCESSED: u32 = libc::IN_ACCESS;
    pub const ATTRIBS_CHANGED: u32 = libc::IN_ATTRIB;
    pub const WRITE_CLOSED: u32 = libc::IN_CLOSE_WRITE;
    pub const NON_WRITE_CLOSED: u32 = libc::IN_CLOSE_NOWRITE;
    pub const CREATED: u32 = libc::IN_CREATE;
    pub const DELETED: u32 = libc::IN_DELETE;
    pub const SELF_DELETED: u32 = libc::IN_DELETE_SELF;
    pub const MODIFIED: u32 = libc::IN_MODIFY;
    pub const SELF_MOVED: u32 = libc::IN_MOVE_SELF;
    pub const MOVED_FROM: u32 = libc::IN_MOVED_FROM;
    pub const MOVED_TO: u32 = libc::IN_MOVED_TO;
    pub const OPENED: u32 = libc::IN_OPEN;
    pub const MOVED: u32 = libc::IN_MOVE;
    pub const CLOSED: u32 = libc::IN_CLOSE;

    /// Human-readable name of a single event bit.
    pub fn name(event: u32) -> &'static str {
        match event {
            Self::ACCESSED => "IN_ACCESS",
            Self::ATTRIBS_CHANGED => "IN_ATTRIB",
            Self::WRITE_CLOSED => "IN_CLOSE_WRITE",
            Self::NON_WRITE_CLOSED => "IN_CLOSE_NOWRITE",
            Self::CREATED => "IN_CREATE",
            Self::DELETED => "IN_DELETE",
            Self::SELF_DELETED => "IN_DELETE_SELF",
            Self::MODIFIED => "IN_MODIFY",
            Self::SELF_MOVED => "IN_MOVE_SELF",
            Self::MOVED_FROM => "IN_MOVED_FROM",
            Self::MOVED_TO => "IN_MOVED_TO",
            Self::OPENED => "IN_OPEN",
            Self::MOVED => "IN_MOVE",
            Self::CLOSED => "IN_CLOSE",
            _ => "UNKNOWN",
        }
    }
}

/// Watch behavior modifiers, 1:1 with the inotify flags.
pub struct WatchMode;

impl WatchMode {
    pub const DONT_FOLLOW: u32 = libc::IN_DONT_FOLLOW;
    pub const EXCLUDE_LINKS: u32 = libc::IN_EXCL_UNLINK;
    pub const MASK_ADD: u32 = libc::IN_MASK_ADD;
    pub const ONE_SHOT: u32 = libc::IN_ONESHOT;
    pub const DIR_ONLY: u32 = libc::IN_ONLYDIR;
    pub const MASK_CREATE: u32 = 0x1000_0000;

    /// The default mode applied by `watch`.
    pub const DEFAULT: u32 = Self::EXCLUDE_LINKS | Self::MASK_CREATE;
}

/// One filesystem event delivered to a notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event bits, masked to the observable set.
    pub event: u32,
    /// Correlates rename pairs.
    pub cookie: u32,
    /// Name of the child the event applies to (empty for the watched path
    /// itself).
    pub name: String,
    pub is_dir: bool,
    pub is_unmount: bool,
}

/// Callback invoked for each event on a watch descriptor.
pub type Notifier = dyn Fn(&Event) + Send + Sync;

/// Failure modes of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchError {
    /// The watcher has been closed.
    Closed,
    /// `inotify_add_watch` (or init) failed.
    System(nix::errno::Errno),
}

impl fmt::Display for WatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Closed => write!(f, "watcher is closed"),
            WatchError::System(e) => write!(f, "inotify failure: {}", e),
        }
    }
}

impl std::error::Error for WatchError {}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

struct WatcherInner {
    fd: AtomicI32,
    signals: Mutex<FxHashMap<i32, Arc<Notifier>>>,
    overflow: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    watching: AtomicBool,
}

/// Async inotify watcher.
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// Create a watcher with a fresh non-blocking inotify instance.
    pub fn create() -> Result<Self, WatchError> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            let errno = nix::errno::Errno::last();
            log::error!("inotify_init1 failed: {}", errno);
            return Err(WatchError::System(errno));
        }
        Ok(Watcher {
            inner: Arc::new(WatcherInner {
                fd: AtomicI32::new(fd),
                signals: Mutex::new(FxHashMap::default()),
                overflow: Mutex::new(None),
                watching: AtomicBool::new(false),
            }),
        })
    }

    /// Watch `path` for `events`, invoking `callback` per event.
    ///
    /// Returns the watch descriptor for [`Watcher::unwatch`]. The first
    /// watch starts the background event task.
    pub fn watch(
        &self,
        path: impl AsRef<Path>,
        events: u32,
        mode: u32,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<i32, WatchError> {
        let fd = self.inner.fd.load(Ordering::Acquire);
        if fd < 0 {
            log::error!("watcher not initialized");
            return Err(WatchError::Closed);
        }

        let path = path.as_ref();
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| WatchError::System(nix::errno::Errno::EINVAL))?;
        let wd = unsafe { libc::inotify_add_watch(fd, cpath.as_ptr(), events | mode) };
        if wd < 0 {
            let errno = nix::errno::Errno::last();
            log::error!(
                "watch({}, {:#x}) - inotify_add_watch failed: {}",
                path.display(),
                events,
                errno
            );
            return Err(WatchError::System(errno));
        }

        self.inner.signals.lock().insert(wd, Arc::new(callback));

        if !self.inner.watching.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            strand_rt::spawn(move || wait_for_events(inner));
        }

        Ok(wd)
    }

    /// Install the kernel-queue-overflow callback.
    pub fn on_overflow(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.inner.overflow.lock() = Some(Arc::new(f));
    }

    /// Stop watching `wd`. Idempotent.
    pub fn unwatch(&self, wd: i32) {
        self.inner.unwatch(wd);
    }

    /// Remove all watches and close the inotify fd.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("fd", &self.inner.fd.load(Ordering::Relaxed))
            .field("watches", &self.inner.signals.lock().len())
            .finish()
    }
}

impl WatcherInner {
    fn unwatch(&self, wd: i32) {
        self.signals.lock().remove(&wd);
        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            let res = unsafe { libc::inotify_rm_watch(fd, wd) };
            if res < 0 {
                log::warn!(
                    "unwatch({}) - inotify_rm_watch failed: {}",
                    wd,
                    nix::errno::Errno::last()
                );
            }
        }
    }

    fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let wds: Vec<i32> = self.signals.lock().keys().copied().collect();
            for wd in wds {
                let _ = unsafe { libc::inotify_rm_watch(fd, wd) };
            }
            let _ = nix::unistd::close(fd);
        }
        self.signals.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// Event task
// ---------------------------------------------------------------------------

/// Background task: drain the inotify fd and dispatch events until all
/// watches are gone or the fd closes.
fn wait_for_events(inner: Arc<WatcherInner>) {
    log::trace!("watcher event task starting");
    loop {
        let fd = inner.fd.load(Ordering::Acquire);
        if fd < 0 {
            break;
        }

        let mut buf = [0u8; 4096];
        match nix::unistd::read(fd, &mut buf) {
            Ok(n) if n > 0 => handle_events(&inner, &buf[..n]),
            Ok(_) => break,
            Err(nix::errno::Errno::EAGAIN) => {
                match strand_rt::fdwait(
                    fd,
                    Direction::Read,
                    Deadline::after(Duration::from_secs(2)),
                ) {
                    Ok(_) => continue,
                    Err(strand_rt::IoWaitError::Timeout) => {
                        if inner.signals.lock().is_empty() {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        log::trace!("waiting for file events failed");
                        break;
                    }
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("reading file events failed: {}", e);
                break;
            }
        }

        if inner.signals.lock().is_empty() {
            break;
        }
    }
    inner.watching.store(false, Ordering::Release);
    log::trace!("watcher event task exiting");
}

/// Walk a raw inotify buffer, dispatching one callback task per event.
fn handle_events(inner: &Arc<WatcherInner>, buf: &[u8]) {
    const HEADER: usize = std::mem::size_of::<libc::inotify_event>();
    let mut offset = 0;

    while offset + HEADER <= buf.len() {
        // Safety: the kernel guarantees whole events in the buffer; the
        // header is copied out unaligned.
        let event: libc::inotify_event =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const _) };
        let name_len = event.len as usize;
        let total = HEADER + name_len;
        if offset + total > buf.len() {
            break;
        }

        let mask = event.mask;
        if mask & libc::IN_IGNORED != 0 {
            offset += total;
            continue;
        }

        if mask & libc::IN_Q_OVERFLOW != 0 {
            let overflow = inner.overflow.lock().clone();
            match overflow {
                Some(cb) => {
                    strand_rt::spawn(move || cb());
                }
                None => log::error!("inotify event queue overflowed"),
            }
            offset += total;
            continue;
        }

        let notifier = inner.signals.lock().get(&event.wd).cloned();
        let Some(notifier) = notifier else {
            // No notifier registered; drop the orphaned descriptor.
            inner.unwatch(event.wd);
            offset += total;
            continue;
        };

        let name_bytes = &buf[offset + HEADER..offset + total];
        let name = name_bytes
            .iter()
            .position(|&b| b == 0)
            .map(|end| String::from_utf8_lossy(&name_bytes[..end]).into_owned())
            .unwrap_or_default();

        let fired = Event {
            event: mask & libc::IN_ALL_EVENTS,
            cookie: event.cookie,
            name,
            is_dir: mask & libc::IN_ISDIR != 0,
            is_unmount: mask & libc::IN_UNMOUNT != 0,
        };
        strand_rt::spawn(move || notifier(&fired));

        offset += total;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use strand_rt::sync::Channel;

    #[test]
    fn test_watch_create_event() {
        strand_rt::init(2);
        let dir = tempfile::tempdir().unwrap();
        let watcher = Watcher::create().unwrap();

        let events: Channel<String> = Channel::new(8);
        let tx = events.clone();
        let wd = watcher
            .watch(dir.path(), Events::CREATED, WatchMode::DEFAULT, move |ev| {
                assert!(ev.event & Events::CREATED != 0);
                let _ = tx.send(ev.name.clone());
            })
            .unwrap();
        assert!(wd >= 0);

        std::fs::write(dir.path().join("fresh.txt"), b"x").unwrap();

        let got = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        strand_rt::spawn(move || {
            *g2.lock() = events.receive(Deadline::after_ms(3000)).ok();
        })
        .join();
        assert_eq!(got.lock().as_deref(), Some("fresh.txt"));

        watcher.unwatch(wd);
        // Idempotent.
        watcher.unwatch(wd);
    }

    #[test]
    fn test_watch_modify_and_delete() {
        strand_rt::init(2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracked.txt");
        std::fs::write(&path, b"start").unwrap();

        let watcher = Watcher::create().unwrap();
        let events: Channel<u32> = Channel::new(8);
        let tx = events.clone();
        watcher
            .watch(
                dir.path(),
                Events::MODIFIED | Events::DELETED,
                WatchMode::DEFAULT,
                move |ev| {
                    let _ = tx.send(ev.event);
                },
            )
            .unwrap();

        std::fs::write(&path, b"changed").unwrap();
        std::fs::remove_file(&path).unwrap();

        let got = Arc::new(Mutex::new(Vec::new()));
        let g2 = Arc::clone(&got);
        strand_rt::spawn(move || {
            let batch = events.drain(2, Deadline::after_ms(3000));
            *g2.lock() = batch;
        })
        .join();

        let masks = got.lock().clone();
        assert_eq!(masks.len(), 2);
        assert!(masks.iter().any(|m| m & Events::MODIFIED != 0));
        assert!(masks.iter().any(|m| m & Events::DELETED != 0));
    }

    #[test]
    fn test_close_invalidates() {
        strand_rt::init(2);
        let watcher = Watcher::create().unwrap();
        watcher.close();
        let err = watcher.watch("/tmp", Events::CREATED, WatchMode::DEFAULT, |_| {});
        assert_eq!(err, Err(WatchError::Closed));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Events::name(Events::CREATED), "IN_CREATE");
        assert_eq!(Events::name(Events::MODIFIED), "IN_MODIFY");
        assert_eq!(Events::name(0xdead_0000), "UNKNOWN");
    }
}
