//! Conditional: a FIFO of waiters notified explicitly, used to ration
//! access to scarce resources (connection slots, worker capacity).
//!
//! Each waiter brings its own [`SyncPoint`], a single-value channel the
//! conditional holds weakly: a waiter that timed out and dropped its sync
//! simply cannot be notified, with no bookkeeping on the notifier side.
//! Destruction notifies every waiter with [`SyncResult::Abort`].

use parking_lot::Mutex;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::deadline::Deadline;
use crate::sync::channel::Channel;

/// Outcome delivered to a conditional waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// The conditional was destroyed or the wait was cancelled.
    Abort,
    /// The waiter was notified and may proceed.
    Activated,
}

/// Error raised on misuse of a [`SyncPoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleWaitError;

impl fmt::Display for DoubleWaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot wait twice on the same sync point concurrently")
    }
}

impl std::error::Error for DoubleWaitError {}

/// A waiter's rendezvous object for use with [`Conditional::wait`].
///
/// Reusable across sequential waits; waiting twice concurrently is a
/// programmer error.
pub struct SyncPoint {
    chan: Arc<Channel<SyncResult>>,
    active: std::sync::atomic::AtomicBool,
}

impl SyncPoint {
    pub fn new() -> Self {
        SyncPoint {
            chan: Arc::new(Channel::new(1)),
            active: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn weak(&self) -> Weak<Channel<SyncResult>> {
        Arc::downgrade(&self.chan)
    }
}

impl Default for SyncPoint {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("active", &self.active.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

/// FIFO condition primitive.
pub struct Conditional {
    waiting: Mutex<VecDeque<Weak<Channel<SyncResult>>>>,
    on_waiter: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl Conditional {
    pub fn new() -> Self {
        Conditional {
            waiting: Mutex::new(VecDeque::new()),
            on_waiter: Mutex::new(None),
        }
    }

    /// Park the current task on the conditional until notified or the
    /// deadline expires.
    ///
    /// Returns `Ok(true)` when activated, `Ok(false)` on timeout or abort.
    pub fn wait(&self, sync: &SyncPoint, deadline: Deadline) -> Result<bool, DoubleWaitError> {
        use std::sync::atomic::Ordering;

        if sync.active.swap(true, Ordering::AcqRel) {
            return Err(DoubleWaitError);
        }

        // A notification that raced a previous timeout may still be
        // buffered; it must not satisfy this wait.
        while sync.chan.try_receive().is_some() {}

        self.waiting.lock().push_back(sync.weak());
        if let Some(cb) = self.on_waiter.lock().as_ref() {
            cb();
        }

        let result = sync.chan.receive(deadline);
        sync.active.store(false, Ordering::Release);

        Ok(matches!(result, Ok(SyncResult::Activated)))
    }

    /// Resume every current waiter with `result`. Returns how many waiters
    /// were still alive to notify.
    pub fn notify(&self, result: SyncResult) -> usize {
        let drained: Vec<_> = self.waiting.lock().drain(..).collect();
        let mut notified = 0;
        for weak in drained {
            if let Some(chan) = weak.upgrade() {
                match result {
                    SyncResult::Abort => chan.terminate(),
                    SyncResult::Activated => {
                        let _ = chan.send(SyncResult::Activated);
                    }
                }
                notified += 1;
            }
        }
        notified
    }

    /// Resume the longest-waiting live waiter. Returns whether one existed.
    pub fn notify_one(&self) -> bool {
        loop {
            let front = self.waiting.lock().pop_front();
            match front {
                None => return false,
                Some(weak) => {
                    if let Some(chan) = weak.upgrade() {
                        let _ = chan.send(SyncResult::Activated);
                        return true;
                    }
                    // Waiter already gone; try the next.
                }
            }
        }
    }

    /// Install a callback invoked each time a waiter enqueues.
    pub fn on_waiter(&self, f: impl Fn() + Send + 'static) {
        *self.on_waiter.lock() = Some(Box::new(f));
    }
}

impl Default for Conditional {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Conditional {
    fn drop(&mut self) {
        self.notify(SyncResult::Abort);
    }
}

impl fmt::Debug for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conditional")
            .field("waiting", &self.waiting.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn test_notify_one_activates_waiter() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let activated = Arc::new(AtomicU64::new(0));

        let c2 = Arc::clone(&cond);
        let a2 = Arc::clone(&activated);
        let waiter = crate::spawn(move || {
            let sync = SyncPoint::new();
            if c2.wait(&sync, Deadline::Inf).unwrap() {
                a2.fetch_add(1, Ordering::SeqCst);
            }
        });

        std::thread::sleep(Duration::from_millis(50));
        let c3 = Arc::clone(&cond);
        crate::spawn(move || {
            assert!(c3.notify_one());
        })
        .join();
        waiter.join();
        assert_eq!(activated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout_returns_false() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let c2 = Arc::clone(&cond);
        crate::spawn(move || {
            let sync = SyncPoint::new();
            let got = c2
                .wait(&sync, Deadline::after(Duration::from_millis(30)))
                .unwrap();
            assert!(!got);
        })
        .join();
        // The timed-out waiter left a dead weak entry behind; notify_one
        // must skip it and report nobody.
        assert!(!cond.notify_one());
    }

    #[test]
    fn test_notify_all() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let activated = Arc::new(AtomicU64::new(0));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let c = Arc::clone(&cond);
                let a = Arc::clone(&activated);
                crate::spawn(move || {
                    let sync = SyncPoint::new();
                    if c.wait(&sync, Deadline::Inf).unwrap() {
                        a.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        let c2 = Arc::clone(&cond);
        crate::spawn(move || {
            assert_eq!(c2.notify(SyncResult::Activated), 3);
        })
        .join();
        for w in waiters {
            w.join();
        }
        assert_eq!(activated.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_aborts_waiters() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let aborted = Arc::new(AtomicU64::new(0));

        let c2 = Arc::clone(&cond);
        let a2 = Arc::clone(&aborted);
        let waiter = crate::spawn(move || {
            let sync = SyncPoint::new();
            if !c2.wait(&sync, Deadline::Inf).unwrap() {
                a2.fetch_add(1, Ordering::SeqCst);
            }
        });

        std::thread::sleep(Duration::from_millis(50));
        // Dropping the last owner on a fresh task aborts the wait.
        let c3 = Arc::clone(&cond);
        drop(cond);
        crate::spawn(move || drop(c3)).join();
        waiter.join();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_wait_rejected() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let c2 = Arc::clone(&cond);
        crate::spawn(move || {
            let sync = SyncPoint::new();
            sync.active.store(true, std::sync::atomic::Ordering::SeqCst);
            assert_eq!(c2.wait(&sync, Deadline::Inf), Err(DoubleWaitError));
        })
        .join();
    }

    #[test]
    fn test_on_waiter_callback() {
        crate::init(2);
        let cond = Arc::new(Conditional::new());
        let seen = Arc::new(AtomicU64::new(0));
        let s2 = Arc::clone(&seen);
        cond.on_waiter(move || {
            s2.fetch_add(1, Ordering::SeqCst);
        });

        let c2 = Arc::clone(&cond);
        let waiter = crate::spawn(move || {
            let sync = SyncPoint::new();
            let _ = c2.wait(&sync, Deadline::after(Duration::from_millis(200)));
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        cond.notify(SyncResult::Activated);
        waiter.join();
    }
}
