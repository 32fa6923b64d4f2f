//! Auto-reset and manual-reset events for tasks.
//!
//! `AutoResetEvent` packs a set-count and a waiter-count into one 64-bit
//! atomic word; matched pairs of sets and waiters resume exactly
//! `min(sets, waiters)` tasks, each exactly once, consuming one set per
//! resumed waiter. A two-stage waiter list (new-waiters LIFO drained into an
//! internal FIFO) preserves fairness across resumers.
//!
//! `ManualResetEvent` is a latch: `set` releases every current and future
//! waiter until `reset`.

use parking_lot::Mutex;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::scheduler::{current_or_panic, Scheduler};
use crate::task::{WaitToken, WakeReason};

// ---------------------------------------------------------------------------
// AutoResetEvent
// ---------------------------------------------------------------------------

const SET_INCREMENT: u64 = 1;
const WAITER_INCREMENT: u64 = 1 << 32;

#[inline]
fn set_count(state: u64) -> u32 {
    state as u32
}

#[inline]
fn waiter_count(state: u64) -> u32 {
    (state >> 32) as u32
}

#[inline]
fn resumable_count(state: u64) -> u32 {
    set_count(state).min(waiter_count(state))
}

/// An event that releases one waiter per `set` and resets itself.
pub struct AutoResetEvent {
    /// Low 32 bits: pending sets. High 32 bits: registered waiters.
    state: AtomicU64,
    /// Waiters in arrival order that have not yet been moved to `waiters`.
    new_waiters: Mutex<Vec<WaitToken>>,
    /// Drain FIFO consumed front-first by resumers.
    waiters: Mutex<VecDeque<WaitToken>>,
}

impl AutoResetEvent {
    pub fn new(initially_set: bool) -> Self {
        AutoResetEvent {
            state: AtomicU64::new(if initially_set { SET_INCREMENT } else { 0 }),
            new_waiters: Mutex::new(Vec::new()),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one set. Saturates once every registered waiter already has a
    /// matching set, so sets never accumulate past demand plus one.
    pub fn set(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        loop {
            if set_count(old) > waiter_count(old) {
                return;
            }
            match self.state.compare_exchange_weak(
                old,
                old + SET_INCREMENT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => old = observed,
            }
        }

        // This set transitioned set-count 0 -> 1 with waiters present:
        // this caller is the designated resumer.
        if old != 0 && set_count(old) == 0 {
            let sched = current_or_panic();
            self.resume_waiters(old + SET_INCREMENT, &sched);
        }
    }

    /// Drop one pending set, when not already consumed by a waiter.
    pub fn reset(&self) {
        let mut old = self.state.load(Ordering::Relaxed);
        while set_count(old) > waiter_count(old) {
            match self.state.compare_exchange_weak(
                old,
                old - SET_INCREMENT,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => old = observed,
            }
        }
    }

    /// Wait until a set is available, consuming it.
    ///
    /// # Panics
    ///
    /// Panics when called outside task context.
    pub fn wait(&self) {
        // Synchronous path: consume an unmatched set without suspending.
        let mut old = self.state.load(Ordering::Relaxed);
        while set_count(old) > waiter_count(old) {
            match self.state.compare_exchange_weak(
                old,
                old - SET_INCREMENT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => old = observed,
            }
        }

        let sched = current_or_panic();
        let _ = sched.park_current(|token| {
            self.new_waiters.lock().push(token);
            let old = self.state.fetch_add(WAITER_INCREMENT, Ordering::AcqRel);
            // This waiter transitioned waiter-count 0 -> 1 with sets
            // pending: it is the designated resumer (and may resume itself).
            if old != 0 && waiter_count(old) == 0 {
                self.resume_waiters(old + WAITER_INCREMENT, &sched);
            }
            Ok::<(), std::convert::Infallible>(())
        });
    }

    /// Resume `min(sets, waiters)` tasks, exactly once each, repeating while
    /// new arrivals keep the product positive. Only one thread runs this at
    /// a time: the state-word transitions gate entry.
    fn resume_waiters(&self, init_state: u64, sched: &Arc<Scheduler>) {
        let mut to_resume: Vec<WaitToken> = Vec::new();
        let mut count = resumable_count(init_state);
        debug_assert!(count > 0);

        loop {
            for _ in 0..count {
                let token = {
                    let mut fifo = self.waiters.lock();
                    if fifo.is_empty() {
                        let mut fresh = self.new_waiters.lock();
                        debug_assert!(!fresh.is_empty());
                        fifo.extend(fresh.drain(..));
                    }
                    fifo.pop_front().expect("waiter accounted but not queued")
                };
                to_resume.push(token);
            }

            let delta = u64::from(count) | u64::from(count) << 32;
            let new_state = self.state.fetch_sub(delta, Ordering::AcqRel) - delta;
            count = resumable_count(new_state);
            if count == 0 {
                break;
            }
        }

        for token in to_resume {
            sched.wake(token, WakeReason::Notified);
        }
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for AutoResetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("AutoResetEvent")
            .field("sets", &set_count(state))
            .field("waiters", &waiter_count(state))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ManualResetEvent
// ---------------------------------------------------------------------------

/// A latch event: once set, every wait returns immediately until `reset`.
pub struct ManualResetEvent {
    set: AtomicBool,
    waiters: Mutex<Vec<WaitToken>>,
}

impl ManualResetEvent {
    pub fn new(initially_set: bool) -> Self {
        ManualResetEvent {
            set: AtomicBool::new(initially_set),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Set the event and resume every queued waiter.
    pub fn set(&self) {
        if self.set.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<WaitToken> = std::mem::take(&mut *self.waiters.lock());
        if drained.is_empty() {
            return;
        }
        let sched = current_or_panic();
        for token in drained {
            // Stale tokens (timed-out or self-woken waiters) fail silently.
            sched.wake(token, WakeReason::Notified);
        }
    }

    /// Clear the event. Subsequent waits suspend again.
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// Wait until the event is set. Returns immediately if already set.
    ///
    /// # Panics
    ///
    /// Panics when called outside task context.
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let sched = current_or_panic();
        let _ = sched.park_current(|token| {
            self.waiters.lock().push(token);
            // Re-check: a concurrent set() may have drained the list just
            // before our push, leaving nobody to wake us.
            if self.is_set() {
                sched.wake(token, WakeReason::Notified);
            }
            Ok::<(), std::convert::Infallible>(())
        });
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for ManualResetEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualResetEvent")
            .field("set", &self.is_set())
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn test_auto_reset_initially_set_consumed_once() {
        crate::init(2);
        let ev = Arc::new(AutoResetEvent::new(true));
        let e2 = Arc::clone(&ev);
        let h = crate::spawn(move || {
            // First wait consumes the initial set without suspending.
            e2.wait();
        });
        h.join();
        // No sets remain.
        assert_eq!(set_count(ev.state.load(Ordering::Relaxed)), 0);
    }

    #[test]
    fn test_auto_reset_matches_min_of_sets_and_waiters() {
        crate::init(2);
        let ev = Arc::new(AutoResetEvent::new(false));
        let resumed = Arc::new(AtomicU64::new(0));

        let waiters = 5;
        let sets = 3;
        let handles: Vec<_> = (0..waiters)
            .map(|_| {
                let ev = Arc::clone(&ev);
                let resumed = Arc::clone(&resumed);
                crate::spawn(move || {
                    ev.wait();
                    resumed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // Let the waiters park.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let e2 = Arc::clone(&ev);
        crate::spawn(move || {
            for _ in 0..sets {
                e2.set();
            }
        })
        .join();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(resumed.load(Ordering::SeqCst), sets);

        // Release the remaining waiters so the test leaves no parked tasks.
        let e3 = Arc::clone(&ev);
        crate::spawn(move || {
            for _ in 0..(waiters - sets) {
                e3.set();
            }
        })
        .join();
        for h in handles {
            h.join();
        }
        assert_eq!(resumed.load(Ordering::SeqCst), waiters);
    }

    #[test]
    fn test_auto_reset_set_saturates() {
        crate::init(2);
        let ev = AutoResetEvent::new(false);
        crate::spawn(move || {
            ev.set();
            ev.set();
            ev.set();
            // Only one unmatched set may be pending.
            assert_eq!(set_count(ev.state.load(Ordering::Relaxed)), 1);
            ev.reset();
            assert_eq!(set_count(ev.state.load(Ordering::Relaxed)), 0);
        })
        .join();
    }

    #[test]
    fn test_manual_reset_latch() {
        crate::init(2);
        let ev = Arc::new(ManualResetEvent::new(false));
        let passed = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ev = Arc::clone(&ev);
                let passed = Arc::clone(&passed);
                crate::spawn(move || {
                    ev.wait();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(passed.load(Ordering::SeqCst), 0);

        let e2 = Arc::clone(&ev);
        crate::spawn(move || e2.set()).join();
        for h in handles {
            h.join();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 4);

        // Once set, new waits pass through immediately.
        let e3 = Arc::clone(&ev);
        crate::spawn(move || {
            e3.wait();
        })
        .join();

        ev.reset();
        assert!(!ev.is_set());
    }
}
