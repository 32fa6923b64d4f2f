//! Lock-free coroutine mutex.
//!
//! The mutex state is a single atomic word with two sentinel values:
//! `NOT_LOCKED` and `LOCKED_NO_WAITERS`. Any other value is the head of a
//! lock-free LIFO of heap-allocated waiter nodes pushed by contended
//! lockers. `unlock` drains that LIFO — reversing it into an internal FIFO
//! cache — and hands the lock directly to the front waiter, so handoff is
//! FIFO among waiters that arrived during the same locked epoch and there is
//! never a thundering herd.
//!
//! Unlike the other primitives, locking takes no deadline: the lock is
//! always handed to exactly one waiter when released.

use parking_lot::Mutex;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::scheduler::{current_or_panic, Scheduler};
use crate::task::{WaitToken, WakeReason};

/// Sentinel: the mutex is unlocked.
const NOT_LOCKED: usize = 1;
/// Sentinel: locked, and no waiter has pushed onto the LIFO.
const LOCKED_NO_WAITERS: usize = 0;

struct Waiter {
    next: *mut Waiter,
    token: WaitToken,
}

/// A suspending mutual-exclusion lock for tasks.
///
/// `lock` suspends the calling task when contended; `try_lock` never
/// suspends. Both return a guard that releases on drop.
pub struct AsyncMutex {
    /// `NOT_LOCKED`, `LOCKED_NO_WAITERS`, or the head of the waiter LIFO.
    state: AtomicUsize,
    /// FIFO of waiters drained from the LIFO; only touched by the thread
    /// performing an unlock, but unlocks move between threads with the lock.
    cache: Mutex<VecDeque<WaitToken>>,
}

// Waiter nodes are owned by the state word; tokens inside are Send.
unsafe impl Send for AsyncMutex {}
unsafe impl Sync for AsyncMutex {}

impl AsyncMutex {
    pub fn new() -> Self {
        AsyncMutex {
            state: AtomicUsize::new(NOT_LOCKED),
            cache: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire without suspending. Returns a guard on success.
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_>> {
        self.state
            .compare_exchange(
                NOT_LOCKED,
                LOCKED_NO_WAITERS,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| AsyncMutexGuard { mutex: self })
    }

    /// Acquire, suspending the current task while the lock is held
    /// elsewhere.
    ///
    /// # Panics
    ///
    /// Panics when called outside task context.
    pub fn lock(&self) -> AsyncMutexGuard<'_> {
        if let Some(guard) = self.try_lock() {
            return guard;
        }

        let sched = current_or_panic();
        // Acquired-without-parking marker for the prepare closure.
        struct Acquired;

        let parked = sched.park_current(|token| {
            let node = Box::into_raw(Box::new(Waiter {
                next: std::ptr::null_mut(),
                token,
            }));

            let mut state = self.state.load(Ordering::Acquire);
            loop {
                if state == NOT_LOCKED {
                    match self.state.compare_exchange_weak(
                        NOT_LOCKED,
                        LOCKED_NO_WAITERS,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // Lock grabbed after all; no need to suspend.
                            drop(unsafe { Box::from_raw(node) });
                            return Err(Acquired);
                        }
                        Err(observed) => state = observed,
                    }
                } else {
                    // Push self onto the LIFO. `LOCKED_NO_WAITERS` is the
                    // null end-of-list, so storing the old state as `next`
                    // is correct in every non-`NOT_LOCKED` case.
                    unsafe { (*node).next = state as *mut Waiter };
                    match self.state.compare_exchange_weak(
                        state,
                        node as usize,
                        Ordering::Release,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(observed) => state = observed,
                    }
                }
            }
        });

        match parked {
            // Woken by an unlock: ownership was handed to us directly.
            Ok(_reason) => AsyncMutexGuard { mutex: self },
            // Acquired inside prepare without suspending.
            Err(Acquired) => AsyncMutexGuard { mutex: self },
        }
    }

    /// Release the lock, handing it to the longest-waiting task if any.
    fn unlock(&self, sched: &Arc<Scheduler>) {
        debug_assert_ne!(self.state.load(Ordering::Relaxed), NOT_LOCKED);

        let mut cache = self.cache.lock();
        if cache.is_empty() {
            if self
                .state
                .compare_exchange(
                    LOCKED_NO_WAITERS,
                    NOT_LOCKED,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }

            // Waiters piled up: take the LIFO, keep the lock held for the
            // handoff, and reverse the chain into FIFO order.
            let old = self.state.swap(LOCKED_NO_WAITERS, Ordering::Acquire);
            debug_assert!(old != NOT_LOCKED && old != LOCKED_NO_WAITERS);

            let mut newest_first = Vec::new();
            let mut node = old as *mut Waiter;
            while !node.is_null() {
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next;
                newest_first.push(boxed.token);
            }
            for token in newest_first.into_iter().rev() {
                cache.push_back(token);
            }
        }

        let front = cache.pop_front().expect("unlock with empty waiter cache");
        drop(cache);
        // The woken task owns the lock; state stays locked.
        sched.wake(front, WakeReason::Notified);
    }
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncMutex {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert!(
            state == NOT_LOCKED || state == LOCKED_NO_WAITERS,
            "AsyncMutex dropped with queued waiters"
        );
        debug_assert!(self.cache.lock().is_empty());
    }
}

impl std::fmt::Debug for AsyncMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        let desc = match state {
            NOT_LOCKED => "unlocked",
            LOCKED_NO_WAITERS => "locked",
            _ => "locked+waiters",
        };
        f.debug_struct("AsyncMutex").field("state", &desc).finish()
    }
}

/// Scoped ownership of an [`AsyncMutex`]; releases on drop.
#[must_use = "the lock releases as soon as the guard is dropped"]
pub struct AsyncMutexGuard<'a> {
    mutex: &'a AsyncMutex,
}

impl Drop for AsyncMutexGuard<'_> {
    fn drop(&mut self) {
        let sched = current_or_panic();
        self.mutex.unlock(&sched);
    }
}

impl std::fmt::Debug for AsyncMutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMutexGuard").finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    #[test]
    fn test_try_lock_uncontended() {
        crate::init(2);
        let m = Arc::new(AsyncMutex::new());
        let m2 = Arc::clone(&m);
        let h = crate::spawn(move || {
            let g = m2.try_lock();
            assert!(g.is_some());
            assert!(m2.try_lock().is_none());
            drop(g);
            assert!(m2.try_lock().is_some());
        });
        h.join();
    }

    #[test]
    fn test_mutual_exclusion_and_count() {
        crate::init(2);
        let m = Arc::new(AsyncMutex::new());
        let counter = Arc::new(AtomicU64::new(0));
        let in_critical = Arc::new(AtomicBool::new(false));

        let tasks = 4;
        let iters = 1_000;
        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let m = Arc::clone(&m);
                let counter = Arc::clone(&counter);
                let in_critical = Arc::clone(&in_critical);
                crate::spawn(move || {
                    for _ in 0..iters {
                        let _g = m.lock();
                        // No two tasks may observe the flag set.
                        assert!(!in_critical.swap(true, Ordering::SeqCst));
                        counter.fetch_add(1, Ordering::SeqCst);
                        in_critical.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::SeqCst), tasks * iters);
    }

    #[test]
    fn test_handoff_liveness() {
        crate::init(2);
        let m = Arc::new(AsyncMutex::new());
        let released = Arc::new(AtomicU64::new(0));

        // One holder keeps the lock briefly while several waiters queue.
        let m1 = Arc::clone(&m);
        let holder = crate::spawn(move || {
            let _g = m1.lock();
            for _ in 0..50 {
                crate::yield_now();
            }
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                let released = Arc::clone(&released);
                crate::spawn(move || {
                    let _g = m.lock();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        holder.join();
        for h in handles {
            h.join();
        }
        assert_eq!(released.load(Ordering::SeqCst), 8);
    }
}
