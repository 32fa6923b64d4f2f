//! Per-worker ready queue with priority sub-queues.
//!
//! Each worker thread owns one [`WorkQueue`]: an array of lock-free MPMC
//! sub-queues (one per priority level) plus a counting semaphore that the
//! worker sleeps on. Enqueue is safe from any thread and never suspends the
//! caller; only the owning worker dequeues in the steady state, but peers
//! may steal through the same interface when the work-stealing hook is
//! enabled.
//!
//! Drain policy: highest priority first; within a priority, FIFO; an empty
//! high-priority level falls through to lower ones.

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};

use crate::task::{Priority, TaskId, PRIORITY_COUNT};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// A counting semaphore built from a mutex and condvar.
///
/// The count mirrors the number of items enqueued but not yet dequeued, plus
/// any wake hints issued by the scheduler (spawn routing, shutdown).
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cv.notify_one();
    }

    /// Decrement the count, blocking until it is positive or the timeout
    /// elapses. Returns `true` when a token was taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 && self.cv.wait_for(&mut count, timeout).timed_out() && *count == 0 {
            return false;
        }
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// Thread-affine ready queue of resumable tasks at `PRIORITY_COUNT` levels.
///
/// Entries are task ids; the owning worker maps them back to its local
/// (thread-pinned) coroutine handles.
pub struct WorkQueue {
    queues: [Injector<TaskId>; PRIORITY_COUNT],
    sem: Semaphore,
    active: AtomicBool,
    id: usize,
}

impl WorkQueue {
    /// Create an empty, active queue owned by worker `id`.
    pub fn new(id: usize) -> Self {
        WorkQueue {
            queues: [Injector::new(), Injector::new(), Injector::new()],
            sem: Semaphore::new(),
            active: AtomicBool::new(true),
            id,
        }
    }

    /// Index of the owning worker.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Push a ready task at `priority` and signal the owner.
    ///
    /// Lock-free against concurrent enqueues; never suspends the caller.
    pub fn enqueue(&self, task: TaskId, priority: Priority) {
        self.queues[priority.queue_index()].push(task);
        self.sem.release();
    }

    /// Pop the next ready task: highest priority first, FIFO within one
    /// level. Returns `None` when every sub-queue is empty.
    pub fn try_dequeue(&self) -> Option<TaskId> {
        for queue in self.queues.iter().rev() {
            loop {
                match queue.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Approximate total number of queued entries, for diagnostics only.
    pub fn size_approx(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Wake the owning worker without enqueueing (spawn routing hint,
    /// shutdown nudge).
    pub fn notify(&self) {
        self.sem.release();
    }

    /// Block the owning worker until a signal arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.sem.acquire_timeout(timeout)
    }

    /// True until [`WorkQueue::deactivate`] is called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the queue inactive and release the semaphore once so a blocked
    /// owner is guaranteed to observe the change.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.sem.release();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("id", &self.id)
            .field("size_approx", &self.size_approx())
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_fifo_drain() {
        let q = WorkQueue::new(0);

        // Interleave priorities; expect strict priority order, FIFO within.
        q.enqueue(TaskId(1), Priority::Low);
        q.enqueue(TaskId(2), Priority::High);
        q.enqueue(TaskId(3), Priority::Normal);
        q.enqueue(TaskId(4), Priority::High);
        q.enqueue(TaskId(5), Priority::Low);
        q.enqueue(TaskId(6), Priority::Normal);

        let order: Vec<u64> = std::iter::from_fn(|| q.try_dequeue()).map(|t| t.0).collect();
        assert_eq!(order, vec![2, 4, 3, 6, 1, 5]);
    }

    #[test]
    fn test_empty_dequeue() {
        let q = WorkQueue::new(3);
        assert!(q.try_dequeue().is_none());
        assert_eq!(q.size_approx(), 0);
        assert_eq!(q.id(), 3);
    }

    #[test]
    fn test_size_approx() {
        let q = WorkQueue::new(0);
        for i in 0..10 {
            q.enqueue(TaskId(i), Priority::Normal);
        }
        assert_eq!(q.size_approx(), 10);
        q.try_dequeue();
        assert_eq!(q.size_approx(), 9);
    }

    #[test]
    fn test_semaphore_counts_items() {
        let q = WorkQueue::new(0);
        q.enqueue(TaskId(1), Priority::Normal);
        q.enqueue(TaskId(2), Priority::Normal);
        assert!(q.wait(Duration::from_millis(10)));
        assert!(q.wait(Duration::from_millis(10)));
        // Third wait has no token and must time out.
        assert!(!q.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_deactivate_wakes_waiter() {
        let q = std::sync::Arc::new(WorkQueue::new(0));
        let q2 = std::sync::Arc::clone(&q);
        let h = std::thread::spawn(move || {
            // Either a token from deactivate or a timeout; the queue must be
            // observed inactive shortly after.
            q2.wait(Duration::from_secs(5));
            assert!(!q2.is_active());
        });
        std::thread::sleep(Duration::from_millis(20));
        q.deactivate();
        h.join().unwrap();
    }

    #[test]
    fn test_concurrent_enqueue_all_drained() {
        let q = std::sync::Arc::new(WorkQueue::new(0));
        let threads = 8;
        let per_thread = 100u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let q = std::sync::Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        q.enqueue(TaskId(t * per_thread + i), Priority::Normal);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        while q.try_dequeue().is_some() {
            count += 1;
        }
        assert_eq!(count, threads * per_thread);
    }
}
