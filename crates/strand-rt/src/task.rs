//! Task control block for strand coroutines.
//!
//! Each task is a lightweight suspendable unit of work with its own id,
//! state, priority, and park bookkeeping. Tasks are multiplexed across OS
//! threads by the scheduler; a task never migrates between threads once its
//! coroutine has been created.
//!
//! ## Wait tokens
//!
//! Every park of a task mints a fresh [`WaitToken`] by bumping the task's
//! park sequence number. A wake only succeeds when the token's sequence
//! matches the task's current park, so each park is woken at most once and
//! stale wakes (an expired timer racing an I/O event, a notification racing
//! a timeout) are discarded at the attempt. This is the tombstone mechanism
//! for cancelled timer entries and abandoned waiter-list nodes: the entry
//! stays where it is, and the mismatching wake fails at pop time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Unique identifier for a task.
///
/// Ids are assigned sequentially from a global atomic counter, guaranteeing
/// uniqueness within a single runtime instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Generate a fresh, globally unique task id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// The execution state of a task.
///
/// At any instant a task belongs to exactly one owner: a work queue
/// (`Ready`), the call stack of one worker thread (`Running`), a wait-list
/// inside a primitive or the reactor (`Waiting`), or nobody (`Exited`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to run (queued on its home worker).
    Ready,
    /// Currently executing on a worker thread.
    Running,
    /// Parked on a primitive, a timer, or an I/O readiness wait.
    Waiting,
    /// Completed; the control block is about to be reclaimed.
    Exited,
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Number of priority levels in every work queue.
pub const PRIORITY_COUNT: usize = 3;

/// Scheduling priority for a task.
///
/// Higher-priority tasks are dequeued before normal and low-priority ones;
/// within one level the order is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Convert from a raw u8. 0 = High, 2 = Low, anything else Normal.
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => Priority::High,
            2 => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Index of the sub-queue this priority drains from. Dequeuers scan from
    /// `PRIORITY_COUNT - 1` downwards, so a larger index drains first.
    pub fn queue_index(self) -> usize {
        match self {
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

// ---------------------------------------------------------------------------
// Wake reasons
// ---------------------------------------------------------------------------

/// Readiness bits delivered by an I/O wake.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IoEvents(pub u8);

impl IoEvents {
    pub const READABLE: IoEvents = IoEvents(0x01);
    pub const WRITABLE: IoEvents = IoEvents(0x02);
    pub const ERROR: IoEvents = IoEvents(0x04);
    pub const HANGUP: IoEvents = IoEvents(0x08);

    pub fn contains(self, other: IoEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: IoEvents) -> IoEvents {
        IoEvents(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for IoEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(IoEvents::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(IoEvents::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.contains(IoEvents::ERROR) {
            parts.push("ERROR");
        }
        if self.contains(IoEvents::HANGUP) {
            parts.push("HANGUP");
        }
        write!(f, "IoEvents({})", parts.join("|"))
    }
}

/// Why a parked task was resumed.
///
/// Delivered to exactly one park; the parker reads it after its coroutine
/// regains control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The awaited condition was satisfied (lock granted, event set,
    /// channel ready, explicit wake).
    Notified,
    /// The park's deadline expired before the condition was satisfied.
    Timeout,
    /// File descriptor readiness.
    Io(IoEvents),
    /// The awaited object is being torn down; the wait cannot complete.
    Abort,
}

// ---------------------------------------------------------------------------
// WaitToken
// ---------------------------------------------------------------------------

/// Single-shot wake capability for one park of one task.
///
/// Minted by the park path; consumed by the first successful
/// `Scheduler::wake` carrying it. Copies of the token held by losers of the
/// wake race (a timer entry after an I/O wake, a waiter node after a
/// timeout) become inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitToken {
    pub task: TaskId,
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Task (the control block)
// ---------------------------------------------------------------------------

/// Completion latch shared between a task's control block and its
/// [`crate::scheduler::TaskHandle`].
pub struct TaskDone {
    done: parking_lot::Mutex<bool>,
    cv: parking_lot::Condvar,
}

impl TaskDone {
    pub fn new() -> Arc<Self> {
        Arc::new(TaskDone {
            done: parking_lot::Mutex::new(false),
            cv: parking_lot::Condvar::new(),
        })
    }

    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }
}

/// The task control block.
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Current execution state.
    pub state: TaskState,

    /// Scheduling priority, fixed at spawn.
    pub priority: Priority,

    /// Index of the worker thread that owns this task's coroutine.
    /// Resumption must be enqueued there; coroutines never migrate.
    /// Assigned when the first claiming worker creates the coroutine.
    pub home_worker: usize,

    /// Worker the spawn was placed on, for back-pressure accounting.
    /// May differ from `home_worker` when the request was stolen.
    pub placed_worker: usize,

    /// Park sequence number; bumped on every park and on park rollback.
    pub park_seq: u64,

    /// Reason for the most recent wake; read by the parker after resume.
    pub wake_reason: WakeReason,

    /// Completion latch signalled when the task exits.
    pub done: Arc<TaskDone>,
}

impl Task {
    /// Create a new control block pinned to `home_worker`.
    pub fn new(id: TaskId, priority: Priority, home_worker: usize) -> Self {
        Task {
            id,
            state: TaskState::Ready,
            priority,
            home_worker,
            placed_worker: home_worker,
            park_seq: 0,
            wake_reason: WakeReason::Notified,
            done: TaskDone::new(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("home_worker", &self.home_worker)
            .field("park_seq", &self.park_seq)
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
    fn test_task_id_unique() {
        let ids: Vec<TaskId> = (0..100).map(|_| TaskId::next()).collect();
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            assert!(seen.insert(id.0), "Duplicate task id: {}", id.0);
        }
    }

    #[test]
    fn test_task_id_concurrent_unique() {
        let all = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let all = std::sync::Arc::clone(&all);
                std::thread::spawn(move || {
                    let local: Vec<u64> = (0..100).map(|_| TaskId::next().as_u64()).collect();
                    all.lock().extend(local);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let ids = all.lock();
        let mut seen = std::collections::HashSet::new();
        for &id in ids.iter() {
            assert!(seen.insert(id), "Duplicate task id under concurrency: {}", id);
        }
        assert_eq!(ids.len(), 800);
    }

    #[test]
    fn test_priority_from_u8() {
        assert_eq!(Priority::from_u8(0), Priority::High);
        assert_eq!(Priority::from_u8(1), Priority::Normal);
        assert_eq!(Priority::from_u8(2), Priority::Low);
        assert_eq!(Priority::from_u8(255), Priority::Normal);
    }

    #[test]
    fn test_priority_queue_index_order() {
        // Higher priority maps to a larger index; dequeuers scan downwards.
        assert!(Priority::High.queue_index() > Priority::Normal.queue_index());
        assert!(Priority::Normal.queue_index() > Priority::Low.queue_index());
        assert!(Priority::High.queue_index() < PRIORITY_COUNT);
    }

    #[test]
    fn test_io_events_bits() {
        let ev = IoEvents::READABLE.union(IoEvents::HANGUP);
        assert!(ev.contains(IoEvents::READABLE));
        assert!(ev.contains(IoEvents::HANGUP));
        assert!(!ev.contains(IoEvents::WRITABLE));
        assert!(!ev.is_empty());
        assert!(IoEvents::default().is_empty());
    }

    #[test]
    fn test_task_new() {
        let id = TaskId::next();
        let task = Task::new(id, Priority::Normal, 0);
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.park_seq, 0);
        assert_eq!(task.home_worker, 0);
        assert!(!task.done.is_done());
    }

    #[test]
    fn test_task_done_latch() {
        let done = TaskDone::new();
        let d2 = std::sync::Arc::clone(&done);
        let h = std::thread::spawn(move || {
            d2.wait();
        });
        done.signal();
        h.join().unwrap();
        assert!(done.is_done());
    }
}
