//! Strand runtime library.
//!
//! A cooperative coroutine runtime for network services: suspendable tasks
//! scheduled across a pool of OS worker threads, with deadline-driven I/O
//! readiness, timers, and suspension-based synchronization primitives.
//!
//! ## Modules
//!
//! - [`scheduler`]: priority-aware work-stealing scheduler and the
//!   process-wide runtime handle
//! - [`queue`]: per-worker priority ready queues
//! - [`reactor`]: epoll + timer-heap reactor behind `fdwait` and `sleep`
//! - [`sync`]: coroutine mutex, events, channels, conditionals
//! - [`task`]: task control block, priorities, wait tokens
//! - [`deadline`]: absolute monotonic deadlines with an `Inf` sentinel
//!
//! ## Execution model
//!
//! Worker threads run tasks to their next suspension point; tasks only
//! suspend at explicit waits (primitive, timer, fd readiness). A task never
//! migrates between threads: waking re-enqueues it on its home worker.

pub mod deadline;
pub mod queue;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod sync;
pub mod task;

pub use deadline::Deadline;
pub use reactor::{fdwait, fdwait_on, sleep, sleep_until, Direction, IoWaitError};
pub use scheduler::{current, current_or_panic, init, Scheduler, SchedulerConfig, TaskHandle};
pub use sync::{
    AsyncMutex, AsyncMutexGuard, AutoResetEvent, Channel, ChannelError, Conditional,
    ManualResetEvent, SyncPoint, SyncResult,
};
pub use task::{IoEvents, Priority, TaskId, WakeReason};

/// Spawn a task at normal priority on the process-wide runtime.
///
/// # Panics
///
/// Panics when the runtime is not initialized; call [`init`] first.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> TaskHandle {
    scheduler::current_or_panic().spawn(f)
}

/// Spawn a task at the given priority on the process-wide runtime.
pub fn spawn_with(priority: Priority, f: impl FnOnce() + Send + 'static) -> TaskHandle {
    scheduler::current_or_panic().spawn_with(priority, f)
}

/// Yield the current task to the back of its ready queue.
///
/// A no-op when called outside task context.
pub fn yield_now() {
    if stack::in_task_context() {
        stack::yield_current();
    }
}
