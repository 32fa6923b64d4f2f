//! Corosensei-based stackful coroutine management for strand tasks.
//!
//! Each task runs as a stackful coroutine with a 64 KiB stack. The coroutine
//! yields whenever the task parks on a primitive, a timer, or an I/O wait,
//! returning control to the owning worker thread.
//!
//! ## Thread-local state
//!
//! Two thread-locals track the current execution context:
//! - `CURRENT_YIELDER`: pointer to the active coroutine's Yielder, used by
//!   `yield_current()` to suspend the running task
//! - `CURRENT_TASK`: the id of the task running on this thread

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::task::TaskId;

use std::cell::Cell;

/// Default coroutine stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so tens of thousands of tasks each
/// with a 64 KiB virtual stack are feasible on modern systems.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Thread-local current-task context
// ---------------------------------------------------------------------------

thread_local! {
    /// Raw pointer to the current coroutine's Yielder.
    ///
    /// Set inside the coroutine body, cleared by the worker after the
    /// coroutine yields or completes. Stored as `*const ()` to erase the
    /// lifetime; the Yielder is borrowed from within the coroutine body and
    /// remains valid for the duration of that resume.
    pub static CURRENT_YIELDER: Cell<Option<*const ()>> = const { Cell::new(None) };

    /// Id of the task currently executing on this thread.
    pub static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Set the current task id on this thread.
pub fn set_current_task(id: TaskId) {
    CURRENT_TASK.with(|c| c.set(Some(id)));
}

/// Get the current task id on this thread, if a task is running.
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}

/// Clear the current task id on this thread.
pub fn clear_current_task() {
    CURRENT_TASK.with(|c| c.set(None));
}

/// True when called from inside a running task.
pub fn in_task_context() -> bool {
    current_task().is_some()
}

// ---------------------------------------------------------------------------
// Yield support
// ---------------------------------------------------------------------------

/// Suspend the current coroutine, returning control to the worker thread.
///
/// After `suspend()` returns (the coroutine is resumed), the yielder is
/// re-installed into the thread-local because another coroutine may have run
/// on this thread in between and overwritten it.
///
/// # Panics
///
/// Panics if called outside of a coroutine context.
pub fn yield_current() {
    CURRENT_YIELDER.with(|c| {
        let ptr = c
            .get()
            .expect("yield_current called outside of task context");
        // Safety: the pointer is valid because we are inside the coroutine
        // body that set it, and the Yielder is borrowed for the duration of
        // the body.
        let yielder: &Yielder<(), ()> = unsafe { &*(ptr as *const Yielder<(), ()>) };
        yielder.suspend(());
        c.set(Some(ptr));
    });
}

// ---------------------------------------------------------------------------
// CoroutineHandle
// ---------------------------------------------------------------------------

/// A handle wrapping a corosensei `Coroutine` for a task.
///
/// The coroutine runs the task's entry closure on a dedicated 64 KiB stack.
/// The closure runs under `catch_unwind`, so a panicking task is logged and
/// terminated without unwinding into the scheduler.
///
/// `CoroutineHandle` is `!Send`: corosensei coroutines cannot move across
/// threads, and the scheduler keeps each one on the thread that created it.
pub struct CoroutineHandle {
    coro: Coroutine<(), (), ()>,
}

impl CoroutineHandle {
    /// Create a new coroutine that will run `entry` when first resumed.
    ///
    /// The coroutine installs its Yielder into the thread-local before
    /// calling the entry closure, so `yield_current()` can suspend it.
    pub fn new(entry: Box<dyn FnOnce() + Send + 'static>) -> Self {
        let stack =
            DefaultStack::new(DEFAULT_STACK_SIZE).expect("failed to allocate coroutine stack");

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            CURRENT_YIELDER.with(|c| {
                c.set(Some(yielder as *const Yielder<(), ()> as *const ()));
            });

            // A panicking task body terminates only that task.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
            if let Err(panic) = result {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into());
                log::error!("task panicked: {}", what);
            }

            // The worker clears the thread-local context after resume
            // returns; clearing here would interfere with another coroutine
            // that ran on this thread between our yield and resume.
        });

        CoroutineHandle { coro }
    }

    /// Resume the coroutine.
    ///
    /// Returns `true` if the coroutine yielded (parked or cooperatively
    /// yielded), `false` if it completed.
    pub fn resume(&mut self) -> bool {
        match self.coro.resume(()) {
            CoroutineResult::Yield(()) => true,
            CoroutineResult::Return(()) => false,
        }
    }

    /// Check whether the coroutine has finished.
    pub fn done(&self) -> bool {
        self.coro.done()
    }
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("done", &self.done())
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
    use std::sync::Arc;

    #[test]
    fn test_coroutine_runs_to_completion() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let mut handle = CoroutineHandle::new(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let yielded = handle.resume();
        assert!(!yielded, "simple closure should complete without yielding");
        assert!(handle.done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_coroutine_yield_and_resume() {
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let mut handle = CoroutineHandle::new(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            yield_current();
            c.fetch_add(1, Ordering::SeqCst);
        }));

        // First resume: runs to the yield point.
        assert!(handle.resume());
        assert!(!handle.done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Second resume: completes.
        assert!(!handle.resume());
        assert!(handle.done());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_coroutine_panic_is_contained() {
        let mut handle = CoroutineHandle::new(Box::new(|| {
            panic!("intentional test panic");
        }));
        // The panic must not unwind through resume().
        let yielded = handle.resume();
        assert!(!yielded);
        assert!(handle.done());
    }

    #[test]
    fn test_current_task_thread_local() {
        assert!(current_task().is_none());
        assert!(!in_task_context());
        let id = TaskId::next();
        set_current_task(id);
        assert_eq!(current_task().unwrap(), id);
        assert!(in_task_context());
        clear_current_task();
        assert!(current_task().is_none());
    }
}
