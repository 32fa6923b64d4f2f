//! Priority-aware work-stealing scheduler for strand tasks.
//!
//! The scheduler multiplexes lightweight coroutine tasks across a fixed pool
//! of OS threads (one per CPU core by default). Work distribution uses
//! crossbeam-deque for lock-free work-stealing of fresh spawn requests.
//!
//! ## Design
//!
//! Since corosensei coroutines are `!Send`, a task cannot move between
//! threads once its coroutine exists. The scheduler therefore splits ready
//! work into two flows:
//!
//! 1. **Spawn requests** (boxed entry closures) are `Send`. They are pushed
//!    into a global injector (or a dedicated high-priority channel) and
//!    stolen by whichever worker gets there first.
//! 2. **Resumptions** of parked tasks target the task's home worker's
//!    [`WorkQueue`], a per-priority MPMC queue with a counting semaphore.
//!    The home worker maps the task id back to the thread-pinned coroutine
//!    handle it stashed when the task parked.
//!
//! ## Parking and waking
//!
//! A task parks by minting a [`WaitToken`], handing it to whatever will wake
//! it (a primitive's waiter list, the reactor, a timer entry), and yielding.
//! [`Scheduler::wake`] succeeds for at most one token per park; everyone
//! else's copy goes stale. See [`crate::task`].
//!
//! ## Back-pressure
//!
//! Each worker tracks tasks in flight. When configured with distinct
//! high/low water marks, `spawn` skips workers above the high mark and, when
//! every worker is saturated, waits until one drains below the low mark —
//! cooperatively from task context, on a condvar from foreign threads.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::queue::WorkQueue;
use crate::stack::{
    clear_current_task, current_task, in_task_context, set_current_task, yield_current,
    CoroutineHandle, CURRENT_YIELDER,
};
use crate::task::{Priority, Task, TaskDone, TaskId, TaskState, WaitToken, WakeReason};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler construction parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads; 0 means one per available CPU core.
    pub workers: u32,
    /// Back-pressure high water mark: a worker with this many tasks in
    /// flight stops accepting spawns.
    pub backoff_high: u32,
    /// Back-pressure low water mark: a backed-off worker dropping to this
    /// count notifies one blocked producer. Equal marks disable back-pressure.
    pub backoff_low: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            workers: 0,
            backoff_high: 1000,
            backoff_low: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// SpawnRequest
// ---------------------------------------------------------------------------

/// A request to start a new task; `Send`, so any worker may claim it.
/// The priority also lives on the control block, which is what the claiming
/// worker consults.
#[allow(dead_code)]
struct SpawnRequest {
    id: TaskId,
    entry: Box<dyn FnOnce() + Send + 'static>,
    priority: Priority,
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Handle returned by `spawn`; lets foreign threads wait for completion.
pub struct TaskHandle {
    id: TaskId,
    done: Arc<TaskDone>,
}

impl TaskHandle {
    /// Id of the spawned task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the calling OS thread until the task exits.
    ///
    /// Intended for threads outside the runtime (main, tests). From inside a
    /// task, wait on a primitive instead; this call would stall the worker.
    pub fn join(&self) {
        self.done.wait();
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.done.is_done()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

type TaskTable = RwLock<FxHashMap<TaskId, Arc<Mutex<Task>>>>;

/// The priority-aware M:N scheduler.
pub struct Scheduler {
    num_workers: usize,
    config: SchedulerConfig,

    /// Global injector for normal and low-priority spawn requests.
    injector: Injector<SpawnRequest>,

    /// High-priority spawn channel, checked first by all workers.
    high_tx: Sender<SpawnRequest>,
    high_rx: Receiver<SpawnRequest>,

    /// Stealers for each worker's local spawn deque.
    stealers: Vec<Stealer<SpawnRequest>>,

    /// Local spawn deques, taken by their threads at start.
    deques: Mutex<Vec<Option<Worker<SpawnRequest>>>>,

    /// Per-worker ready queues for resuming parked tasks.
    queues: Vec<Arc<WorkQueue>>,

    /// Control blocks of all live tasks.
    tasks: TaskTable,

    /// Count of live (spawned, not yet exited) tasks.
    active: AtomicU64,

    /// Per-worker tasks in flight, for back-pressure.
    busy: Vec<AtomicU32>,

    /// Round-robin spawn placement cursor.
    cursor: AtomicUsize,

    shutdown: AtomicBool,

    /// Producers blocked by back-pressure.
    producer_mx: Mutex<()>,
    producer_cv: Condvar,

    /// Foreign threads blocked in `wait_idle`.
    idle_mx: Mutex<()>,
    idle_cv: Condvar,

    reactor: OnceLock<Arc<crate::reactor::Reactor>>,
    worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with `config.workers` worker threads (0 = one per
    /// core). Workers are not started; call [`Scheduler::start`].
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let num_workers = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(usize::MAX);
            (config.workers as usize).min(cores).max(1)
        };

        let (high_tx, high_rx) = crossbeam_channel::unbounded();

        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        let mut queues = Vec::with_capacity(num_workers);
        let mut busy = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            deques.push(Some(w));
            queues.push(Arc::new(WorkQueue::new(i)));
            busy.push(AtomicU32::new(0));
        }

        Arc::new(Scheduler {
            num_workers,
            config,
            injector: Injector::new(),
            high_tx,
            high_rx,
            stealers,
            deques: Mutex::new(deques),
            queues,
            tasks: RwLock::new(FxHashMap::default()),
            active: AtomicU64::new(0),
            busy,
            cursor: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            producer_mx: Mutex::new(()),
            producer_cv: Condvar::new(),
            idle_mx: Mutex::new(()),
            idle_cv: Condvar::new(),
            reactor: OnceLock::new(),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Count of live tasks.
    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// True once [`Scheduler::stop`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Start the worker threads in the background.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.worker_handles.lock();
        if !handles.is_empty() {
            return;
        }

        for i in 0..self.num_workers {
            let local = self.deques.lock()[i].take().expect("worker deque consumed");
            let sched = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("strand-worker:{}", i))
                .spawn(move || worker_loop(sched, i, local))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Mark all queues inactive, stop the reactor, and join the workers.
    ///
    /// Parked tasks that never woke are dropped with their coroutines.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for q in &self.queues {
            q.deactivate();
        }
        if let Some(r) = self.reactor.get() {
            r.shutdown();
        }
        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }

    /// Block the calling OS thread until no live tasks remain.
    pub fn wait_idle(&self) {
        let mut guard = self.idle_mx.lock();
        while self.active.load(Ordering::SeqCst) != 0 {
            self.idle_cv
                .wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    // -----------------------------------------------------------------------
    // Spawning
    // -----------------------------------------------------------------------

    /// Spawn a task at normal priority.
    pub fn spawn(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.spawn_with(Priority::Normal, f)
    }

    /// Spawn a task at the given priority.
    ///
    /// Applies back-pressure: with distinct water marks configured, blocks
    /// (cooperatively from task context) while every worker is above the
    /// high mark.
    pub fn spawn_with(
        self: &Arc<Self>,
        priority: Priority,
        f: impl FnOnce() + Send + 'static,
    ) -> TaskHandle {
        let target = self.pick_worker();

        let id = TaskId::next();
        let mut task = Task::new(id, priority, target);
        let done = Arc::clone(&task.done);
        task.state = TaskState::Ready;
        self.tasks.write().insert(id, Arc::new(Mutex::new(task)));
        self.active.fetch_add(1, Ordering::SeqCst);
        self.busy[target].fetch_add(1, Ordering::SeqCst);

        let req = SpawnRequest {
            id,
            entry: Box::new(f),
            priority,
        };
        match priority {
            Priority::High => {
                let _ = self.high_tx.send(req);
            }
            _ => self.injector.push(req),
        }
        // Nudge the placement target; any idle peer can still steal first.
        self.queues[target].notify();

        TaskHandle { id, done }
    }

    fn backoff_enabled(&self) -> bool {
        self.config.backoff_low < self.config.backoff_high
    }

    /// Pick a placement worker, honoring back-pressure marks.
    fn pick_worker(&self) -> usize {
        loop {
            for _ in 0..self.num_workers {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.num_workers;
                if !self.backoff_enabled()
                    || self.busy[i].load(Ordering::Relaxed) < self.config.backoff_high
                {
                    return i;
                }
            }

            log::debug!("all workers in backoff, waiting for capacity");
            if in_task_context() {
                crate::yield_now();
            } else {
                let mut guard = self.producer_mx.lock();
                self.producer_cv
                    .wait_for(&mut guard, Duration::from_millis(10));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parking and waking
    // -----------------------------------------------------------------------

    /// Look up a live task's control block.
    pub(crate) fn task(&self, id: TaskId) -> Option<Arc<Mutex<Task>>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Park the current task.
    ///
    /// Mints a fresh wait token, publishes it through `prepare`, and yields.
    /// If `prepare` fails the park is rolled back (the token is invalidated
    /// by bumping the sequence) and the error returned without suspending.
    ///
    /// # Panics
    ///
    /// Panics when called outside task context.
    pub fn park_current<E>(
        &self,
        prepare: impl FnOnce(WaitToken) -> Result<(), E>,
    ) -> Result<WakeReason, E> {
        let id = current_task().expect("park_current called outside task context");
        let arc = self
            .task(id)
            .expect("current task missing from task table");

        let token = {
            let mut t = arc.lock();
            t.park_seq += 1;
            t.state = TaskState::Waiting;
            WaitToken {
                task: id,
                seq: t.park_seq,
            }
        };

        if let Err(e) = prepare(token) {
            let mut t = arc.lock();
            t.park_seq += 1;
            t.state = TaskState::Running;
            return Err(e);
        }

        yield_current();

        let reason = arc.lock().wake_reason;
        Ok(reason)
    }

    /// Wake the park identified by `token` with `reason`.
    ///
    /// Returns `true` if this call transitioned the task to ready; `false`
    /// when the token is stale (the park was already woken, timed out, or
    /// the task exited).
    pub fn wake(&self, token: WaitToken, reason: WakeReason) -> bool {
        let Some(arc) = self.task(token.task) else {
            return false;
        };
        let mut t = arc.lock();
        if t.park_seq != token.seq || t.state != TaskState::Waiting {
            return false;
        }
        t.state = TaskState::Ready;
        t.wake_reason = reason;
        let home = t.home_worker;
        let priority = t.priority;
        drop(t);

        self.queues[home].enqueue(token.task, priority);
        true
    }

    /// The reactor, started on first use.
    pub(crate) fn reactor(self: &Arc<Self>) -> Arc<crate::reactor::Reactor> {
        Arc::clone(self.reactor.get_or_init(|| {
            crate::reactor::Reactor::start(Arc::downgrade(self))
                .expect("failed to start reactor")
        }))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.num_workers)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Pin the calling thread to CPU `index` (Linux only).
fn set_affinity(index: usize) {
    #[cfg(target_os = "linux")]
    {
        let mut set = nix::sched::CpuSet::new();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if set.set(index % cores).is_ok() {
            if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
                log::debug!("worker {}: sched_setaffinity failed: {}", index, e);
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = index;
}

/// The main loop for each worker thread.
///
/// 1. Wait on the ready-queue semaphore (bounded, so shutdown and steals
///    make progress even without a token).
/// 2. Drain resumptions, highest priority first.
/// 3. Claim spawn requests: high channel, local deque, injector, steal.
/// 4. Stash yielded coroutines locally; re-enqueue voluntary yields.
fn worker_loop(sched: Arc<Scheduler>, index: usize, local: Worker<SpawnRequest>) {
    set_affinity(index);
    log::trace!("worker {} up", index);

    let mut suspended: FxHashMap<TaskId, CoroutineHandle> = FxHashMap::default();
    let queue = Arc::clone(&sched.queues[index]);

    loop {
        queue.wait(Duration::from_millis(10));
        if !queue.is_active() {
            log::trace!(
                "worker {} exiting ({} suspended dropped)",
                index,
                suspended.len()
            );
            return;
        }

        loop {
            let mut did_work = false;

            while let Some(id) = queue.try_dequeue() {
                did_work = true;
                run_resume(&sched, index, id, &mut suspended);
            }

            if let Some(req) = next_spawn(&sched, &local, index) {
                did_work = true;
                run_spawn(&sched, index, req, &mut suspended);
            }

            if !queue.is_active() {
                return;
            }
            if !did_work {
                break;
            }
        }
    }
}

/// Claim the next spawn request, in priority order:
/// high-priority channel, local deque, global injector, steal from peers.
fn next_spawn(
    sched: &Scheduler,
    local: &Worker<SpawnRequest>,
    index: usize,
) -> Option<SpawnRequest> {
    match sched.high_rx.try_recv() {
        Ok(req) => return Some(req),
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => {}
    }

    if let Some(req) = local.pop() {
        return Some(req);
    }

    loop {
        match sched.injector.steal_batch_and_pop(local) {
            Steal::Success(req) => return Some(req),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    for (i, stealer) in sched.stealers.iter().enumerate() {
        if i == index {
            continue;
        }
        loop {
            match stealer.steal() {
                Steal::Success(req) => return Some(req),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

/// First run of a freshly claimed spawn request: pin the task here, create
/// its coroutine, resume it.
fn run_spawn(
    sched: &Arc<Scheduler>,
    index: usize,
    req: SpawnRequest,
    suspended: &mut FxHashMap<TaskId, CoroutineHandle>,
) {
    let Some(arc) = sched.task(req.id) else {
        return;
    };
    {
        let mut t = arc.lock();
        t.home_worker = index;
        t.state = TaskState::Running;
    }

    let mut handle = CoroutineHandle::new(req.entry);

    set_current_task(req.id);
    let yielded = handle.resume();
    clear_current_task();
    CURRENT_YIELDER.with(|c| c.set(None));

    after_resume(sched, index, req.id, handle, yielded, suspended, &arc);
}

/// Resume a previously parked task owned by this worker.
fn run_resume(
    sched: &Arc<Scheduler>,
    index: usize,
    id: TaskId,
    suspended: &mut FxHashMap<TaskId, CoroutineHandle>,
) {
    let Some(mut handle) = suspended.remove(&id) else {
        // Stale resume entry for a task that already finished.
        return;
    };
    let Some(arc) = sched.task(id) else {
        return;
    };
    arc.lock().state = TaskState::Running;

    set_current_task(id);
    let yielded = handle.resume();
    clear_current_task();
    CURRENT_YIELDER.with(|c| c.set(None));

    after_resume(sched, index, id, handle, yielded, suspended, &arc);
}

/// Common post-resume bookkeeping.
fn after_resume(
    sched: &Arc<Scheduler>,
    index: usize,
    id: TaskId,
    handle: CoroutineHandle,
    yielded: bool,
    suspended: &mut FxHashMap<TaskId, CoroutineHandle>,
    arc: &Arc<Mutex<Task>>,
) {
    if !yielded {
        finish_task(sched, id, arc);
        return;
    }

    let requeue = {
        let mut t = arc.lock();
        match t.state {
            // Still Running after a yield means a cooperative yield_now:
            // back of its own queue at its priority.
            TaskState::Running => {
                t.state = TaskState::Ready;
                Some(t.priority)
            }
            // Parked (Waiting) or already woken again (Ready, resume entry
            // queued by the waker): just hold the coroutine.
            TaskState::Waiting | TaskState::Ready => None,
            TaskState::Exited => None,
        }
    };

    suspended.insert(id, handle);
    if let Some(priority) = requeue {
        sched.queues[index].enqueue(id, priority);
    }
}

/// Tear down an exited task: reclaim the control block, maintain counters,
/// release back-pressure, signal joiners.
fn finish_task(sched: &Arc<Scheduler>, id: TaskId, arc: &Arc<Mutex<Task>>) {
    let (done, placed) = {
        let mut t = arc.lock();
        t.state = TaskState::Exited;
        (Arc::clone(&t.done), t.placed_worker)
    };
    sched.tasks.write().remove(&id);

    let busy = sched.busy[placed].fetch_sub(1, Ordering::SeqCst) - 1;
    if sched.backoff_enabled() && busy <= sched.config.backoff_low {
        sched.producer_cv.notify_one();
    }

    let remaining = sched.active.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        sched.idle_cv.notify_all();
    }

    done.signal();
}

// ---------------------------------------------------------------------------
// Process-wide runtime handle
// ---------------------------------------------------------------------------

static GLOBAL_SCHEDULER: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// Initialize (or fetch) the process-wide scheduler and start its workers.
///
/// The first call fixes the worker count; later calls return the existing
/// instance regardless of `workers`.
pub fn init(workers: u32) -> Arc<Scheduler> {
    let sched = GLOBAL_SCHEDULER.get_or_init(|| {
        Scheduler::new(SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        })
    });
    sched.start();
    Arc::clone(sched)
}

/// The process-wide scheduler, if initialized.
pub fn current() -> Option<Arc<Scheduler>> {
    GLOBAL_SCHEDULER.get().cloned()
}

/// The process-wide scheduler; panics when the runtime is not initialized.
pub fn current_or_panic() -> Arc<Scheduler> {
    current().expect("strand runtime not initialized; call strand_rt::init() first")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn test_sched(workers: u32) -> Arc<Scheduler> {
        let sched = Scheduler::new(SchedulerConfig {
            workers,
            ..SchedulerConfig::default()
        });
        sched.start();
        sched
    }

    #[test]
    fn test_spawn_runs_to_completion() {
        let sched = test_sched(2);
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let handle = sched.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn test_spawn_many_all_complete() {
        let sched = test_sched(4);
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let c = Arc::clone(&counter);
                sched.spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        sched.stop();
    }

    #[test]
    fn test_yield_now_does_not_starve() {
        let sched = test_sched(2);
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        let c = Arc::clone(&counter);
        handles.push(sched.spawn(move || {
            for _ in 0..5 {
                crate::yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            handles.push(sched.spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        sched.stop();
    }

    #[test]
    fn test_priorities_all_complete() {
        let sched = test_sched(1);
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for p in [Priority::Low, Priority::High, Priority::Normal] {
            for _ in 0..3 {
                let c = Arc::clone(&counter);
                handles.push(sched.spawn_with(p, move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        for h in handles {
            h.join();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 9);
        sched.stop();
    }

    #[test]
    fn test_park_wake_roundtrip() {
        let sched = test_sched(2);
        let observed = Arc::new(Mutex::new(None));

        let token_slot: Arc<Mutex<Option<WaitToken>>> = Arc::new(Mutex::new(None));
        let ts = Arc::clone(&token_slot);
        let obs = Arc::clone(&observed);
        let s2 = Arc::clone(&sched);
        let handle = sched.spawn(move || {
            let reason = s2
                .park_current(|token| {
                    *ts.lock() = Some(token);
                    Ok::<(), ()>(())
                })
                .unwrap();
            *obs.lock() = Some(reason);
        });

        // Wait until the task has published its token, then wake it.
        let token = loop {
            if let Some(t) = *token_slot.lock() {
                break t;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        // The task may not have yielded yet; a wake is still correct because
        // state is already Waiting.
        assert!(sched.wake(token, WakeReason::Notified));
        handle.join();
        assert_eq!(*observed.lock(), Some(WakeReason::Notified));

        // A second wake with the same token must be stale.
        assert!(!sched.wake(token, WakeReason::Notified));
        sched.stop();
    }

    #[test]
    fn test_wake_stale_token_ignored() {
        let sched = test_sched(1);
        let token = WaitToken {
            task: TaskId::next(),
            seq: 1,
        };
        assert!(!sched.wake(token, WakeReason::Notified));
        sched.stop();
    }

    #[test]
    fn test_park_rollback_on_prepare_error() {
        let sched = test_sched(1);
        let s2 = Arc::clone(&sched);
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = Arc::clone(&ok);
        let handle = sched.spawn(move || {
            let err = s2.park_current(|_token| Err::<(), &str>("nope")).unwrap_err();
            assert_eq!(err, "nope");
            ok2.store(true, Ordering::SeqCst);
        });
        handle.join();
        assert!(ok.load(Ordering::SeqCst));
        sched.stop();
    }

    #[test]
    fn test_wait_idle() {
        let sched = test_sched(2);
        for _ in 0..20 {
            sched.spawn(|| {
                crate::yield_now();
            });
        }
        sched.wait_idle();
        assert_eq!(sched.active_count(), 0);
        sched.stop();
    }

    #[test]
    fn test_spawn_from_task() {
        let sched = test_sched(2);
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let s2 = Arc::clone(&sched);
        let outer = sched.spawn(move || {
            for _ in 0..10 {
                let c = Arc::clone(&c);
                s2.spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        outer.join();
        sched.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        sched.stop();
    }
}
