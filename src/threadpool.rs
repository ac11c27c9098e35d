//! The pool supervisor: owns the queue and the worker registry.

use std::cmp;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::any_value::AnyValue;
use crate::handle::TaskHandle;
use crate::queue::{QueueError, TaskQueue};
use crate::task::{Envelope, Task};
use crate::worker::{self, Worker};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a submission may wait on a full queue before it is rejected.
const SUBMIT_WAIT: Duration = Duration::from_secs(1);

/// Errors surfaced by pool lifecycle operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The worker registry mutex was poisoned by a panicking holder.
    #[error("unable to acquire lock on worker registry")]
    LockError,

    /// The operating system refused a worker thread.
    #[error("unable to launch worker thread: {0}")]
    LaunchFailed(io::Error),

    /// The task queue failed underneath the pool.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Sizing policy for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolMode {
    /// The worker count chosen at start is final.
    #[default]
    Fixed,

    /// The pool may grow on demand up to a maximum, and workers idle past
    /// the idle timeout retire back down to the initial count.
    Elastic,
}

fn default_max_workers(initial: usize) -> usize {
    cmp::max(8, 2 * initial)
}

/// State shared between the supervisor and its workers, frozen at start.
pub(crate) struct Shared {
    pub(crate) queue: TaskQueue<Envelope>,

    /// Live workers by id. Worker-count bookkeeping happens under this lock;
    /// `current` is atomic only so it can be read without taking it.
    registry: Mutex<HashMap<u64, Worker>>,

    /// Signalled whenever a worker deregisters itself; shutdown waits here
    /// for the registry to drain.
    exit: Condvar,

    running: AtomicBool,
    current: AtomicUsize,
    next_id: AtomicU64,

    pub(crate) mode: PoolMode,
    pub(crate) idle_timeout: Duration,
    initial: usize,
    max_workers: usize,
}

impl Shared {
    /// Registers and launches one worker. The caller holds the registry lock;
    /// the record goes in before the thread comes up so a worker can always
    /// find itself in the registry.
    fn spawn_worker(self: &Arc<Self>, registry: &mut HashMap<u64, Worker>) -> Result<(), PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        registry.insert(id, Worker::new(id));
        self.current.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = worker::launch(Arc::clone(self), id) {
            registry.remove(&id);
            self.current.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::LaunchFailed(e));
        }

        Ok(())
    }

    /// One elastic scale-up step: at most one new worker, and only while the
    /// queue backlog exceeds the number of idle workers. Backlog and idle
    /// count come from one queue snapshot, so the pair actually coexisted.
    fn scale_up(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.mode != PoolMode::Elastic || !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (backlog, idle) = self.queue.backlog();
        if backlog <= idle {
            return Ok(());
        }

        let mut registry = self.registry.lock().or(Err(PoolError::LockError))?;

        if self.current.load(Ordering::SeqCst) >= self.max_workers {
            return Ok(());
        }

        self.spawn_worker(&mut registry)?;
        log::debug!(
            "scaled up to {} workers on backlog of {}",
            self.current.load(Ordering::SeqCst),
            backlog
        );

        Ok(())
    }

    /// Retires an idle worker, refusing to drop the pool below its initial
    /// size. The floor check and the decrement share the registry lock, so
    /// two workers cannot retire past the floor together.
    pub(crate) fn try_retire(&self, id: u64) -> Result<bool, PoolError> {
        let mut registry = self.registry.lock().or(Err(PoolError::LockError))?;

        if self.current.load(Ordering::SeqCst) <= self.initial {
            return Ok(false);
        }

        registry.remove(&id);
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.exit.notify_all();

        Ok(true)
    }

    /// Removes a worker that observed the closed queue.
    pub(crate) fn deregister(&self, id: u64) -> Result<(), PoolError> {
        let mut registry = self.registry.lock().or(Err(PoolError::LockError))?;

        registry.remove(&id);
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.exit.notify_all();

        Ok(())
    }
}

/// A worker pool over a bounded task queue.
///
/// Configuration calls are honored until [`ThreadPool::start`] and silently
/// ignored afterwards. Dropping the pool shuts it down; see
/// [`ThreadPool::shutdown`].
///
/// ```
/// use tidepool::threadpool::ThreadPool;
///
/// let mut pool = ThreadPool::new();
/// pool.start(4).unwrap();
///
/// let task = pool.submit(|| (0..10u32).sum::<u32>());
///
/// assert_eq!(task.join(), Ok(45));
/// ```
pub struct ThreadPool {
    mode: PoolMode,
    queue_capacity: usize,
    max_workers: Option<usize>,
    idle_timeout: Duration,

    shared: Option<Arc<Shared>>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        ThreadPool::new()
    }
}

impl ThreadPool {
    /// A pool in `Fixed` mode with a queue capacity of 1024 and an idle
    /// timeout of 60 seconds, not yet started.
    pub fn new() -> Self {
        ThreadPool {
            mode: PoolMode::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_workers: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shared: None,
        }
    }

    /// Selects the sizing mode. Ignored once the pool has started.
    pub fn set_mode(&mut self, mode: PoolMode) {
        if self.started("set_mode") {
            return;
        }
        self.mode = mode;
    }

    /// Bounds the task queue. Ignored once the pool has started.
    pub fn set_queue_capacity(&mut self, capacity: usize) {
        if self.started("set_queue_capacity") {
            return;
        }
        self.queue_capacity = cmp::max(1, capacity);
    }

    /// Caps elastic growth. Ignored in `Fixed` mode and once the pool has
    /// started. Defaults to `max(8, 2 × initial)`, never below `initial`.
    pub fn set_max_workers(&mut self, max_workers: usize) {
        if self.started("set_max_workers") {
            return;
        }
        if self.mode != PoolMode::Elastic {
            log::debug!("set_max_workers ignored outside Elastic mode");
            return;
        }
        self.max_workers = Some(cmp::max(1, max_workers));
    }

    /// Sets how long an elastic worker may idle before retiring. Ignored
    /// once the pool has started.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        if self.started("set_idle_timeout") {
            return;
        }
        self.idle_timeout = idle_timeout;
    }

    fn started(&self, op: &str) -> bool {
        if self.shared.is_some() {
            log::debug!("{} ignored: pool already started", op);
            return true;
        }
        false
    }

    /// Starts the pool with `initial` workers (clamped to at least one).
    /// Configuration is frozen here. A second start is ignored.
    pub fn start(&mut self, initial: usize) -> Result<(), PoolError> {
        if self.started("start") {
            return Ok(());
        }

        let initial = cmp::max(1, initial);
        let max_workers = match self.mode {
            PoolMode::Fixed => initial,
            PoolMode::Elastic => cmp::max(
                self.max_workers.unwrap_or_else(|| default_max_workers(initial)),
                initial,
            ),
        };

        let shared = Arc::new(Shared {
            queue: TaskQueue::with_capacity(self.queue_capacity),
            registry: Mutex::new(HashMap::new()),
            exit: Condvar::new(),
            running: AtomicBool::new(true),
            current: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            mode: self.mode,
            idle_timeout: self.idle_timeout,
            initial,
            max_workers,
        });

        {
            let mut registry = shared.registry.lock().or(Err(PoolError::LockError))?;
            for _ in 0..initial {
                if let Err(e) = shared.spawn_worker(&mut registry) {
                    // Wind down whatever came up; the pool stays unstarted.
                    drop(registry);
                    shared.running.store(false, Ordering::SeqCst);
                    let _ = shared.queue.close();
                    return Err(e);
                }
            }
        }

        log::info!("pool started with {} workers in {:?} mode", initial, self.mode);
        self.shared = Some(shared);

        Ok(())
    }

    /// Starts the pool with one worker per hardware execution context.
    pub fn start_default(&mut self) -> Result<(), PoolError> {
        self.start(num_cpus::get())
    }

    /// Submits a callable and returns the handle to its result.
    ///
    /// Waits at most one second for queue room; past that deadline the
    /// submission is rejected and the returned handle is already signalled.
    /// Submitting to a pool that is not running is likewise a rejection.
    pub fn submit<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let Some(shared) = self.shared.as_ref() else {
            log::warn!("submission to a pool that was never started, rejecting");
            return TaskHandle::rejected();
        };

        let (envelope, handle) = Envelope::new(task);

        match shared.queue.push_timeout(envelope, SUBMIT_WAIT) {
            Ok(()) => {
                if let Err(e) = shared.scale_up() {
                    log::error!("elastic scale-up failed: {}", e);
                }
                handle
            }
            Err((envelope, reason)) => {
                log::warn!("rejecting submission: {}", reason);
                envelope.reject();
                handle
            }
        }
    }

    /// Submits a [`Task`] object; its dynamically typed result is retrieved
    /// from the handle with a type witness.
    pub fn submit_task(&self, mut task: Box<dyn Task>) -> TaskHandle<AnyValue> {
        self.submit(move || task.run())
    }

    /// Fire-and-forget submission: no result slot is allocated and the
    /// task's value is discarded. Returns whether the task was accepted.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = self.shared.as_ref() else {
            return false;
        };

        match shared.queue.push_timeout(Envelope::detached(task), SUBMIT_WAIT) {
            Ok(()) => {
                if let Err(e) = shared.scale_up() {
                    log::error!("elastic scale-up failed: {}", e);
                }
                true
            }
            Err((_, reason)) => {
                log::warn!("dropping detached task: {}", reason);
                false
            }
        }
    }

    /// Shuts the pool down: closes the queue, signals every still-queued
    /// task's handle as cancelled, and blocks until the last worker has
    /// deregistered itself. Idempotent; also run by `Drop`.
    pub fn shutdown(&mut self) -> Result<(), PoolError> {
        let Some(shared) = self.shared.as_ref() else {
            return Ok(());
        };

        if !shared.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let abandoned = shared.queue.close()?;
        if !abandoned.is_empty() {
            log::warn!("cancelling {} tasks still queued at shutdown", abandoned.len());
        }
        for envelope in abandoned {
            envelope.cancel();
        }

        let mut registry = shared.registry.lock().or(Err(PoolError::LockError))?;
        while !registry.is_empty() {
            registry = shared.exit.wait(registry).or(Err(PoolError::LockError))?;
        }

        log::info!("pool shut down");

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// The mode the pool operates in; frozen once started.
    pub fn mode(&self) -> PoolMode {
        self.shared
            .as_ref()
            .map(|shared| shared.mode)
            .unwrap_or(self.mode)
    }

    /// Number of live workers.
    pub fn current_workers(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.current.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of workers currently waiting for a task.
    pub fn idle_workers(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.queue.waiting())
            .unwrap_or(0)
    }

    /// Number of tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.queue.len())
            .unwrap_or(0)
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.queue.capacity())
            .unwrap_or(self.queue_capacity)
    }
}

impl Drop for ThreadPool {
    /// Invokes shutdown()
    fn drop(&mut self) {
        self.shutdown().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use crossbeam::sync::WaitGroup;

    use super::{PoolMode, ThreadPool};
    use crate::any_value::AnyValue;
    use crate::handle::TaskError;
    use crate::task::Task;

    #[test]
    fn fixed_pool_computes_disjoint_partial_sums() {
        let mut pool = ThreadPool::new();
        pool.start(4).unwrap();

        let handles: Vec<_> = (0..100u64)
            .map(|i| {
                let (begin, end) = (i * 10, (i + 1) * 10);
                pool.submit(move || (begin..end).sum::<u64>())
            })
            .collect();

        let total: u64 = handles.into_iter().map(|handle| handle.get()).sum();

        assert_eq!(total, 499_500);
        assert_eq!(pool.current_workers(), 4);
    }

    #[test]
    fn single_submitter_tasks_run_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut pool = ThreadPool::new();
        pool.start(1).unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || order.lock().unwrap().push(i))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn elastic_pool_scales_up_under_load() {
        let mut pool = ThreadPool::new();
        pool.set_mode(PoolMode::Elastic);
        pool.set_max_workers(8);
        pool.start(2).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(500));
                    i
                })
            })
            .collect();

        let mut peak = 0;
        for _ in 0..50 {
            peak = peak.max(pool.current_workers());
            thread::sleep(Duration::from_millis(10));
        }

        let mut results: Vec<i32> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        results.sort_unstable();

        assert_eq!(results, (0..16).collect::<Vec<_>>());
        assert!(peak >= 3, "pool never grew past its initial size");
        assert!(peak <= 8, "pool grew past its maximum: {}", peak);
    }

    #[test]
    fn saturated_queue_rejects_submissions() {
        let mut pool = ThreadPool::new();
        pool.set_queue_capacity(2);
        pool.start(1).unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_secs(2));
                    i
                })
            })
            .collect();

        let mut accepted = Vec::new();
        let mut rejected = 0;

        for handle in handles {
            match handle.join() {
                Ok(i) => accepted.push(i),
                Err(TaskError::Rejected) => rejected += 1,
                Err(e) => panic!("unexpected task failure: {}", e),
            }
        }

        assert_eq!(accepted.len() + rejected, 10);
        assert!(rejected >= 4, "only {} submissions were rejected", rejected);
        // The first task plus the two queued behind it always make it through.
        assert!(accepted.len() >= 3, "only {:?} were accepted", accepted);
    }

    #[test]
    fn elastic_pool_reclaims_idle_workers() {
        let mut pool = ThreadPool::new();
        pool.set_mode(PoolMode::Elastic);
        pool.set_max_workers(8);
        pool.set_idle_timeout(Duration::from_millis(200));
        pool.start(2).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(300));
                    i
                })
            })
            .collect();

        assert!(
            pool.current_workers() > 2,
            "burst did not grow the pool: {} workers",
            pool.current_workers()
        );

        for handle in handles {
            handle.join().unwrap();
        }

        // Reclamation happens on the next idle poll tick after the timeout.
        thread::sleep(Duration::from_secs(3));

        assert_eq!(pool.current_workers(), 2);
    }

    struct StoreAnswer;

    impl Task for StoreAnswer {
        fn run(&mut self) -> AnyValue {
            AnyValue::new(42i32)
        }
    }

    #[test]
    fn dynamic_results_require_the_right_witness() {
        let mut pool = ThreadPool::new();
        pool.start(1).unwrap();

        let wrong = pool.submit_task(Box::new(StoreAnswer));
        assert!(wrong.get().downcast::<String>().is_err());

        let right = pool.submit_task(Box::new(StoreAnswer));
        assert_eq!(right.get().downcast::<i32>().unwrap(), 42);
    }

    #[test]
    fn drop_waits_for_workers_and_cancels_queued_tasks() {
        let executed = Arc::new(AtomicUsize::new(0));

        let mut pool = ThreadPool::new();
        pool.start(4).unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let executed = Arc::clone(&executed);
                pool.submit(move || {
                    executed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        drop(pool);

        let mut completed = 0;
        let mut cancelled = 0;

        for handle in handles {
            match handle.join() {
                Ok(()) => completed += 1,
                Err(TaskError::Cancelled) => cancelled += 1,
                Err(e) => panic!("unexpected task failure: {}", e),
            }
        }

        assert_eq!(completed + cancelled, 20);
        assert_eq!(executed.load(Ordering::SeqCst), completed);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut pool = ThreadPool::new();
        pool.start(2).unwrap();

        pool.shutdown().unwrap();
        assert!(!pool.is_running());
        assert_eq!(pool.current_workers(), 0);

        pool.shutdown().unwrap();
        assert_eq!(pool.current_workers(), 0);
    }

    #[test]
    fn configuration_after_start_is_ignored() {
        let mut pool = ThreadPool::new();
        pool.set_queue_capacity(4);
        pool.start(1).unwrap();

        pool.set_mode(PoolMode::Elastic);
        pool.set_queue_capacity(64);
        pool.set_idle_timeout(Duration::from_millis(1));

        assert_eq!(pool.mode(), PoolMode::Fixed);
        assert_eq!(pool.queue_capacity(), 4);
    }

    #[test]
    fn submissions_to_an_unstarted_pool_are_rejected() {
        let pool = ThreadPool::new();

        assert_eq!(pool.submit(|| 1).join(), Err(TaskError::Rejected));
        assert!(!pool.spawn(|| {}));
    }

    #[test]
    fn panicking_tasks_do_not_kill_workers() {
        let value = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new();

        let mut pool = ThreadPool::new();
        pool.start(2).unwrap();

        for i in 0..8 {
            let wg = wg.clone();
            let value = Arc::clone(&value);
            pool.spawn(move || {
                if i % 2 == 0 {
                    drop(wg);
                    panic_control::disable_hook_in_current_thread();
                    panic!("expected failure");
                }
                value.fetch_add(1, Ordering::SeqCst);
                drop(wg);
            });
        }

        wg.wait();

        assert_eq!(value.load(Ordering::SeqCst), 4);
        assert_eq!(pool.current_workers(), 2);
    }

    #[test]
    fn start_default_matches_hardware_parallelism() {
        let mut pool = ThreadPool::new();
        pool.start_default().unwrap();

        assert_eq!(pool.current_workers(), num_cpus::get());
    }
}
