//! Bounded worker pools and the periodic scheduler.
//!
//! [`Executors`] is the process-wide handle: create it once at startup, pass
//! it (as `Arc<Executors>`) to everything that needs to schedule work, and
//! call [`Executors::shutdown`] explicitly when done.

use std::collections::BinaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::{ExecutorsConfig, OverflowPolicy, PoolConfig};
use crate::error::{Error, Result};
use crate::metrics;

/// Idle time after which threads above `core_threads` exit.
const KEEP_ALIVE: Duration = Duration::from_secs(30);

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    name: &'static str,
    config: PoolConfig,
    sender: RwLock<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    threads: AtomicUsize,
    next_thread_id: AtomicUsize,
    shutdown: AtomicBool,
}

/// A bounded worker pool.
///
/// Starts `core_threads` workers; when the queue is full it grows up to
/// `max_threads`, then applies the configured [`OverflowPolicy`].
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &self.threads())
            .field("queued", &self.queued())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool and start its core threads.
    pub fn new(name: &'static str, config: PoolConfig) -> Result<Self> {
        let (sender, receiver) = bounded(config.queue_depth);
        let pool = Self {
            inner: Arc::new(PoolInner {
                name,
                config,
                sender: RwLock::new(Some(sender)),
                receiver,
                threads: AtomicUsize::new(0),
                next_thread_id: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };

        for _ in 0..pool.inner.config.core_threads {
            pool.inner.threads.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = spawn_worker(&pool.inner, None) {
                pool.inner.threads.fetch_sub(1, Ordering::SeqCst);
                pool.shutdown();
                return Err(e.into());
            }
        }

        debug!(
            pool = name,
            core = pool.inner.config.core_threads,
            max = pool.inner.config.max_threads,
            queue = pool.inner.config.queue_depth,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Pool name, as used in logs and metrics.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Submit a task.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(Error::Rejected(self.inner.name));
        };

        let task: Task = match sender.try_send(Box::new(task)) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(_)) => return Err(Error::Rejected(self.inner.name)),
            Err(TrySendError::Full(task)) => task,
        };
        drop(guard);

        if self.try_reserve_thread() {
            if let Err(e) = spawn_worker(&self.inner, Some(task)) {
                self.inner.threads.fetch_sub(1, Ordering::SeqCst);
                warn!(pool = self.inner.name, error = %e, "failed to grow pool");
                return Err(Error::Rejected(self.inner.name));
            }
            return Ok(());
        }

        match self.inner.config.overflow {
            OverflowPolicy::Reject => {
                metrics::record_rejected_task(self.inner.name);
                warn!(
                    pool = self.inner.name,
                    queue = self.inner.config.queue_depth,
                    "pool saturated, task rejected"
                );
                Err(Error::Rejected(self.inner.name))
            }
            OverflowPolicy::RunUnpooled => {
                trace!(pool = self.inner.name, "pool saturated, running task unpooled");
                thread::Builder::new()
                    .name(format!("{}-unpooled", self.inner.name))
                    .spawn(move || run_task(task))
                    .map(|_| ())
                    .map_err(|e| {
                        warn!(pool = self.inner.name, error = %e, "failed to spawn unpooled thread");
                        Error::Rejected(self.inner.name)
                    })
            }
        }
    }

    fn try_reserve_thread(&self) -> bool {
        self.inner
            .threads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.inner.config.max_threads).then_some(n + 1)
            })
            .is_ok()
    }

    /// Number of live pooled threads.
    pub fn threads(&self) -> usize {
        self.inner.threads.load(Ordering::SeqCst)
    }

    /// Number of queued tasks.
    pub fn queued(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Whether the pool still accepts work.
    pub fn is_operational(&self) -> bool {
        !self.inner.shutdown.load(Ordering::SeqCst) && self.threads() > 0
    }

    /// Stop accepting work. Queued tasks still run; workers exit once the
    /// queue drains.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sender.write().take();
        debug!(pool = self.inner.name, "worker pool shut down");
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, first: Option<Task>) -> std::io::Result<()> {
    let id = inner.next_thread_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(inner);
    thread::Builder::new()
        .name(format!("{}-{}", inner.name, id))
        .spawn(move || worker_loop(inner, first))
        .map(|_| ())
}

fn worker_loop(inner: Arc<PoolInner>, mut first: Option<Task>) {
    apply_priority(inner.config.priority);

    loop {
        if let Some(task) = first.take() {
            run_task(task);
            continue;
        }

        match inner.receiver.recv_timeout(KEEP_ALIVE) {
            Ok(task) => run_task(task),
            Err(RecvTimeoutError::Timeout) => {
                let core = inner.config.core_threads;
                let retired = inner
                    .threads
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n > core).then(|| n - 1)
                    })
                    .is_ok();
                if retired {
                    trace!(pool = inner.name, "idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.threads.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(
            thread = thread::current().name().unwrap_or("<unnamed>"),
            "task panicked"
        );
    }
}

#[cfg(target_os = "linux")]
fn apply_priority(nice: i32) {
    if nice == 0 {
        return;
    }
    // SAFETY: gettid has no preconditions; setpriority on our own tid only
    // affects the calling thread.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if rc != 0 {
        debug!(
            nice,
            error = %std::io::Error::last_os_error(),
            "failed to set thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(nice: i32) {
    if nice != 0 {
        trace!(nice, "thread priority not supported on this platform");
    }
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    /// Stop future runs. A run already in progress completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    period: Option<Duration>,
    task: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<Entry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    pool: WorkerPool,
}

/// Timer thread that hands due tasks to its own worker pool.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler whose tasks run on a pool sized by `config`.
    pub fn new(name: &'static str, config: PoolConfig) -> Result<Self> {
        let pool = WorkerPool::new(name, config)?;
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            pool,
        });

        let timer_inner = Arc::clone(&inner);
        let timer = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || timer_loop(timer_inner))?;

        Ok(Self {
            inner,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let once = Mutex::new(Some(task));
        self.push(delay, None, move || {
            if let Some(task) = once.lock().take() {
                task();
            }
        })
    }

    /// Run `task` every `period`, first after `initial_delay`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(initial_delay, Some(period), task)
    }

    fn push<F>(&self, delay: Duration, period: Option<Duration>, task: F) -> Result<ScheduledHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Rejected("scheduled"));
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            period,
            task: Arc::new(task),
            cancelled: Arc::clone(&cancelled),
        };
        self.inner.queue.lock().push(entry);
        self.inner.wakeup.notify_one();
        Ok(ScheduledHandle { cancelled })
    }

    /// Whether the timer thread and its pool are running.
    pub fn is_operational(&self) -> bool {
        !self.inner.shutdown.load(Ordering::SeqCst) && self.inner.pool.is_operational()
    }

    /// Stop the timer thread and the pool. Pending tasks are discarded.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.timer.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.pool.shutdown();
    }
}

fn timer_loop(inner: Arc<SchedulerInner>) {
    let mut queue = inner.queue.lock();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        let next_due = queue.peek().map(|e| e.due);
        match next_due {
            None => {
                inner.wakeup.wait(&mut queue);
            }
            Some(due) if due > now => {
                inner.wakeup.wait_until(&mut queue, due);
            }
            Some(_) => {
                let Some(mut entry) = queue.pop() else {
                    continue;
                };
                if entry.cancelled.load(Ordering::SeqCst) {
                    continue;
                }

                let task = Arc::clone(&entry.task);
                let cancelled = Arc::clone(&entry.cancelled);
                if let Err(e) = inner.pool.execute(move || {
                    if !cancelled.load(Ordering::SeqCst) {
                        task();
                    }
                }) {
                    warn!(error = %e, "scheduled task dropped");
                }

                if let Some(period) = entry.period {
                    entry.due += period;
                    if entry.due < now {
                        entry.due = now + period;
                    }
                    queue.push(entry);
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-wide executor handle: network dispatch, general work, scheduling.
pub struct Executors {
    network: WorkerPool,
    general: WorkerPool,
    scheduler: Scheduler,
}

impl Executors {
    /// Create all three pools.
    pub fn new(config: &ExecutorsConfig) -> Result<Arc<Self>> {
        let network = WorkerPool::new("mdns-net", config.network.clone())?;
        let general = WorkerPool::new("mdns-exec", config.general.clone())?;
        let scheduler = Scheduler::new("mdns-sched", config.scheduled.clone())?;
        Ok(Arc::new(Self {
            network,
            general,
            scheduler,
        }))
    }

    /// Pool used to dispatch received packets.
    pub fn network(&self) -> &WorkerPool {
        &self.network
    }

    /// Pool for general asynchronous work.
    pub fn general(&self) -> &WorkerPool {
        &self.general
    }

    /// Periodic task scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Whether every pool is still accepting work.
    pub fn is_operational(&self) -> bool {
        self.network.is_operational()
            && self.general.is_operational()
            && self.scheduler.is_operational()
    }

    /// Shut all pools down.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.network.shutdown();
        self.general.shutdown();
    }
}

impl Drop for Executors {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn pool_config(core: usize, max: usize, queue: usize, overflow: OverflowPolicy) -> PoolConfig {
        PoolConfig {
            core_threads: core,
            max_threads: max,
            queue_depth: queue,
            priority: 0,
            overflow,
        }
    }

    #[test]
    fn test_execute_runs_tasks() {
        let pool = WorkerPool::new("test", pool_config(2, 2, 16, OverflowPolicy::Reject)).unwrap();
        let (tx, rx) = unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_reject_when_saturated() {
        let pool = WorkerPool::new("test", pool_config(1, 1, 1, OverflowPolicy::Reject)).unwrap();
        let (block_tx, block_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fills the queue.
        pool.execute(|| {}).unwrap();
        // No room, no growth.
        assert!(matches!(pool.execute(|| {}), Err(Error::Rejected("test"))));

        drop(block_tx);
        pool.shutdown();
    }

    #[test]
    fn test_run_unpooled_when_saturated() {
        let pool =
            WorkerPool::new("test", pool_config(1, 1, 1, OverflowPolicy::RunUnpooled)).unwrap();
        let (block_tx, block_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        pool.execute(move || {
            started_tx.send(()).unwrap();
            let _ = block_rx.recv();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.execute(|| {}).unwrap();

        let (tx, rx) = bounded(1);
        pool.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        drop(block_tx);
        pool.shutdown();
    }

    #[test]
    fn test_grows_to_max_threads() {
        let pool = WorkerPool::new("test", pool_config(1, 3, 1, OverflowPolicy::Reject)).unwrap();
        let (block_tx, block_rx) = unbounded::<()>();
        let (started_tx, started_rx) = unbounded::<()>();

        let blocking = || {
            let block_rx = block_rx.clone();
            let started_tx = started_tx.clone();
            move || {
                started_tx.send(()).unwrap();
                let _ = block_rx.recv();
            }
        };

        pool.execute(blocking()).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Queued behind the busy core thread, then two threads are added.
        for _ in 0..3 {
            pool.execute(blocking()).unwrap();
        }
        for _ in 0..2 {
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(pool.threads(), 3);
        assert_eq!(pool.queued(), 1);
        assert!(pool.execute(|| {}).is_err());

        drop(block_tx);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_rejects() {
        let pool = WorkerPool::new("test", pool_config(1, 1, 4, OverflowPolicy::Reject)).unwrap();
        pool.shutdown();
        assert!(pool.execute(|| {}).is_err());
        assert!(!pool.is_operational());
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = WorkerPool::new("test", pool_config(1, 1, 4, OverflowPolicy::Reject)).unwrap();
        pool.execute(|| panic!("task failure")).unwrap();
        let (tx, rx) = bounded(1);
        pool.execute(move || tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_scheduler_fixed_rate_and_cancel() {
        let scheduler =
            Scheduler::new("sched", pool_config(1, 1, 8, OverflowPolicy::Reject)).unwrap();
        let (tx, rx) = unbounded();
        let handle = scheduler
            .schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(20), move || {
                let _ = tx.send(());
            })
            .unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        handle.cancel();
        thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
        scheduler.shutdown();
    }

    #[test]
    fn test_scheduler_one_shot_delay() {
        let scheduler =
            Scheduler::new("sched", pool_config(1, 1, 8, OverflowPolicy::Reject)).unwrap();
        let (tx, rx) = bounded(1);
        let start = Instant::now();
        scheduler
            .schedule(Duration::from_millis(50), move || tx.send(()).unwrap())
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        scheduler.shutdown();
        assert!(!scheduler.is_operational());
    }
}
