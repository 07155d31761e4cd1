//! Multi-worker event loop
//!
//! An [`EventLoop`] owns a fixed pool of worker threads that consume a
//! bounded task queue, plus two ticker threads:
//!
//! - the microtask ticker drains a side buffer of high-priority work
//!   (continuations registered with `then`/`catch` land here) every
//!   millisecond;
//! - the timer ticker scans the registered [`Timer`]s every ten
//!   milliseconds and schedules the ones that are due.
//!
//! Task bodies that panic are caught per task and recorded as failures; the
//! worker keeps running.

mod promise;
mod timer;

pub use promise::{global, spawn, Future, Promise, Resolver};
pub use timer::Timer;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{TaskError, TaskResult};
use crate::runtime::scheduler::task::{Executor, Runnable, Task, TaskId, TaskState};

/// Capacity of the ordinary task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Event loop configuration.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Bound of the task queue; `schedule` blocks while it is full.
    pub queue_capacity: usize,
    /// Microtask drain period.
    pub microtask_interval: Duration,
    /// Timer scan period.
    pub timer_interval: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            microtask_interval: Duration::from_millis(1),
            timer_interval: Duration::from_millis(10),
        }
    }
}

impl EventLoopConfig {
    /// Default configuration with `workers` worker threads (at least one).
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..Self::default()
        }
    }
}

/// Lifecycle of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Created, not started yet.
    Idle,
    Running,
    /// Stopped for good; a stopped loop cannot be restarted.
    Stopped,
}

/// Snapshot of event loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventLoopStats {
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub microtasks_queued: u64,
    pub timers_scheduled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    microtasks: AtomicU64,
    timers: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the terminal state a task ended in.
    fn record(
        &self,
        state: TaskState,
    ) {
        match state {
            TaskState::Completed => Self::bump(&self.completed),
            TaskState::Failed => Self::bump(&self.failed),
            TaskState::Cancelled => Self::bump(&self.cancelled),
            TaskState::Pending | TaskState::Running => {}
        }
    }
}

struct Shared {
    me: Weak<Shared>,
    config: EventLoopConfig,
    state: RwLock<LoopState>,
    stop: CancellationToken,
    queue_tx: Sender<Arc<dyn Runnable>>,
    queue_rx: Receiver<Arc<dyn Runnable>>,
    active: Mutex<HashMap<TaskId, Arc<dyn Runnable>>>,
    microtasks: Mutex<Vec<Arc<dyn Runnable>>>,
    timers: Mutex<Vec<Timer>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

impl Shared {
    fn executor(&self) -> Weak<dyn Executor> {
        self.me.clone()
    }

    /// Push onto the task queue. The caller holds the state read lock and
    /// has checked that the loop is running.
    fn enqueue(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError> {
        let id = task.id();
        task.bind(self.executor());
        self.active.lock().insert(id, task.clone());
        Counters::bump(&self.counters.scheduled);

        crossbeam::select! {
            send(self.queue_tx, task) -> sent => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.active.lock().remove(&id);
                    Err(TaskError::Stopped)
                }
            },
            recv(self.stop.done()) -> _ => {
                self.active.lock().remove(&id);
                Err(TaskError::Stopped)
            }
        }
    }

    fn submit(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError> {
        let state = self.state.read();
        if *state != LoopState::Running {
            return Err(TaskError::NotRunning);
        }
        self.enqueue(task)
    }

    fn push_microtask(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError> {
        let state = self.state.read();
        if *state == LoopState::Stopped {
            return Err(TaskError::Stopped);
        }
        task.bind(self.executor());
        self.active.lock().insert(task.id(), task.clone());
        self.microtasks.lock().push(task);
        Counters::bump(&self.counters.microtasks);
        Ok(())
    }

    fn run_task(
        &self,
        task: Arc<dyn Runnable>,
    ) {
        task.run();
        self.active.lock().remove(&task.id());
        self.counters.record(task.state());
    }

    fn drain_microtasks(&self) {
        let batch = std::mem::take(&mut *self.microtasks.lock());
        for task in batch {
            self.run_task(task);
        }
    }

    fn process_timers(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.timers.lock().retain(|timer| match timer.poll(now) {
            timer::Poll::Pending => true,
            timer::Poll::Fire { task, keep } => {
                trace!(timer = timer.id(), task = %task.id(), "timer fired");
                due.push(task);
                keep
            }
            timer::Poll::Expired => false,
        });

        for task in due {
            if let Err(err) = self.submit(task.clone()) {
                debug!(task = %task.id(), error = %err, "timer task not scheduled");
                task.fail(err);
            }
        }
    }

    fn register_timer(
        &self,
        timer: &Timer,
    ) {
        let state = self.state.read();
        if *state == LoopState::Stopped {
            timer.cancel();
            return;
        }
        self.timers.lock().push(timer.clone());
        Counters::bump(&self.counters.timers);
    }
}

impl Executor for Shared {
    fn submit_continuation(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError> {
        self.push_microtask(task)
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    index: usize,
) {
    let stop = shared.stop.clone();
    loop {
        crossbeam::select! {
            recv(shared.queue_rx) -> task => match task {
                Ok(task) => shared.run_task(task),
                Err(_) => break,
            },
            recv(stop.done()) -> _ => break,
        }
    }
    trace!(worker = index, "event loop worker exiting");
}

fn ticker_loop(
    shared: Arc<Shared>,
    interval: Duration,
    tick: fn(&Shared),
) {
    let stop = shared.stop.clone();
    let ticker = channel::tick(interval);
    loop {
        crossbeam::select! {
            recv(ticker) -> _ => tick(&shared),
            recv(stop.done()) -> _ => break,
        }
    }
}

/// Handle to an event loop.
///
/// Cloning yields another handle to the same loop. Worker threads keep the
/// loop alive until [`stop`](EventLoop::stop) is called.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state())
            .field("workers", &self.inner.config.workers)
            .finish()
    }
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> Self {
        let (queue_tx, queue_rx) = channel::bounded(config.queue_capacity);
        Self {
            inner: Arc::new_cyclic(|me| Shared {
                me: me.clone(),
                config,
                state: RwLock::new(LoopState::Idle),
                stop: CancellationToken::new(),
                queue_tx,
                queue_rx,
                active: Mutex::new(HashMap::new()),
                microtasks: Mutex::new(Vec::with_capacity(256)),
                timers: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Loop with `workers` workers and default settings otherwise.
    pub fn with_workers(workers: usize) -> Self {
        Self::new(EventLoopConfig::with_workers(workers))
    }

    /// Start the worker pool and tickers. No-op unless the loop is idle.
    pub fn start(&self) -> io::Result<()> {
        let mut state = self.inner.state.write();
        if *state != LoopState::Idle {
            return Ok(());
        }

        let mut threads = Vec::with_capacity(self.inner.config.workers + 2);
        let spawned = self.spawn_threads(&mut threads);
        if let Err(err) = spawned {
            *state = LoopState::Stopped;
            drop(state);
            self.inner.stop.cancel();
            for handle in threads {
                let _ = handle.join();
            }
            return Err(err);
        }

        *self.inner.threads.lock() = threads;
        *state = LoopState::Running;
        info!(workers = self.inner.config.workers, "event loop started");
        Ok(())
    }

    fn spawn_threads(
        &self,
        threads: &mut Vec<JoinHandle<()>>,
    ) -> io::Result<()> {
        for index in 0..self.inner.config.workers.max(1) {
            let shared = self.inner.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("event-loop-worker-{}", index))
                    .spawn(move || worker_loop(shared, index))?,
            );
        }

        let shared = self.inner.clone();
        let interval = self.inner.config.microtask_interval;
        threads.push(
            thread::Builder::new()
                .name("event-loop-microtasks".to_string())
                .spawn(move || ticker_loop(shared, interval, Shared::drain_microtasks))?,
        );

        let shared = self.inner.clone();
        let interval = self.inner.config.timer_interval;
        threads.push(
            thread::Builder::new()
                .name("event-loop-timers".to_string())
                .spawn(move || ticker_loop(shared, interval, Shared::process_timers))?,
        );
        Ok(())
    }

    /// Stop the loop. Idempotent.
    ///
    /// Tasks already running finish; queued tasks, pending microtasks and
    /// timers are cancelled.
    pub fn stop(&self) {
        if *self.inner.state.read() != LoopState::Running {
            return;
        }
        // Unblocks submitters waiting on a full queue before taking the
        // write lock they hold the read side of.
        self.inner.stop.cancel();
        {
            let mut state = self.inner.state.write();
            if *state != LoopState::Running {
                return;
            }
            *state = LoopState::Stopped;
        }

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("event loop thread panicked");
            }
        }

        let timers = std::mem::take(&mut *self.inner.timers.lock());
        for timer in &timers {
            timer.cancel();
        }
        let mut leftover: Vec<Arc<dyn Runnable>> = self.inner.queue_rx.try_iter().collect();
        leftover.append(&mut *self.inner.microtasks.lock());
        leftover.extend(self.inner.active.lock().drain().map(|(_, task)| task));
        for task in leftover {
            if !task.state().is_terminal() {
                task.cancel();
                self.inner.counters.record(task.state());
            }
        }
        info!("event loop stopped");
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        *self.inner.state.read()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    #[inline]
    pub fn config(&self) -> &EventLoopConfig {
        &self.inner.config
    }

    /// Queue `task` for a worker.
    ///
    /// Blocks while the queue is full. Fails with [`TaskError::NotRunning`]
    /// unless the loop is running, and with [`TaskError::Stopped`] if the
    /// loop stops while waiting for queue space. A task that was not
    /// queued is left untouched.
    pub fn schedule<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
    ) -> Result<(), TaskError> {
        self.submit(task.as_runnable())
    }

    /// Type-erased form of [`schedule`](Self::schedule).
    pub fn submit(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError> {
        self.inner.submit(task)
    }

    /// Create a task around `f` and schedule it.
    pub fn spawn<T, F>(
        &self,
        f: F,
    ) -> Result<Task<T>, TaskError>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    {
        let task = Task::new(f);
        self.schedule(&task)?;
        Ok(task)
    }

    /// Queue `task` in the microtask buffer, drained ahead of the next tick.
    ///
    /// Microtasks queued before `start` run once the loop starts. Fails
    /// once the loop has stopped.
    pub fn schedule_microtask<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
    ) -> Result<(), TaskError> {
        self.inner.push_microtask(task.as_runnable())
    }

    /// Run `f` once, `delay` from now.
    pub fn set_timeout<T, F>(
        &self,
        f: F,
        delay: Duration,
    ) -> Timer
    where
        T: Clone + Send + 'static,
        F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    {
        let timer = Timer::once(Task::new(f).as_runnable(), delay);
        self.inner.register_timer(&timer);
        timer
    }

    /// Run `f` every `interval`, each time as a fresh task.
    pub fn set_interval<T, F>(
        &self,
        f: F,
        interval: Duration,
    ) -> Timer
    where
        T: Clone + Send + 'static,
        F: Fn(&CancellationToken) -> TaskResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let timer = Timer::repeating(
            Box::new(move || {
                let f = f.clone();
                Task::new(move |token: &CancellationToken| f(token)).as_runnable()
            }),
            interval,
        );
        self.inner.register_timer(&timer);
        timer
    }

    /// Number of registered timers that have not expired.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Number of tasks queued or running on this loop.
    pub fn active_tasks(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn stats(&self) -> EventLoopStats {
        let counters = &self.inner.counters;
        EventLoopStats {
            tasks_scheduled: counters.scheduled.load(Ordering::Relaxed),
            tasks_completed: counters.completed.load(Ordering::Relaxed),
            tasks_failed: counters.failed.load(Ordering::Relaxed),
            tasks_cancelled: counters.cancelled.load(Ordering::Relaxed),
            microtasks_queued: counters.microtasks.load(Ordering::Relaxed),
            timers_scheduled: counters.timers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests;
