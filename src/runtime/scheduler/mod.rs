//! Deadline scheduler
//!
//! The [`Scheduler`] holds tasks until their deadline and then hands them to
//! its own [`EventLoop`]. Dispatch order is earliest deadline first, then
//! highest priority. The dispatch thread sleeps until the earliest deadline
//! and is woken early by `stop` or by an insert.

pub mod queue;
pub mod task;

pub use queue::{DeadlineQueue, ScheduledTask};
pub use task::{Executor, Runnable, Task, TaskId, TaskState};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{info, trace, warn};

use crate::runtime::errors::TaskError;
use crate::runtime::event_loop::{EventLoop, EventLoopConfig, LoopState};

/// Priority used by [`Scheduler::schedule_immediate`].
pub const PRIORITY_IMMEDIATE: i32 = 10;
/// Priority used by [`Scheduler::schedule_delayed`].
pub const PRIORITY_DELAYED: i32 = 5;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker threads of the scheduler's event loop.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self { workers }
    }
}

impl SchedulerConfig {
    fn event_loop_config(&self) -> EventLoopConfig {
        EventLoopConfig::with_workers(self.workers)
    }
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks accepted by `schedule*`.
    pub scheduled: u64,
    /// Tasks handed to the event loop.
    pub dispatched: u64,
    /// Tasks the event loop refused.
    pub dispatch_failures: u64,
}

struct Pending {
    queue: DeadlineQueue,
    state: LoopState,
}

struct Shared {
    pending: Mutex<Pending>,
    wakeup: Condvar,
    event_loop: EventLoop,
    scheduled: AtomicU64,
    dispatched: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    /// Block until a task is due; `None` once the scheduler stops.
    fn next_due(&self) -> Option<ScheduledTask> {
        let mut pending = self.pending.lock();
        loop {
            if pending.state != LoopState::Running {
                return None;
            }
            match pending.queue.next_deadline() {
                None => self.wakeup.wait(&mut pending),
                Some(deadline) => {
                    if let Some(entry) = pending.queue.pop_due(Instant::now()) {
                        return Some(entry);
                    }
                    self.wakeup.wait_until(&mut pending, deadline);
                }
            }
        }
    }

    fn dispatch(
        &self,
        entry: ScheduledTask,
    ) {
        let task = entry.task;
        match self.event_loop.submit(task.clone()) {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                trace!(task = %task.id(), priority = entry.priority, "task dispatched");
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = %task.id(), error = %err, "dispatch failed");
                task.fail(err);
            }
        }
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    while let Some(entry) = shared.next_due() {
        shared.dispatch(entry);
    }
    trace!("scheduler dispatch loop exiting");
}

/// Priority/deadline scheduler feeding an event loop.
pub struct Scheduler {
    shared: Arc<Shared>,
    config: SchedulerConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("pending", &self.len())
            .field("workers", &self.config.workers)
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Pending {
                    queue: DeadlineQueue::new(),
                    state: LoopState::Idle,
                }),
                wakeup: Condvar::new(),
                event_loop: EventLoop::new(config.event_loop_config()),
                scheduled: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            config,
            worker: Mutex::new(None),
        }
    }

    /// Scheduler whose event loop has `workers` workers.
    pub fn with_workers(workers: usize) -> Self {
        Self::new(SchedulerConfig { workers })
    }

    /// Start the event loop and the dispatch thread. No-op unless idle.
    pub fn start(&self) -> io::Result<()> {
        let mut pending = self.shared.pending.lock();
        if pending.state != LoopState::Idle {
            return Ok(());
        }
        self.shared.event_loop.start()?;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || dispatch_loop(shared));
        match handle {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                pending.state = LoopState::Running;
                info!(workers = self.config.workers, "scheduler started");
                Ok(())
            }
            Err(err) => {
                pending.state = LoopState::Stopped;
                drop(pending);
                self.shared.event_loop.stop();
                Err(err)
            }
        }
    }

    /// Stop dispatching, cancel tasks still waiting for their deadline, and
    /// stop the event loop. Idempotent.
    pub fn stop(&self) {
        let leftover: Vec<ScheduledTask> = {
            let mut pending = self.shared.pending.lock();
            if pending.state == LoopState::Stopped {
                return;
            }
            pending.state = LoopState::Stopped;
            pending.queue.drain().collect()
        };
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("scheduler dispatch thread panicked");
            }
        }
        let cancelled = leftover.len();
        for entry in leftover {
            entry.task.cancel();
        }
        self.shared.event_loop.stop();
        info!(cancelled, "scheduler stopped");
    }

    /// Schedule `task` to run `delay` from now with `priority`.
    ///
    /// The deadline is taken from `Instant::now()` at each call, so two calls
    /// with the same `delay` get distinct deadlines and priority never breaks
    /// the tie between them. To have tasks share a deadline, compute one base
    /// instant and pass it to [`schedule_at`](Self::schedule_at).
    ///
    /// Tasks scheduled before `start` wait for it. Fails once stopped.
    pub fn schedule<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
        priority: i32,
        delay: Duration,
    ) -> Result<(), TaskError> {
        self.schedule_at(task, priority, Instant::now() + delay)
    }

    /// Schedule `task` for an absolute `deadline`.
    pub fn schedule_at<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
        priority: i32,
        deadline: Instant,
    ) -> Result<(), TaskError> {
        self.submit(task.as_runnable(), priority, deadline)
    }

    /// Type-erased form of [`schedule_at`](Self::schedule_at).
    pub fn submit(
        &self,
        task: Arc<dyn Runnable>,
        priority: i32,
        deadline: Instant,
    ) -> Result<(), TaskError> {
        {
            let mut pending = self.shared.pending.lock();
            if pending.state == LoopState::Stopped {
                return Err(TaskError::Stopped);
            }
            pending.queue.push(task, priority, deadline);
        }
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Schedule with priority 10 and no delay.
    pub fn schedule_immediate<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
    ) -> Result<(), TaskError> {
        self.schedule(task, PRIORITY_IMMEDIATE, Duration::ZERO)
    }

    /// Schedule with priority 5 after `delay`.
    pub fn schedule_delayed<T: Clone + Send + 'static>(
        &self,
        task: &Task<T>,
        delay: Duration,
    ) -> Result<(), TaskError> {
        self.schedule(task, PRIORITY_DELAYED, delay)
    }

    /// Number of tasks waiting for their deadline.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        self.shared.pending.lock().state
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The event loop tasks are dispatched to.
    #[inline]
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
