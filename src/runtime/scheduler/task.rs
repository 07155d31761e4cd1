//! Tasks: units of asynchronous work with a result.
//!
//! A [`Task`] wraps a closure that receives the task's [`CancellationToken`]
//! and produces a [`TaskResult`]. Its state moves
//! `Pending -> Running -> {Completed | Failed | Cancelled}`; `Cancelled` can
//! also be entered straight from `Pending`. Terminal states never change.
//!
//! Executors see tasks through the object-safe [`Runnable`] trait, which
//! lets one queue hold tasks of every result type.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{panic_message, TaskError, TaskResult};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Allocate the next process-wide id.
    pub fn next() -> Self {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<usize> for TaskId {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl From<TaskId> for usize {
    fn from(val: TaskId) -> Self {
        val.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting to run.
    Pending,
    /// Currently executing.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error or a panic.
    Failed,
    /// Cancelled before or while running.
    Cancelled,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            4 => TaskState::Cancelled,
            _ => TaskState::Pending,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Completed => 2,
            TaskState::Failed => 3,
            TaskState::Cancelled => 4,
        }
    }

    /// Whether the state can no longer change.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Something that accepts runnables for later execution.
///
/// Tasks remember the executor that ran them and hand their continuations
/// back to it.
pub trait Executor: Send + Sync {
    /// Queue a continuation of a finished task.
    fn submit_continuation(
        &self,
        task: Arc<dyn Runnable>,
    ) -> Result<(), TaskError>;
}

/// Type-erased view of a task used by executors.
pub trait Runnable: Send + Sync + 'static {
    fn id(&self) -> TaskId;

    fn state(&self) -> TaskState;

    /// Run the body if the task is still pending; otherwise do nothing.
    fn run(&self);

    /// Cancel the task; no-op once terminal.
    fn cancel(&self);

    /// Finish a pending task with `err` without running it.
    fn fail(
        &self,
        err: TaskError,
    );

    /// Remember the executor that owns this task.
    fn bind(
        &self,
        executor: Weak<dyn Executor>,
    );
}

type TaskFn<T> = Box<dyn FnOnce(&CancellationToken) -> TaskResult<T> + Send>;

#[derive(Default)]
struct Continuations {
    sealed: bool,
    tasks: Vec<Arc<dyn Runnable>>,
}

struct TaskInner<T> {
    id: TaskId,
    name: String,
    state: AtomicU8,
    func: Mutex<Option<TaskFn<T>>>,
    outcome: Mutex<Option<TaskResult<T>>>,
    finished: Condvar,
    token: CancellationToken,
    parent: Option<TaskId>,
    continuations: Mutex<Continuations>,
    executor: Mutex<Option<Weak<dyn Executor>>>,
}

impl<T: Clone + Send + 'static> TaskInner<T> {
    #[inline]
    fn load_state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move from `from` to a terminal state and publish `result`.
    ///
    /// Returns false if the task was not in `from`.
    fn settle(
        &self,
        from: TaskState,
        result: TaskResult<T>,
    ) -> bool {
        let target = match &result {
            Ok(_) => TaskState::Completed,
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        {
            let mut outcome = self.outcome.lock();
            if self
                .state
                .compare_exchange(
                    from.as_u8(),
                    target.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                return false;
            }
            *outcome = Some(result);
        }
        self.finished.notify_all();
        if target == TaskState::Cancelled {
            self.token.cancel();
        }
        trace!(task = %self.id, state = %target, "task settled");
        self.release_continuations();
        true
    }

    fn release_continuations(&self) {
        let tasks = {
            let mut continuations = self.continuations.lock();
            continuations.sealed = true;
            std::mem::take(&mut continuations.tasks)
        };
        self.dispatch(tasks);
    }

    /// Hand continuations to this task's executor, or run them here when
    /// the task never reached one.
    fn dispatch(
        &self,
        tasks: Vec<Arc<dyn Runnable>>,
    ) {
        if tasks.is_empty() {
            return;
        }
        let executor = self.executor.lock().as_ref().and_then(Weak::upgrade);
        for task in tasks {
            match &executor {
                Some(executor) => {
                    if let Err(err) = executor.submit_continuation(task.clone()) {
                        task.fail(err);
                    }
                }
                None => task.run(),
            }
        }
    }

    fn add_continuation(
        &self,
        task: Arc<dyn Runnable>,
    ) {
        {
            let mut continuations = self.continuations.lock();
            if !continuations.sealed {
                continuations.tasks.push(task);
                return;
            }
        }
        self.dispatch(vec![task]);
    }

    fn wait(&self) -> TaskResult<T> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.finished.wait(&mut outcome);
        }
    }
}

impl<T: Clone + Send + 'static> Runnable for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        self.load_state()
    }

    fn run(&self) {
        if self
            .state
            .compare_exchange(
                TaskState::Pending.as_u8(),
                TaskState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let Some(func) = self.func.lock().take() else {
            self.settle(TaskState::Running, Err(TaskError::failed("task body missing")));
            return;
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(|| func(&self.token))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = %self.id, name = %self.name, panic = %message, "task panicked");
                Err(TaskError::Panicked(message))
            }
        };
        // Loses to a concurrent cancel, which already settled the task.
        self.settle(TaskState::Running, result);
    }

    fn cancel(&self) {
        loop {
            let current = self.load_state();
            if current.is_terminal() {
                return;
            }
            if self.settle(current, Err(TaskError::Cancelled)) {
                self.func.lock().take();
                return;
            }
        }
    }

    fn fail(
        &self,
        err: TaskError,
    ) {
        if self.settle(TaskState::Pending, Err(err)) {
            self.func.lock().take();
        }
    }

    fn bind(
        &self,
        executor: Weak<dyn Executor>,
    ) {
        *self.executor.lock() = Some(executor);
    }
}

/// Handle to a task producing a `T`.
///
/// Handles are cheap to clone; every clone refers to the same task.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Task<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Create a pending task around `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    {
        Self::build(None, None, Box::new(f))
    }

    /// Create a named pending task; the name shows up in logs.
    pub fn named<F>(
        name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
    {
        Self::build(Some(name.into()), None, Box::new(f))
    }

    fn build(
        name: Option<String>,
        parent: Option<TaskId>,
        func: TaskFn<T>,
    ) -> Self {
        let id = TaskId::next();
        Self {
            inner: Arc::new(TaskInner {
                id,
                name: name.unwrap_or_else(|| id.to_string()),
                state: AtomicU8::new(TaskState::Pending.as_u8()),
                func: Mutex::new(Some(func)),
                outcome: Mutex::new(None),
                finished: Condvar::new(),
                token: CancellationToken::new(),
                parent,
                continuations: Mutex::new(Continuations::default()),
                executor: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.inner.load_state()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Id of the task this one continues, if any.
    #[inline]
    pub fn parent(&self) -> Option<TaskId> {
        self.inner.parent
    }

    /// The token handed to the task body.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancel the task and its token. No-op once the task is terminal.
    pub fn cancel(&self) {
        Runnable::cancel(&*self.inner);
    }

    /// Block until the task is terminal and return its result.
    pub fn await_result(&self) -> TaskResult<T> {
        self.inner.wait()
    }

    /// Same as [`await_result`](Self::await_result).
    #[inline]
    pub fn result(&self) -> TaskResult<T> {
        self.await_result()
    }

    /// The result if the task is terminal, without blocking.
    pub fn try_result(&self) -> Option<TaskResult<T>> {
        self.inner.outcome.lock().clone()
    }

    /// Wait up to `timeout` for the result.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> Option<TaskResult<T>> {
        let mut outcome = self.inner.outcome.lock();
        if outcome.is_none() {
            self.inner.finished.wait_for(&mut outcome, timeout);
        }
        outcome.clone()
    }

    /// Run the task body on the calling thread if it is still pending.
    pub fn run(&self) {
        Runnable::run(&*self.inner);
    }

    /// Type-erased handle for executors.
    pub fn as_runnable(&self) -> Arc<dyn Runnable> {
        self.inner.clone()
    }

    /// A task that maps this task's value through `f` once it completes.
    ///
    /// An error (or cancellation) of this task is passed through unchanged
    /// and `f` is not called. The continuation is scheduled automatically
    /// on the executor that ran this task.
    pub fn then<U, F>(
        &self,
        f: F,
    ) -> Task<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> TaskResult<U> + Send + 'static,
    {
        let parent = self.clone();
        let child = Task::build(
            None,
            Some(self.id()),
            Box::new(move |_token: &CancellationToken| f(parent.await_result()?)),
        );
        self.inner.add_continuation(child.as_runnable());
        child
    }

    /// A task that recovers from this task's error through `f`.
    ///
    /// A successful value is passed through unchanged.
    pub fn catch<F>(
        &self,
        f: F,
    ) -> Task<T>
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        let parent = self.clone();
        let child = Task::build(
            None,
            Some(self.id()),
            Box::new(move |_token: &CancellationToken| match parent.await_result() {
                Ok(value) => Ok(value),
                Err(err) => Ok(f(err)),
            }),
        );
        self.inner.add_continuation(child.as_runnable());
        child
    }
}
