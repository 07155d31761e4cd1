//! Promises, futures and the process-wide event loop
//!
//! A [`Promise`] is a task whose body waits for a [`Resolver`] handed to a
//! user setup function. The setup function runs on its own thread, so it may
//! block or hand the resolver elsewhere; the wait itself is cancellable.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{self, Sender};
use once_cell::sync::Lazy;
use tracing::{error, warn};

use super::{EventLoop, EventLoopConfig};
use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{panic_message, TaskError, TaskResult};
use crate::runtime::scheduler::task::{Task, TaskId, TaskState};

/// Settles a [`Promise`]. Consumed by the first settlement.
///
/// Dropping it unsettled rejects the promise with [`TaskError::Abandoned`].
#[derive(Debug)]
pub struct Resolver<T> {
    tx: Sender<TaskResult<T>>,
}

impl<T> Resolver<T> {
    pub fn resolve(
        self,
        value: T,
    ) {
        let _ = self.tx.try_send(Ok(value));
    }

    pub fn reject(
        self,
        err: impl Into<TaskError>,
    ) {
        let _ = self.tx.try_send(Err(err.into()));
    }
}

/// A task settled through a [`Resolver`].
#[derive(Debug, Clone)]
pub struct Promise<T: Clone + Send + 'static> {
    task: Task<T>,
    event_loop: EventLoop,
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Schedule a promise on `event_loop` and run `setup` with its resolver.
    pub fn new<F>(
        event_loop: &EventLoop,
        setup: F,
    ) -> Result<Self, TaskError>
    where
        F: FnOnce(Resolver<T>) + Send + 'static,
    {
        let task = Task::new(move |token: &CancellationToken| {
            let (tx, rx) = channel::bounded(1);
            let on_panic = tx.clone();
            let resolver = Resolver { tx };
            thread::Builder::new()
                .name("promise-setup".to_string())
                .spawn(move || {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| setup(resolver))) {
                        let message = panic_message(payload.as_ref());
                        error!(panic = %message, "promise setup panicked");
                        let _ = on_panic.try_send(Err(TaskError::Panicked(message)));
                    }
                })
                .map_err(TaskError::failed)?;

            crossbeam::select! {
                recv(rx) -> settled => settled.unwrap_or(Err(TaskError::Abandoned)),
                recv(token.done()) -> _ => Err(TaskError::Cancelled),
            }
        });
        Self::scheduled(event_loop, task)
    }

    fn scheduled(
        event_loop: &EventLoop,
        task: Task<T>,
    ) -> Result<Self, TaskError> {
        event_loop.schedule(&task)?;
        Ok(Self {
            task,
            event_loop: event_loop.clone(),
        })
    }

    /// Chain `f` onto the fulfilled value; rejections pass through.
    pub fn then<U, F>(
        &self,
        f: F,
    ) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> TaskResult<U> + Send + 'static,
    {
        Promise {
            task: self.task.then(f),
            event_loop: self.event_loop.clone(),
        }
    }

    /// Recover from a rejection through `f`; fulfilled values pass through.
    pub fn catch<F>(
        &self,
        f: F,
    ) -> Promise<T>
    where
        F: FnOnce(TaskError) -> T + Send + 'static,
    {
        Promise {
            task: self.task.catch(f),
            event_loop: self.event_loop.clone(),
        }
    }

    /// Block until settled.
    pub fn await_result(&self) -> TaskResult<T> {
        self.task.await_result()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    #[inline]
    pub fn task(&self) -> &Task<T> {
        &self.task
    }

    /// Fulfil with every value in argument order, or reject with the first
    /// error in argument order.
    pub fn all(
        event_loop: &EventLoop,
        promises: Vec<Promise<T>>,
    ) -> Result<Promise<Vec<T>>, TaskError> {
        let task = Task::new(move |_token: &CancellationToken| {
            promises
                .iter()
                .map(Promise::await_result)
                .collect::<TaskResult<Vec<T>>>()
        });
        Promise::scheduled(event_loop, task)
    }

    /// Settle like whichever promise settles first.
    ///
    /// Rejects with [`TaskError::Cancelled`] if the race itself is cancelled
    /// first, and with [`TaskError::Abandoned`] when given no promises.
    pub fn race(
        event_loop: &EventLoop,
        promises: Vec<Promise<T>>,
    ) -> Result<Promise<T>, TaskError> {
        let task = Task::new(move |token: &CancellationToken| {
            let (tx, rx) = channel::bounded(promises.len().max(1));
            for promise in promises {
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name("promise-race".to_string())
                    .spawn(move || {
                        let _ = tx.send(promise.await_result());
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn race waiter");
                }
            }
            drop(tx);

            crossbeam::select! {
                recv(rx) -> settled => settled.unwrap_or(Err(TaskError::Abandoned)),
                recv(token.done()) -> _ => Err(TaskError::Cancelled),
            }
        });
        Promise::scheduled(event_loop, task)
    }
}

/// Handle to work submitted with [`spawn`].
#[derive(Debug, Clone)]
pub struct Future<T: Clone + Send + 'static> {
    task: Task<T>,
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Block until the work finishes.
    pub fn await_result(&self) -> TaskResult<T> {
        self.task.await_result()
    }

    pub fn try_result(&self) -> Option<TaskResult<T>> {
        self.task.try_result()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    #[inline]
    pub fn task(&self) -> &Task<T> {
        &self.task
    }
}

static GLOBAL_LOOP: Lazy<EventLoop> = Lazy::new(|| {
    let event_loop = EventLoop::new(EventLoopConfig::default());
    if let Err(err) = event_loop.start() {
        error!(error = %err, "failed to start the global event loop");
    }
    event_loop
});

/// The process-wide event loop, started on first use.
pub fn global() -> &'static EventLoop {
    &GLOBAL_LOOP
}

/// Run `f` on the global event loop.
///
/// If the loop cannot take the work, the returned future is already failed
/// with the scheduling error.
pub fn spawn<T, F>(f: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(&CancellationToken) -> TaskResult<T> + Send + 'static,
{
    let task = Task::new(f);
    if let Err(err) = global().schedule(&task) {
        task.as_runnable().fail(err);
    }
    Future { task }
}
