//! Generator-style coroutines
//!
//! A [`Coroutine`] runs a producer function on its own thread. The producer
//! pushes values through a [`Yielder`]; the consumer pops them oldest first.
//! The coroutine is done once the producer has returned and every yielded
//! value has been consumed.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{panic_message, TaskError, TaskResult};

struct Queue<T> {
    values: VecDeque<T>,
    done: bool,
}

struct YielderInner<T> {
    queue: Mutex<Queue<T>>,
    /// Signalled on every push, pop, finish and cancel.
    changed: Condvar,
    capacity: Option<usize>,
    token: CancellationToken,
}

/// Producer side of a coroutine.
pub struct Yielder<T> {
    inner: Arc<YielderInner<T>>,
}

impl<T> Clone for Yielder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Yielder<T> {
    fn new(
        capacity: Option<usize>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(YielderInner {
                queue: Mutex::new(Queue {
                    values: VecDeque::new(),
                    done: false,
                }),
                changed: Condvar::new(),
                capacity: capacity.map(|c| c.max(1)),
                token,
            }),
        }
    }

    /// Hand `value` to the consumer.
    ///
    /// With a bounded queue this blocks while the queue is full. Fails with
    /// [`TaskError::Cancelled`] once the coroutine is cancelled.
    pub fn yield_value(
        &self,
        value: T,
    ) -> Result<(), TaskError> {
        let mut queue = self.inner.queue.lock();
        loop {
            if self.inner.token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            match self.inner.capacity {
                Some(cap) if queue.values.len() >= cap => self.inner.changed.wait(&mut queue),
                _ => break,
            }
        }
        queue.values.push_back(value);
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Number of values yielded but not consumed yet.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<T> {
        let value = self.inner.queue.lock().values.pop_front();
        if value.is_some() {
            self.inner.changed.notify_all();
        }
        value
    }

    fn pop_blocking(&self) -> Option<T> {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(value) = queue.values.pop_front() {
                self.inner.changed.notify_all();
                return Some(value);
            }
            if queue.done {
                return None;
            }
            self.inner.changed.wait(&mut queue);
        }
    }

    fn finish(&self) {
        self.inner.queue.lock().done = true;
        self.inner.changed.notify_all();
    }

    fn is_finished(&self) -> bool {
        let queue = self.inner.queue.lock();
        queue.done && queue.values.is_empty()
    }

    fn cancel(&self) {
        self.inner.token.cancel();
        // Take the lock so a producer between its check and its wait sees it.
        let _queue = self.inner.queue.lock();
        self.inner.changed.notify_all();
    }
}

struct Outcome {
    result: Mutex<Option<TaskResult<()>>>,
    finished: Condvar,
}

/// Consumer side of a generator running on its own thread.
pub struct Coroutine<T> {
    yielder: Yielder<T>,
    token: CancellationToken,
    outcome: Arc<Outcome>,
}

impl<T> std::fmt::Debug for Coroutine<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("buffered", &self.yielder.len())
            .field("done", &self.yielder.is_finished())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> Coroutine<T> {
    /// Start `f` with an unbounded queue.
    pub fn new<F>(f: F) -> io::Result<Self>
    where
        F: FnOnce(&Yielder<T>, &CancellationToken) -> TaskResult<()> + Send + 'static,
    {
        Self::spawn(None, f)
    }

    /// Start `f` with a queue of at most `capacity` values; the producer
    /// blocks while it is full.
    pub fn with_capacity<F>(
        capacity: usize,
        f: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(&Yielder<T>, &CancellationToken) -> TaskResult<()> + Send + 'static,
    {
        Self::spawn(Some(capacity), f)
    }

    fn spawn<F>(
        capacity: Option<usize>,
        f: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(&Yielder<T>, &CancellationToken) -> TaskResult<()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let yielder = Yielder::new(capacity, token.clone());
        let outcome = Arc::new(Outcome {
            result: Mutex::new(None),
            finished: Condvar::new(),
        });

        let producer = yielder.clone();
        let producer_token = token.clone();
        let producer_outcome = outcome.clone();
        thread::Builder::new()
            .name("coroutine".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&producer, &producer_token)))
                    .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                debug!(ok = result.is_ok(), "coroutine finished");
                producer.finish();
                *producer_outcome.result.lock() = Some(result);
                producer_outcome.finished.notify_all();
            })?;

        Ok(Self {
            yielder,
            token,
            outcome,
        })
    }
}

impl<T> Coroutine<T> {
    /// Pop the oldest yielded value without blocking.
    pub fn try_next(&self) -> Option<T> {
        self.yielder.try_pop()
    }

    /// True once the producer has returned and every value was consumed.
    pub fn is_done(&self) -> bool {
        self.yielder.is_finished()
    }

    /// Block until the producer returns and get its result.
    pub fn wait(&self) -> TaskResult<()> {
        let mut result = self.outcome.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.outcome.finished.wait(&mut result);
        }
    }

    /// Cancel the producer's token; a blocked or later `yield_value` fails.
    pub fn cancel(&self) {
        self.yielder.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Values yielded but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.yielder.len()
    }
}

impl<T> Iterator for Coroutine<T> {
    type Item = T;

    /// Block for the next value; `None` once the coroutine is done.
    fn next(&mut self) -> Option<T> {
        self.yielder.pop_blocking()
    }
}

impl<T> Drop for Coroutine<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
