//! Non-blocking multiplexing over channel operations
//!
//! [`Select::execute`] tries its cases in declaration order and performs the
//! first one that can complete immediately. It never blocks: when nothing is
//! ready it reports `None`. [`Select::execute_timeout`] polls until a case is
//! ready or the deadline passes.
//!
//! A send case is ready when the value can be handed to a waiting receiver
//! or buffered. A receive case is ready when a value is available. Closed
//! channels never make a case ready.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use super::{Channel, TryRecvError};
use crate::runtime::errors::SelectError;

/// One arm of a [`Select`].
pub trait SelectCase {
    /// Attempt the operation without blocking.
    ///
    /// `None` means not ready; `Some` carries the handler's outcome.
    fn try_fire(&mut self) -> Option<anyhow::Result<()>>;
}

struct SendCase<'a, T, F> {
    channel: &'a Channel<T>,
    value: Option<T>,
    handler: F,
}

impl<T, F> SelectCase for SendCase<'_, T, F>
where
    F: FnMut() -> anyhow::Result<()>,
{
    fn try_fire(&mut self) -> Option<anyhow::Result<()>> {
        let value = self.value.take()?;
        match self.channel.try_send(value) {
            Ok(()) => Some((self.handler)()),
            Err(err) => {
                self.value = Some(err.into_inner());
                None
            }
        }
    }
}

struct RecvCase<'a, T, F> {
    channel: &'a Channel<T>,
    handler: F,
}

impl<T, F> SelectCase for RecvCase<'_, T, F>
where
    F: FnMut(T) -> anyhow::Result<()>,
{
    fn try_fire(&mut self) -> Option<anyhow::Result<()>> {
        match self.channel.try_receive() {
            Ok(value) => Some((self.handler)(value)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}

/// A case that sends `value` on `channel`, then runs `handler`.
///
/// Once the value has been sent the case is never ready again.
pub fn send_case<'a, T, F>(
    channel: &'a Channel<T>,
    value: T,
    handler: F,
) -> impl SelectCase + 'a
where
    T: 'a,
    F: FnMut() -> anyhow::Result<()> + 'a,
{
    SendCase {
        channel,
        value: Some(value),
        handler,
    }
}

/// A case that receives from `channel` and passes the value to `handler`.
pub fn recv_case<'a, T, F>(
    channel: &'a Channel<T>,
    handler: F,
) -> impl SelectCase + 'a
where
    T: 'a,
    F: FnMut(T) -> anyhow::Result<()> + 'a,
{
    RecvCase { channel, handler }
}

/// Ordered set of channel operations.
#[derive(Default)]
pub struct Select<'a> {
    cases: Vec<Box<dyn SelectCase + 'a>>,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Append a case; its index is the number of cases added before it.
    pub fn add_case(
        &mut self,
        case: impl SelectCase + 'a,
    ) -> usize {
        self.cases.push(Box::new(case));
        self.cases.len() - 1
    }

    /// Builder form of a send case.
    pub fn send<T: 'a>(
        mut self,
        channel: &'a Channel<T>,
        value: T,
        handler: impl FnMut() -> anyhow::Result<()> + 'a,
    ) -> Self {
        self.add_case(send_case(channel, value, handler));
        self
    }

    /// Builder form of a receive case.
    pub fn recv<T: 'a>(
        mut self,
        channel: &'a Channel<T>,
        handler: impl FnMut(T) -> anyhow::Result<()> + 'a,
    ) -> Self {
        self.add_case(recv_case(channel, handler));
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Perform the first ready case.
    ///
    /// Returns its index, `None` when no case was ready, or the handler's
    /// error tagged with the case index.
    pub fn execute(&mut self) -> Result<Option<usize>, SelectError> {
        for (index, case) in self.cases.iter_mut().enumerate() {
            if let Some(outcome) = case.try_fire() {
                return outcome
                    .map(|()| Some(index))
                    .map_err(|source| SelectError { index, source });
            }
        }
        Ok(None)
    }

    /// Poll [`execute`](Self::execute) until a case fires or `timeout` elapses.
    pub fn execute_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<usize>, SelectError> {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.execute()? {
                return Ok(Some(index));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(200));
            } else {
                backoff.snooze();
            }
        }
    }
}
