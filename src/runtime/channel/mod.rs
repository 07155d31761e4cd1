//! Bounded CSP channels
//!
//! A [`Channel`] is a bounded FIFO with blocking `send`/`receive`:
//!
//! - a value sent while a receiver is already blocked goes straight to that
//!   receiver, ahead of anything that could be buffered;
//! - a sender that finds the buffer full parks together with its value, so a
//!   capacity-0 channel is a rendezvous and the buffer never exceeds its
//!   capacity;
//! - `close` is final: buffered values stay receivable, then every receive
//!   reports end-of-stream (`None`) and every send fails.

mod select;

pub use select::{recv_case, send_case, Select, SelectCase};

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::runtime::errors::ChannelError;

/// Failure of [`Channel::try_send`]; the value is handed back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    #[error("channel is full")]
    Full(T),
    #[error("send on closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

/// Failure of [`Channel::try_receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// Nothing buffered and no sender parked.
    #[error("channel is empty")]
    Empty,
    /// Closed and drained.
    #[error("channel is closed")]
    Closed,
}

/// A parked party and the slot its counterpart fills.
struct Waiter<S> {
    slot: Mutex<S>,
    ready: Condvar,
}

impl<S> Waiter<S> {
    fn new(slot: S) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(slot),
            ready: Condvar::new(),
        })
    }
}

enum RecvSlot<T> {
    Waiting,
    Ready(T),
    Closed,
}

enum SendSlot<T> {
    Pending(T),
    Taken,
    Closed,
}

impl<T> Waiter<RecvSlot<T>> {
    fn fulfill(
        &self,
        slot: RecvSlot<T>,
    ) {
        *self.slot.lock() = slot;
        self.ready.notify_one();
    }
}

impl<T> Waiter<SendSlot<T>> {
    /// Take the parked sender's value and release it.
    fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match mem::replace(&mut *slot, SendSlot::Taken) {
            SendSlot::Pending(value) => {
                self.ready.notify_one();
                Some(value)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    fn reject(&self) {
        *self.slot.lock() = SendSlot::Closed;
        self.ready.notify_one();
    }
}

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
    senders: VecDeque<Arc<Waiter<SendSlot<T>>>>,
    receivers: VecDeque<Arc<Waiter<RecvSlot<T>>>>,
}

impl<T> State<T> {
    /// Pop the next parked sender's value.
    fn take_parked(&mut self) -> Option<T> {
        while let Some(sender) = self.senders.pop_front() {
            if let Some(value) = sender.take() {
                return Some(value);
            }
        }
        None
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    capacity: usize,
}

/// Bounded multi-producer multi-consumer channel.
///
/// Cloning yields another handle to the same channel.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel buffering up to `capacity` values (0 = rendezvous).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                }),
                capacity,
            }),
        }
    }

    /// Send `value`, blocking while the buffer is full.
    ///
    /// Fails if the channel is closed, including while this sender is parked.
    pub fn send(
        &self,
        value: T,
    ) -> Result<(), ChannelError> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(receiver) = state.receivers.pop_front() {
                receiver.fulfill(RecvSlot::Ready(value));
                return Ok(());
            }
            if state.buffer.len() < self.inner.capacity {
                state.buffer.push_back(value);
                return Ok(());
            }
            let waiter = Waiter::new(SendSlot::Pending(value));
            state.senders.push_back(waiter.clone());
            waiter
        };

        let mut slot = waiter.slot.lock();
        while matches!(*slot, SendSlot::Pending(_)) {
            waiter.ready.wait(&mut slot);
        }
        match *slot {
            SendSlot::Closed => Err(ChannelError::Closed),
            _ => Ok(()),
        }
    }

    /// Send without blocking.
    pub fn try_send(
        &self,
        value: T,
    ) -> Result<(), TrySendError<T>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if let Some(receiver) = state.receivers.pop_front() {
            receiver.fulfill(RecvSlot::Ready(value));
            return Ok(());
        }
        if state.buffer.len() < self.inner.capacity {
            state.buffer.push_back(value);
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Receive the next value, blocking while the channel is empty and open.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn receive(&self) -> Option<T> {
        let waiter = {
            let mut state = self.inner.state.lock();
            if let Some(value) = Self::dequeue(&mut state) {
                return Some(value);
            }
            if state.closed {
                return None;
            }
            let waiter = Waiter::new(RecvSlot::Waiting);
            state.receivers.push_back(waiter.clone());
            waiter
        };

        let mut slot = waiter.slot.lock();
        loop {
            match mem::replace(&mut *slot, RecvSlot::Waiting) {
                RecvSlot::Waiting => waiter.ready.wait(&mut slot),
                RecvSlot::Ready(value) => return Some(value),
                RecvSlot::Closed => return None,
            }
        }
    }

    /// Receive without blocking.
    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        let mut state = self.inner.state.lock();
        match Self::dequeue(&mut state) {
            Some(value) => Ok(value),
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Take from the buffer, refilling it from the oldest parked sender; with
    /// an empty buffer take from a parked sender directly.
    fn dequeue(state: &mut State<T>) -> Option<T> {
        match state.buffer.pop_front() {
            Some(value) => {
                if let Some(refill) = state.take_parked() {
                    state.buffer.push_back(refill);
                }
                Some(value)
            }
            None => state.take_parked(),
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// Blocked receivers wake with end-of-stream; parked senders fail.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for receiver in state.receivers.drain(..) {
            receiver.fulfill(RecvSlot::Closed);
        }
        for sender in state.senders.drain(..) {
            sender.reject();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of buffered values.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer capacity.
    #[inline]
    pub fn cap(&self) -> usize {
        self.inner.capacity
    }

    /// Number of receivers currently blocked.
    pub fn waiting_receivers(&self) -> usize {
        self.inner.state.lock().receivers.len()
    }

    /// Number of senders currently parked.
    pub fn waiting_senders(&self) -> usize {
        self.inner.state.lock().senders.len()
    }

    /// Blocking iterator that ends at end-of-stream.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }
}

/// Iterator returned by [`Channel::iter`].
pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.receive()
    }
}
