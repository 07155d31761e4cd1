//! Actors
//!
//! An [`Actor`] owns a bounded mailbox and a single message loop thread that
//! hands messages to its handler one at a time, in arrival order.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::runtime::channel::{Channel, TrySendError};
use crate::runtime::errors::{panic_message, ChannelError};

type Handler<M> = Box<dyn FnMut(M) + Send>;

/// Mailbox-driven message processor.
pub struct Actor<M> {
    id: String,
    mailbox: Channel<M>,
    handler: Mutex<Option<Handler<M>>>,
    running: AtomicBool,
    processed: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M> std::fmt::Debug for Actor<M> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .field("mailbox", &self.mailbox)
            .finish()
    }
}

impl<M: Send + 'static> Actor<M> {
    /// Create a stopped actor with a mailbox of `mailbox_size` messages.
    pub fn new<F>(
        id: impl Into<String>,
        mailbox_size: usize,
        handler: F,
    ) -> Self
    where
        F: FnMut(M) + Send + 'static,
    {
        Self {
            id: id.into(),
            mailbox: Channel::new(mailbox_size),
            handler: Mutex::new(Some(Box::new(handler))),
            running: AtomicBool::new(false),
            processed: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Launch the message loop. Only the first call has an effect.
    pub fn start(&self) -> io::Result<()> {
        let Some(mut handler) = self.handler.lock().take() else {
            return Ok(());
        };
        let mailbox = self.mailbox.clone();
        let processed = self.processed.clone();
        let id = self.id.clone();

        self.running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("actor-{}", self.id))
            .spawn(move || {
                for msg in mailbox.iter() {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                        error!(actor = %id, panic = %panic_message(payload.as_ref()), "actor handler panicked");
                    }
                    processed.fetch_add(1, Ordering::Relaxed);
                }
                debug!(actor = %id, "actor loop exited");
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                info!(actor = %self.id, "actor started");
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Deliver `msg`, blocking while the mailbox is full.
    pub fn send(
        &self,
        msg: M,
    ) -> Result<(), ChannelError> {
        self.mailbox.send(msg)
    }

    /// Deliver `msg` without blocking.
    pub fn try_send(
        &self,
        msg: M,
    ) -> Result<(), TrySendError<M>> {
        self.mailbox.try_send(msg)
    }
}

impl<M> Actor<M> {
    /// Close the mailbox. Queued messages are still processed; a handler
    /// already running is not interrupted. Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.mailbox.close();
            info!(actor = %self.id, "actor stopping");
        }
    }

    /// Wait for the message loop to exit.
    pub fn join(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let _ = handle.join();
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Messages handled so far, panicking ones included.
    #[inline]
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Messages waiting in the mailbox.
    #[inline]
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

impl<M> Drop for Actor<M> {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}
