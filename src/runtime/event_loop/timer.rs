//! One-shot and interval timers driven by the event loop's timer ticker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::runtime::scheduler::task::Runnable;

type TaskFactory = Box<dyn Fn() -> Arc<dyn Runnable> + Send + Sync>;

/// Outcome of checking a timer on a tick.
pub(crate) enum Poll {
    /// Not due yet.
    Pending,
    /// Due: schedule `task`; keep the timer registered if `keep`.
    Fire { task: Arc<dyn Runnable>, keep: bool },
    /// Cancelled; drop it.
    Expired,
}

struct Slot {
    next_run: Instant,
    /// The task armed for the next firing, or the last one fired.
    task: Arc<dyn Runnable>,
}

struct TimerInner {
    id: u64,
    interval: Option<Duration>,
    factory: Option<TaskFactory>,
    cancelled: AtomicBool,
    fired: AtomicU64,
    slot: Mutex<Slot>,
}

/// Handle to a timer registered with an [`EventLoop`](super::EventLoop).
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl std::fmt::Debug for Timer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("interval", &self.inner.interval)
            .field("cancelled", &self.is_cancelled())
            .field("fired", &self.fire_count())
            .finish()
    }
}

fn next_timer_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl Timer {
    pub(crate) fn once(
        task: Arc<dyn Runnable>,
        delay: Duration,
    ) -> Self {
        Self::build(task, delay, None, None)
    }

    pub(crate) fn repeating(
        factory: TaskFactory,
        interval: Duration,
    ) -> Self {
        let task = factory();
        Self::build(task, interval, Some(interval), Some(factory))
    }

    fn build(
        task: Arc<dyn Runnable>,
        delay: Duration,
        interval: Option<Duration>,
        factory: Option<TaskFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                id: next_timer_id(),
                interval,
                factory,
                cancelled: AtomicBool::new(false),
                fired: AtomicU64::new(0),
                slot: Mutex::new(Slot {
                    next_run: Instant::now() + delay,
                    task,
                }),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn is_interval(&self) -> bool {
        self.inner.interval.is_some()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// How many times the timer has fired.
    #[inline]
    pub fn fire_count(&self) -> u64 {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Stop future firings and cancel the armed (or last fired) task.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.inner.slot.lock().task.clone();
        task.cancel();
    }

    pub(crate) fn poll(
        &self,
        now: Instant,
    ) -> Poll {
        if self.is_cancelled() {
            return Poll::Expired;
        }
        let mut slot = self.inner.slot.lock();
        if now < slot.next_run {
            return Poll::Pending;
        }
        self.inner.fired.fetch_add(1, Ordering::SeqCst);

        match (&self.inner.factory, self.inner.interval) {
            (Some(factory), Some(interval)) => {
                let task = std::mem::replace(&mut slot.task, factory());
                slot.next_run = now + interval;
                Poll::Fire { task, keep: true }
            }
            _ => Poll::Fire {
                task: slot.task.clone(),
                keep: false,
            },
        }
    }
}
