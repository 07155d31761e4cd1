//! Gray queue and parallel mark workers

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use crossbeam::utils::Backoff;

use super::header::HeaderPtr;

/// Work list of objects that are reachable but not yet scanned.
#[derive(Debug, Default)]
pub(crate) struct GrayQueue {
    queue: SegQueue<HeaderPtr>,
}

impl GrayQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    #[inline]
    pub(crate) fn push(
        &self,
        header: HeaderPtr,
    ) {
        self.queue.push(header);
    }

    #[inline]
    pub(crate) fn pop(&self) -> Option<HeaderPtr> {
        self.queue.pop()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain the queue on `workers` rayon tasks, calling `scan` per object.
    ///
    /// `scan` may push more work. Returns once the queue is empty and no
    /// worker is still scanning.
    pub(crate) fn drain_parallel<F>(
        &self,
        workers: usize,
        scan: F,
    ) -> usize
    where
        F: Fn(HeaderPtr) + Sync,
    {
        let active = AtomicUsize::new(0);
        let scanned = AtomicUsize::new(0);
        rayon::scope(|s| {
            for _ in 0..workers.max(1) {
                s.spawn(|_| {
                    let backoff = Backoff::new();
                    loop {
                        active.fetch_add(1, Ordering::SeqCst);
                        if let Some(header) = self.pop() {
                            scan(header);
                            scanned.fetch_add(1, Ordering::Relaxed);
                            active.fetch_sub(1, Ordering::SeqCst);
                            backoff.reset();
                            continue;
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                        // Another worker may still push children.
                        if self.is_empty() && active.load(Ordering::SeqCst) == 0 {
                            break;
                        }
                        backoff.snooze();
                    }
                });
            }
        });
        scanned.into_inner()
    }

    /// Drain the queue on the calling thread.
    pub(crate) fn drain_local<F>(
        &self,
        mut scan: F,
    ) -> usize
    where
        F: FnMut(HeaderPtr),
    {
        let mut scanned = 0;
        while let Some(header) = self.pop() {
            scan(header);
            scanned += 1;
        }
        scanned
    }
}
