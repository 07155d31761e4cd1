//! Deadline queue for the scheduler
//!
//! Min-heap of scheduled tasks: the earliest deadline comes out first, equal
//! deadlines come out highest priority first, and equal deadline and priority
//! keep insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use super::task::Runnable;

/// A task waiting for its deadline.
pub struct ScheduledTask {
    pub task: Arc<dyn Runnable>,
    pub priority: i32,
    pub deadline: Instant,
    seq: u64,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("task", &self.task.id())
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl PartialEq for ScheduledTask {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    /// "Greater" means "dispatch sooner", since `BinaryHeap` is a max-heap.
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Heap of [`ScheduledTask`]s. Not synchronized; the scheduler guards it.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: BinaryHeap<ScheduledTask>,
    next_seq: u64,
}

impl DeadlineQueue {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        task: Arc<dyn Runnable>,
        priority: i32,
        deadline: Instant,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledTask {
            task,
            priority,
            deadline,
            seq,
        });
    }

    /// Deadline of the next task to dispatch.
    #[inline]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Remove the next task if its deadline is at or before `now`.
    pub fn pop_due(
        &mut self,
        now: Instant,
    ) -> Option<ScheduledTask> {
        if self.next_deadline()? <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<ScheduledTask> {
        self.heap.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every task, in no particular order.
    pub fn drain(&mut self) -> impl Iterator<Item = ScheduledTask> + '_ {
        self.heap.drain()
    }
}
