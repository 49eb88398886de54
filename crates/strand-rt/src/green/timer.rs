// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep timers.
//!
//! Deadlines live in a min-heap on the scheduler. Expired entries resume
//! their task; the `Sleep` future then observes the deadline and completes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use super::scheduler::Scheduler;
use super::task::TaskHandle;

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, TaskHandle)>>,
    seq: u64,
}

impl TimerQueue {
    pub fn push(&mut self, deadline: Instant, task: TaskHandle) {
        // seq keeps equal deadlines in insertion order.
        self.seq += 1;
        self.heap.push(Reverse((deadline, self.seq, task)));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every entry due at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<TaskHandle> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _, task))) = self.heap.peek() {
            if *deadline > now {
                break;
            }
            due.push(*task);
            self.heap.pop();
        }
        due
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Future returned by [`Scheduler::sleep`].
pub struct Sleep {
    scheduler: Scheduler,
    deadline: Instant,
    armed: bool,
}

impl Sleep {
    pub(crate) fn new(scheduler: Scheduler, deadline: Instant) -> Self {
        Self {
            scheduler,
            deadline,
            armed: false,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        if !self.armed {
            match self.scheduler.current_task() {
                Some(task) => {
                    let deadline = self.deadline;
                    self.scheduler.add_timer(deadline, task);
                    self.armed = true;
                }
                // Polled outside a task: nobody to resume, fall back to the waker.
                None => cx.waker().wake_by_ref(),
            }
        }
        Poll::Pending
    }
}
