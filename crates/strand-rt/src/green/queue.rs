// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queue: local FIFO of ready tasks plus a thread-safe injector.
//!
//! The scheduler pushes and pops the local side directly. Wakers push
//! onto the injector, which is drained into `resume` at the start of
//! each turn.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::reactor::Notifier;
use super::task::TaskHandle;

pub(crate) struct RunQueue {
    local: RefCell<VecDeque<TaskHandle>>,
    injector: Arc<Injector>,
}

impl RunQueue {
    pub fn new(injector: Arc<Injector>) -> Self {
        Self {
            local: RefCell::new(VecDeque::new()),
            injector,
        }
    }

    pub fn push(&self, task: TaskHandle) {
        self.local.borrow_mut().push_back(task);
    }

    /// Pop from the front (FIFO keeps turns fair).
    pub fn pop(&self) -> Option<TaskHandle> {
        self.local.borrow_mut().pop_front()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.local.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.local.borrow_mut().clear();
    }

    pub fn injector(&self) -> &Arc<Injector> {
        &self.injector
    }
}

/// Wakes posted through `std::task::Waker`.
pub(crate) struct Injector {
    queue: Mutex<Vec<TaskHandle>>,
    notifier: Arc<Notifier>,
}

impl Injector {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            notifier,
        }
    }

    /// Post a wake and interrupt a blocking reactor poll.
    pub fn push(&self, task: TaskHandle) {
        self.queue.lock().push(task);
        self.notifier.notify();
    }

    pub fn take_all(&self) -> Vec<TaskHandle> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
