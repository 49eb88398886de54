// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task representation.
//!
//! A task is a boxed future polled by the scheduler on its own thread.
//! It only gives up control where the future returns `Pending`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Wake, Waker};

use crate::arena::Index;

use super::queue::Injector;

/// Generation-checked handle to a task. Stays valid (and inert) after the
/// task finishes; it never aliases a later task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(pub(crate) Index);

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({:?})", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, waiting to be polled.
    Ready,
    /// Currently being polled.
    Running,
    /// Suspended until something resumes it.
    Waiting,
    /// Finished; the handle no longer refers to a live task.
    Complete,
}

pub(crate) type LocalBoxFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct TaskSlot {
    pub state: TaskState,
    /// Taken out while the task is being polled.
    pub future: Option<LocalBoxFuture>,
    /// Resumed while running; re-queue once the current poll returns.
    pub notified: bool,
}

impl TaskSlot {
    pub fn new(future: LocalBoxFuture) -> Self {
        Self {
            state: TaskState::Ready,
            future: Some(future),
            notified: false,
        }
    }
}

/// Waker that routes through the injector, so it is safe to fire from
/// any thread; the scheduler resumes the task on its next turn.
struct TaskWaker {
    task: TaskHandle,
    injector: Arc<Injector>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.injector.push(self.task);
    }
}

pub(crate) fn task_waker(task: TaskHandle, injector: Arc<Injector>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task, injector }))
}
