// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Join handle for spawned tasks.
//!
//! The spawned future writes its output into a shared slot; the handle
//! reads it back, either after `run` returns or by awaiting it from
//! another task.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use super::task::TaskHandle;

/// Typed result slot shared between the spawned future and its handle.
pub(crate) struct JoinSlot<T> {
    value: RefCell<Option<T>>,
    done: Cell<bool>,
    joiner: RefCell<Option<Waker>>,
}

impl<T> JoinSlot<T> {
    pub fn new() -> Self {
        Self {
            value: RefCell::new(None),
            done: Cell::new(false),
            joiner: RefCell::new(None),
        }
    }

    pub fn complete(&self, value: T) {
        *self.value.borrow_mut() = Some(value);
        self.done.set(true);
        if let Some(waker) = self.joiner.borrow_mut().take() {
            waker.wake();
        }
    }
}

pub struct JoinHandle<T> {
    task: TaskHandle,
    slot: Rc<JoinSlot<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskHandle, slot: Rc<JoinSlot<T>>) -> Self {
        Self { task, slot }
    }

    pub fn task(&self) -> TaskHandle {
        self.task
    }

    pub fn is_finished(&self) -> bool {
        self.slot.done.get()
    }

    /// Take the output if the task has finished. Returns `None` before
    /// completion and after the value was already taken.
    pub fn try_take(&self) -> Option<T> {
        self.slot.value.borrow_mut().take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.slot.value.borrow_mut().take() {
            return Poll::Ready(value);
        }
        assert!(
            !self.slot.done.get(),
            "JoinHandle polled after its output was taken"
        );
        *self.slot.joiner.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}
