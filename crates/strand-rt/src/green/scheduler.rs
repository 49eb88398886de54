// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative scheduler.
//!
//! Tasks run one at a time on the thread that calls `run`. A task gives up
//! control only where its future returns `Pending`; it comes back when
//! something calls `resume` with its handle (a readiness event, a timer,
//! a waker, or another task). Between task polls the scheduler delivers
//! wakes, fires timers and, when nothing is runnable, blocks in the
//! reactor.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::arena::Arena;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

use super::handle::{JoinHandle, JoinSlot};
use super::pending::{PendingKey, PendingOp};
use super::queue::{Injector, RunQueue};
use super::reactor::{Reactor, Token};
use super::task::{task_waker, TaskHandle, TaskSlot, TaskState};
use super::timer::{Sleep, TimerQueue};

/// Cheap-to-clone handle to the scheduler. Not `Send`: every clone lives
/// on the scheduler's thread.
///
/// Tasks usually hold a clone, so a scheduler abandoned with unfinished
/// tasks (after `run` returns an error) keeps itself alive until
/// `shutdown` drops them.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    tasks: RefCell<Arena<TaskSlot>>,
    queue: RunQueue,
    /// Task being polled right now.
    current: Cell<Option<TaskHandle>>,
    reactor: Reactor,
    /// Records correlating readiness registrations with suspended tasks.
    pending: RefCell<Arena<PendingOp>>,
    timers: RefCell<TimerQueue>,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> io::Result<Self> {
        let reactor = Reactor::new(config.max_events)?;
        let injector = std::sync::Arc::new(Injector::new(reactor.notifier()));
        Ok(Self {
            inner: Rc::new(Inner {
                config,
                tasks: RefCell::new(Arena::new()),
                queue: RunQueue::new(injector),
                current: Cell::new(None),
                reactor,
                pending: RefCell::new(Arena::new()),
                timers: RefCell::new(TimerQueue::default()),
            }),
        })
    }

    /// Queue a new task. It first runs on the next turn of `run`.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(JoinSlot::new());
        let out = slot.clone();
        let task = TaskHandle(self.inner.tasks.borrow_mut().insert(TaskSlot::new(Box::pin(
            async move {
                out.complete(future.await);
            },
        ))));
        self.inner.queue.push(task);
        trace!(?task, "task spawned");
        JoinHandle::new(task, slot)
    }

    /// Drive tasks until none are left.
    pub fn run(&self) -> Result<(), SchedulerError> {
        debug_assert!(
            self.inner.current.get().is_none(),
            "run called from inside a task"
        );
        let interval = self.inner.config.event_interval.max(1);
        let mut ticks: u32 = 0;

        loop {
            self.deliver_wakes();
            self.fire_timers();

            if let Some(task) = self.inner.queue.pop() {
                self.run_task(task);
                ticks = ticks.wrapping_add(1);
                if ticks % interval == 0 {
                    self.poll_reactor(Some(Duration::ZERO))?;
                }
                continue;
            }

            let live = self.live_tasks();
            if live == 0 {
                return Ok(());
            }

            let timeout = self
                .inner
                .timers
                .borrow()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if timeout.is_none()
                && self.inner.reactor.armed() == 0
                && self.inner.queue.injector().is_empty()
            {
                debug!(suspended = live, "no event can resume the remaining tasks");
                return Err(SchedulerError::Stalled { suspended: live });
            }
            self.poll_reactor(timeout)?;
        }
    }

    /// Spawn `future`, run to completion, and return its output.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, SchedulerError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = self.spawn(future);
        self.run()?;
        handle.try_take().ok_or(SchedulerError::Incomplete)
    }

    /// Handle of the task being polled, `None` outside a task.
    pub fn current_task(&self) -> Option<TaskHandle> {
        self.inner.current.get()
    }

    /// Suspend the current task until someone calls `resume` on it.
    pub fn suspend(&self) -> Suspend {
        Suspend { yielded: false }
    }

    /// Mark a suspended task runnable. Returns without running it.
    ///
    /// Resuming a task that is already queued or finished does nothing.
    /// Resuming the running task re-queues it when its poll returns.
    pub fn resume(&self, task: TaskHandle) {
        let mut tasks = self.inner.tasks.borrow_mut();
        let Some(slot) = tasks.get_mut(task.0) else {
            return;
        };
        match slot.state {
            TaskState::Waiting => {
                slot.state = TaskState::Ready;
                drop(tasks);
                self.inner.queue.push(task);
            }
            TaskState::Running => slot.notified = true,
            TaskState::Ready | TaskState::Complete => {}
        }
    }

    /// Give every other runnable task a turn before continuing.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), Instant::now() + duration)
    }

    /// The readiness queue shared by every task on this scheduler.
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    pub fn task_state(&self, task: TaskHandle) -> TaskState {
        self.inner
            .tasks
            .borrow()
            .get(task.0)
            .map_or(TaskState::Complete, |slot| slot.state)
    }

    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Record that `waiter` is suspended on `fd`. The key's token is the
    /// payload to attach to the fd's readiness registration.
    pub fn park(&self, fd: RawFd, waiter: TaskHandle) -> PendingKey {
        PendingKey(
            self.inner
                .pending
                .borrow_mut()
                .insert(PendingOp::new(fd, waiter)),
        )
    }

    /// Run `f` on a live record. The scheduler must not be re-entered from `f`.
    pub fn with_pending<R>(&self, key: PendingKey, f: impl FnOnce(&mut PendingOp) -> R) -> Option<R> {
        self.inner.pending.borrow_mut().get_mut(key.0).map(f)
    }

    /// Release a record. Every copy of `key` is dead afterwards.
    pub fn unpark(&self, key: PendingKey) -> Option<PendingOp> {
        self.inner.pending.borrow_mut().remove(key.0)
    }

    pub fn pending_ops(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Drop every remaining task. Their destructors release whatever
    /// sockets, registrations and records they still hold.
    pub fn shutdown(&self) {
        let tasks = self.inner.tasks.borrow_mut().drain();
        self.inner.queue.clear();
        self.inner.timers.borrow_mut().clear();
        self.inner.queue.injector().take_all();
        if !tasks.is_empty() {
            debug!(dropped = tasks.len(), "scheduler shut down with unfinished tasks");
        }
        // Dropped here, with no scheduler borrow held.
        drop(tasks);
    }

    pub(crate) fn add_timer(&self, deadline: Instant, task: TaskHandle) {
        self.inner.timers.borrow_mut().push(deadline, task);
    }

    /// Poll a single task. Handles completion and re-parking.
    fn run_task(&self, task: TaskHandle) {
        let future = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(task.0) else {
                return;
            };
            if slot.state != TaskState::Ready {
                return;
            }
            slot.state = TaskState::Running;
            slot.future.take()
        };
        let Some(mut future) = future else {
            return;
        };

        let waker = task_waker(task, self.inner.queue.injector().clone());
        let mut cx = Context::from_waker(&waker);
        let prev = self.inner.current.replace(Some(task));
        let poll = future.as_mut().poll(&mut cx);
        self.inner.current.set(prev);

        match poll {
            Poll::Ready(()) => {
                self.inner.tasks.borrow_mut().remove(task.0);
                trace!(?task, "task complete");
            }
            Poll::Pending => {
                let mut tasks = self.inner.tasks.borrow_mut();
                if let Some(slot) = tasks.get_mut(task.0) {
                    slot.future = Some(future);
                    if slot.notified {
                        // Resumed during its own poll.
                        slot.notified = false;
                        slot.state = TaskState::Ready;
                        drop(tasks);
                        self.inner.queue.push(task);
                    } else {
                        slot.state = TaskState::Waiting;
                    }
                }
            }
        }
    }

    fn deliver_wakes(&self) {
        for task in self.inner.queue.injector().take_all() {
            self.resume(task);
        }
    }

    fn fire_timers(&self) {
        let due = self.inner.timers.borrow_mut().expired(Instant::now());
        for task in due {
            self.resume(task);
        }
    }

    fn poll_reactor(&self, timeout: Option<Duration>) -> Result<(), SchedulerError> {
        for token in self.inner.reactor.poll(timeout)? {
            self.dispatch(token);
        }
        Ok(())
    }

    /// Route a fired registration to the task parked on it.
    fn dispatch(&self, token: Token) {
        let key = PendingKey::from_token(token);
        let waiter = self.with_pending(key, |op| {
            op.fired = true;
            op.waiter
        });
        match waiter {
            Some(task) => self.resume(task),
            None => trace!(?token, "readiness for a released record"),
        }
    }
}

/// Future returned by [`Scheduler::suspend`].
pub struct Suspend {
    yielded: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // The scheduler only polls a waiting task again after a resume.
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
