// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative single-threaded runtime.
//!
//! Components:
//! - `task`     : task handle, state machine, waker
//! - `queue`    : local run queue + cross-thread injector
//! - `reactor`  : epoll readiness queue with one-shot registrations
//! - `pending`  : records tying a registration to a suspended task
//! - `timer`    : deadline heap and `Sleep`
//! - `scheduler`: the polling loop and suspend/resume contract
//! - `handle`   : `JoinHandle`

pub mod handle;
pub mod pending;
pub(crate) mod queue;
pub mod reactor;
pub mod scheduler;
pub mod task;
pub mod timer;
