// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pending-operation records.
//!
//! A record ties a descriptor to the task suspended on it. Its key is the
//! payload of the descriptor's readiness registration, so the scheduler can
//! resume the right task when the event fires, and the owner of the
//! operation can find it to cancel. Keys are generation-checked: once the
//! record is released, any copy of its key resolves to nothing.

use std::os::fd::RawFd;

use crate::arena::Index;

use super::reactor::Token;
use super::task::TaskHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey(pub(crate) Index);

impl PendingKey {
    pub fn token(self) -> Token {
        Token(self.0.to_bits())
    }

    pub fn from_token(token: Token) -> Self {
        Self(Index::from_bits(token.0))
    }
}

#[derive(Debug, Clone)]
pub struct PendingOp {
    pub fd: RawFd,
    pub waiter: TaskHandle,
    /// Set once, by the canceller, right after it force-resumes `waiter`.
    pub interrupted: bool,
    /// Set when the readiness registration delivered this record's token.
    pub fired: bool,
}

impl PendingOp {
    pub fn new(fd: RawFd, waiter: TaskHandle) -> Self {
        Self {
            fd,
            waiter,
            interrupted: false,
            fired: false,
        }
    }

    /// Something other than a spurious wake has resumed the waiter.
    pub fn is_settled(&self) -> bool {
        self.fired || self.interrupted
    }
}
