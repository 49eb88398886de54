// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll readiness queue shared by every task on the scheduler.
//!
//! Registrations are one-shot (`EPOLLONESHOT`): each delivers at most one
//! token, then stays disarmed until re-registered or removed. The token is
//! the caller's correlation payload; the reactor never interprets it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

/// I/O interest for reactor registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
            Interest::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

/// Opaque payload returned by `poll` when a registration fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Per-FD registration.
struct Registration {
    token: Option<Token>,
    armed: bool,
}

/// epoll data value reserved for the notifier's eventfd.
const WAKE_DATA: u64 = u64::MAX;

/// Interrupts a blocking `poll` from any thread.
pub(crate) struct Notifier {
    wake_fd: OwnedFd,
}

impl Notifier {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            wake_fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn notify(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                8,
            );
        }
    }
}

/// epoll-backed readiness queue. Single-threaded; only the notifier crosses threads.
pub struct Reactor {
    epoll_fd: OwnedFd,
    notifier: Arc<Notifier>,
    /// FD → registration mapping.
    registrations: RefCell<HashMap<RawFd, Registration>>,
    max_events: usize,
}

impl Reactor {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let reactor = Self {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            notifier: Arc::new(Notifier::new()?),
            registrations: RefCell::new(HashMap::new()),
            max_events: max_events.max(1),
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_DATA,
        };
        let ret = unsafe {
            libc::epoll_ctl(
                reactor.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                reactor.notifier.wake_fd.as_raw_fd(),
                &mut ev,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(reactor)
    }

    /// Arm a one-shot registration for `fd`, replacing any previous one.
    pub fn register_oneshot(&self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        let mut regs = self.registrations.borrow_mut();
        let op = if regs.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, interest.to_epoll_events() | libc::EPOLLONESHOT as u32)?;
        regs.insert(
            fd,
            Registration {
                token: Some(token),
                armed: true,
            },
        );
        Ok(())
    }

    /// Stop notifications for `fd` and drop its payload, keeping the kernel entry.
    pub fn disable(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.borrow_mut();
        let Some(reg) = regs.get_mut(&fd) else {
            return Ok(());
        };
        // ERR/HUP are always reported; ONESHOT keeps them from repeating.
        self.ctl(libc::EPOLL_CTL_MOD, fd, libc::EPOLLONESHOT as u32)?;
        reg.token = None;
        reg.armed = false;
        Ok(())
    }

    /// Remove a file descriptor from the reactor. Unknown FDs are ignored.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut regs = self.registrations.borrow_mut();
        if regs.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(
                    self.epoll_fd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected if FD was already closed.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` (forever if `None`) and return the tokens of
    /// registrations that fired. Each fired registration is disarmed.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Token>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                events.as_mut_ptr(),
                self.max_events as i32,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut fired = Vec::new();
        let mut regs = self.registrations.borrow_mut();
        for ev in &events[..n as usize] {
            let data = ev.u64;
            if data == WAKE_DATA {
                self.notifier.drain();
                continue;
            }
            // Entries removed or disabled since the kernel queued the event are skipped.
            if let Some(reg) = regs.get_mut(&(data as RawFd)) {
                if reg.armed {
                    reg.armed = false;
                    fired.extend(reg.token);
                }
            }
        }
        Ok(fired)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.borrow().contains_key(&fd)
    }

    pub fn registered(&self) -> usize {
        self.registrations.borrow().len()
    }

    /// Registrations that can still deliver a token.
    pub fn armed(&self) -> usize {
        self.registrations
            .borrow()
            .values()
            .filter(|reg| reg.armed)
            .count()
    }

    pub(crate) fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Round up so a sub-millisecond remainder doesn't turn into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}
