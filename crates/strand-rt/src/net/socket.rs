// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket ownership for connect attempts.
//!
//! `AttemptSocket` owns the descriptor while a connect is in flight.
//! Whichever way the attempt ends, exactly one owner closes it: the
//! attempt's destructor on failure, or the `ConnectedSocket` it was handed
//! to on success. Both remove the descriptor's readiness registration
//! before closing.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::warn;

use crate::config::AddressFamily;
use crate::error::{ConnectError, SetupStage};
use crate::green::scheduler::Scheduler;

/// Per-connector counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectStats {
    /// `connect` calls that got past the running check.
    pub attempts: u64,
    pub sockets_opened: u64,
    /// Sockets closed by a failed or cancelled attempt.
    pub sockets_closed: u64,
    pub connected: u64,
    pub cancelled: u64,
}

pub(crate) type StatsCell = Rc<Cell<ConnectStats>>;

pub(crate) fn bump(stats: &Cell<ConnectStats>, f: impl FnOnce(&mut ConnectStats)) {
    let mut snapshot = stats.get();
    f(&mut snapshot);
    stats.set(snapshot);
}

/// Create a non-blocking TCP socket bound to an ephemeral wildcard port.
pub(crate) fn open(
    family: AddressFamily,
    scheduler: &Scheduler,
    stats: &StatsCell,
) -> Result<AttemptSocket, ConnectError> {
    let domain = match family {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| setup_failed(SetupStage::Create, source))?;
    let attempt = AttemptSocket::new(socket, scheduler.clone(), stats.clone());

    attempt
        .socket()
        .bind(&family.wildcard().into())
        .map_err(|source| setup_failed(SetupStage::Bind, source))?;
    attempt
        .socket()
        .set_nonblocking(true)
        .map_err(|source| setup_failed(SetupStage::NonBlocking, source))?;
    Ok(attempt)
}

fn setup_failed(stage: SetupStage, source: io::Error) -> ConnectError {
    warn!(%stage, error = %source, "socket setup failed");
    ConnectError::SocketSetupFailed { stage, source }
}

fn release(scheduler: &Scheduler, fd: RawFd) {
    if let Err(err) = scheduler.reactor().deregister(fd) {
        warn!(fd, error = %err, "failed to deregister socket");
    }
}

pub(crate) struct AttemptSocket {
    /// `None` only after hand-off to a `ConnectedSocket`.
    socket: Option<Socket>,
    scheduler: Scheduler,
    stats: StatsCell,
}

impl AttemptSocket {
    pub fn new(socket: Socket, scheduler: Scheduler, stats: StatsCell) -> Self {
        bump(&stats, |s| s.sockets_opened += 1);
        Self {
            socket: Some(socket),
            scheduler,
            stats,
        }
    }

    pub fn socket(&self) -> &Socket {
        self.socket
            .as_ref()
            .expect("attempt socket is present until handed off")
    }

    pub fn fd(&self) -> RawFd {
        self.socket().as_raw_fd()
    }

    /// Hand the descriptor, and its disabled registration, to the caller.
    pub fn into_connected(mut self, peer: SocketAddr) -> ConnectedSocket {
        ConnectedSocket {
            socket: self.socket.take(),
            peer,
            scheduler: self.scheduler.clone(),
        }
    }
}

impl Drop for AttemptSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            release(&self.scheduler, socket.as_raw_fd());
            drop(socket);
            bump(&self.stats, |s| s.sockets_closed += 1);
        }
    }
}

/// An established outbound TCP connection.
///
/// The descriptor stays known to the scheduler's reactor (with
/// notifications disabled) until the socket is dropped or converted.
pub struct ConnectedSocket {
    socket: Option<Socket>,
    peer: SocketAddr,
    scheduler: Scheduler,
}

impl ConnectedSocket {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
    }

    /// The underlying socket, for setting options.
    pub fn socket(&self) -> &Socket {
        self.socket
            .as_ref()
            .expect("connected socket is present until converted")
    }

    /// Leave the reactor and return a plain (still non-blocking) stream.
    pub fn into_std(mut self) -> TcpStream {
        let socket = self
            .socket
            .take()
            .expect("connected socket is present until converted");
        release(&self.scheduler, socket.as_raw_fd());
        socket.into()
    }
}

impl AsRawFd for ConnectedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket().as_raw_fd()
    }
}

impl fmt::Debug for ConnectedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedSocket")
            .field("fd", &self.socket.as_ref().map(|s| s.as_raw_fd()))
            .field("peer", &self.peer)
            .finish()
    }
}

impl Drop for ConnectedSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            release(&self.scheduler, socket.as_raw_fd());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::green::reactor::{Interest, Token};

    #[test]
    fn open_binds_ephemeral_nonblocking_socket() {
        let sched = Scheduler::new().unwrap();
        let stats = StatsCell::default();
        let attempt = open(AddressFamily::Ipv4, &sched, &stats).unwrap();

        let local = attempt.socket().local_addr().unwrap().as_socket().unwrap();
        assert!(local.ip().is_unspecified());
        assert_ne!(local.port(), 0);
        assert!(attempt.socket().nonblocking().unwrap());
        assert_eq!(stats.get().sockets_opened, 1);
    }

    #[test]
    fn dropped_attempt_closes_and_deregisters() {
        let sched = Scheduler::new().unwrap();
        let stats = StatsCell::default();
        let attempt = open(AddressFamily::Ipv4, &sched, &stats).unwrap();
        let fd = attempt.fd();
        sched
            .reactor()
            .register_oneshot(fd, Interest::Writable, Token(1))
            .unwrap();

        drop(attempt);
        assert!(!sched.reactor().is_registered(fd));
        assert_eq!(
            stats.get(),
            ConnectStats {
                sockets_opened: 1,
                sockets_closed: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn handed_off_socket_is_not_counted_closed() {
        let sched = Scheduler::new().unwrap();
        let stats = StatsCell::default();
        let attempt = open(AddressFamily::Ipv4, &sched, &stats).unwrap();
        let fd = attempt.fd();
        sched
            .reactor()
            .register_oneshot(fd, Interest::Writable, Token(1))
            .unwrap();
        sched.reactor().disable(fd).unwrap();

        let connected = attempt.into_connected("127.0.0.1:9".parse().unwrap());
        assert_eq!(stats.get().sockets_closed, 0);
        assert_eq!(connected.as_raw_fd(), fd);
        assert!(sched.reactor().is_registered(fd));

        let stream = connected.into_std();
        assert!(!sched.reactor().is_registered(fd));
        drop(stream);
    }
}
