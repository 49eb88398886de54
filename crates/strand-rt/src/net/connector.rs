// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking outbound TCP connector.
//!
//! `connect` resolves the target, opens a non-blocking socket and starts
//! the connection. When the kernel reports it in progress, the calling
//! task parks on a pending-operation record whose key is the payload of a
//! one-shot write-readiness registration, then suspends. One of two things
//! resumes it: the registration firing, or `stop` running in another task.
//! Both go through `Scheduler::resume`, and the resumed task clears the
//! connector's reference to the record before it looks at why it woke.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::config::ConnectorConfig;
use crate::error::ConnectError;
use crate::green::pending::{PendingKey, PendingOp};
use crate::green::reactor::Interest;
use crate::green::scheduler::Scheduler;

use super::resolve::{choose_address, Resolve, SystemResolver};
use super::socket::{self, bump, AttemptSocket, ConnectStats, ConnectedSocket, StatsCell};

/// Where the current (or last) `connect` call is.
///
/// Every `connect` returns to `Idle` when it finishes; the outcome
/// (connected, failed or cancelled) is carried by its result only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    AwaitingAddress,
    /// Socket created, connect in progress, task suspended.
    AwaitingConnect,
    /// Woken by readiness or cancellation, deciding the outcome.
    Resumed,
}

/// Connects to one `host:port`, one attempt at a time.
///
/// Shared between the task calling `connect` and whoever may `stop` it,
/// typically through an `Rc`.
pub struct Connector {
    scheduler: Scheduler,
    host: String,
    port: u16,
    config: ConnectorConfig,
    resolver: Rc<dyn Resolve>,
    running: Cell<bool>,
    /// Record of the in-flight connect, if one is suspended.
    pending: Cell<Option<PendingKey>>,
    state: Cell<ConnectState>,
    rng: RefCell<StdRng>,
    stats: StatsCell,
}

impl Connector {
    /// A connector using the OS resolver. Not running until `start`.
    pub fn new(scheduler: &Scheduler, host: impl Into<String>, port: u16) -> Self {
        Self::with_resolver(
            scheduler,
            host,
            port,
            ConnectorConfig::default(),
            Rc::new(SystemResolver),
        )
    }

    pub fn with_resolver(
        scheduler: &Scheduler,
        host: impl Into<String>,
        port: u16,
        config: ConnectorConfig,
        resolver: Rc<dyn Resolve>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            scheduler: scheduler.clone(),
            host: host.into(),
            port,
            config,
            resolver,
            running: Cell::new(false),
            pending: Cell::new(None),
            state: Cell::new(ConnectState::Idle),
            rng: RefCell::new(rng),
            stats: StatsCell::default(),
        }
    }

    pub fn start(&self) {
        debug_assert!(!self.running.get(), "connector already running");
        self.running.set(true);
    }

    /// Make future `connect` calls fail with `Cancelled`, and cancel the one
    /// in flight, if any. Returns before the cancelled call observes it.
    pub fn stop(&self) {
        debug_assert!(self.running.get(), "connector already stopped");
        self.running.set(false);

        let Some(key) = self.pending.get() else {
            return;
        };
        let target = self
            .scheduler
            .with_pending(key, |op| (!op.interrupted).then_some((op.fd, op.waiter)))
            .flatten();
        let Some((fd, waiter)) = target else {
            return;
        };

        // Deregister first so the event can't fire into a record on its way out.
        if let Err(err) = self.scheduler.reactor().deregister(fd) {
            warn!(fd, error = %err, "failed to deregister pending connect");
        }
        self.scheduler.resume(waiter);
        self.scheduler.with_pending(key, |op| op.interrupted = true);
        debug!(host = %self.host, port = self.port, fd, "pending connect interrupted");
    }

    /// Connect to the target. Suspends the calling task while the kernel
    /// completes the connection; must run inside a scheduler task.
    pub async fn connect(&self) -> Result<ConnectedSocket, ConnectError> {
        debug_assert!(
            self.pending.get().is_none(),
            "connect is already pending on this connector"
        );
        if !self.running.get() {
            debug!(host = %self.host, port = self.port, "connect refused, connector stopped");
            return Err(ConnectError::Cancelled);
        }
        bump(&self.stats, |s| s.attempts += 1);

        let result = self.attempt().await;
        self.enter(ConnectState::Idle);
        match &result {
            Ok(_) => bump(&self.stats, |s| s.connected += 1),
            Err(ConnectError::Cancelled) => bump(&self.stats, |s| s.cancelled += 1),
            Err(_) => {}
        }
        result
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// A `connect` call is suspended waiting for the kernel.
    pub fn is_pending(&self) -> bool {
        self.pending.get().is_some()
    }

    pub fn state(&self) -> ConnectState {
        self.state.get()
    }

    pub fn stats(&self) -> ConnectStats {
        self.stats.get()
    }

    async fn attempt(&self) -> Result<ConnectedSocket, ConnectError> {
        self.enter(ConnectState::AwaitingAddress);
        let addr = self.pick_address()?;
        let attempt = socket::open(self.config.family, &self.scheduler, &self.stats)?;
        let started = attempt.socket().connect(&addr.into());
        self.settle(started, attempt, addr).await
    }

    /// Act on the outcome of the non-blocking `connect` syscall.
    async fn settle(
        &self,
        started: io::Result<()>,
        attempt: AttemptSocket,
        addr: SocketAddr,
    ) -> Result<ConnectedSocket, ConnectError> {
        match started {
            Ok(()) => {
                debug!(%addr, "connected immediately");
                Ok(attempt.into_connected(addr))
            }
            Err(err) if connect_in_progress(&err) => self.await_connect(attempt, addr).await,
            Err(source) => {
                warn!(%addr, error = %source, "connect failed");
                Err(ConnectError::ConnectFailed { addr, source })
            }
        }
    }

    fn pick_address(&self) -> Result<SocketAddr, ConnectError> {
        let resolution_failed = |source: io::Error| {
            warn!(host = %self.host, port = self.port, error = %source, "resolution failed");
            ConnectError::ResolutionFailed {
                host: self.host.clone(),
                port: self.port,
                source,
            }
        };

        let candidates: Vec<SocketAddr> = self
            .resolver
            .resolve(&self.host, self.port)
            .map_err(&resolution_failed)?
            .into_iter()
            .filter(|addr| self.config.family.matches(addr))
            .collect();
        let addr = choose_address(&candidates, &mut *self.rng.borrow_mut()).ok_or_else(|| {
            resolution_failed(io::Error::new(
                io::ErrorKind::NotFound,
                "no address for the configured family",
            ))
        })?;

        debug!(host = %self.host, %addr, candidates = candidates.len(), "address selected");
        Ok(addr)
    }

    /// Park on the socket's write readiness until the kernel settles the
    /// connect or `stop` interrupts it.
    async fn await_connect(
        &self,
        attempt: AttemptSocket,
        addr: SocketAddr,
    ) -> Result<ConnectedSocket, ConnectError> {
        let sched = &self.scheduler;
        let fd = attempt.fd();
        let waiter = sched.current_task().ok_or_else(|| {
            integration_failed(
                "current task",
                io::Error::new(io::ErrorKind::Other, "connect awaited outside a scheduler task"),
            )
        })?;

        let mut parked = Parked::new(self, sched.park(fd, waiter));
        sched
            .reactor()
            .register_oneshot(fd, Interest::Writable, parked.key.token())
            .map_err(|source| integration_failed("register write readiness", source))?;
        self.enter(ConnectState::AwaitingConnect);
        debug!(%addr, fd, "connect in progress");

        loop {
            sched.suspend().await;
            if sched
                .with_pending(parked.key, |op| op.is_settled())
                .unwrap_or(true)
            {
                break;
            }
        }

        let op = parked.unpark().ok_or_else(|| {
            integration_failed(
                "release pending record",
                io::Error::from(io::ErrorKind::NotFound),
            )
        })?;
        self.enter(ConnectState::Resumed);

        if op.interrupted {
            // stop() already removed the registration; dropping `attempt` closes.
            debug!(%addr, fd, "connect cancelled");
            return Err(ConnectError::Cancelled);
        }

        sched
            .reactor()
            .disable(fd)
            .map_err(|source| integration_failed("disable write readiness", source))?;
        match attempt.socket().take_error() {
            Err(source) => Err(integration_failed("query socket error", source)),
            Ok(Some(source)) => {
                warn!(%addr, error = %source, "connect failed");
                Err(ConnectError::ConnectFailed { addr, source })
            }
            Ok(None) => {
                debug!(%addr, fd, "connected");
                Ok(attempt.into_connected(addr))
            }
        }
    }

    fn enter(&self, state: ConnectState) {
        let prev = self.state.replace(state);
        trace!(?prev, ?state, "connector state");
    }
}

/// The connector's published reference to a parked record. Unparking
/// clears the reference and releases the record together; dropping an
/// unreleased one (early return, or the future being dropped) does the same.
struct Parked<'a> {
    connector: &'a Connector,
    key: PendingKey,
    released: bool,
}

impl<'a> Parked<'a> {
    fn new(connector: &'a Connector, key: PendingKey) -> Self {
        connector.pending.set(Some(key));
        Self {
            connector,
            key,
            released: false,
        }
    }

    fn unpark(&mut self) -> Option<PendingOp> {
        self.released = true;
        self.connector.pending.set(None);
        self.connector.scheduler.unpark(self.key)
    }
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.unpark();
            self.connector.enter(ConnectState::Idle);
        }
    }
}

/// The kernel accepted the connect and will finish it asynchronously.
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::Interrupted
}

fn integration_failed(op: &'static str, source: io::Error) -> ConnectError {
    warn!(op, error = %source, "scheduler integration failed");
    ConnectError::SchedulerIntegrationFailed { op, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::net::resolve::StaticResolver;
    use socket2::Socket;
    use std::fs::File;
    use std::future::Future;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::pin::pin;
    use std::sync::Arc;
    use std::task::{Context, Poll, Wake, Waker};
    use std::time::Duration;

    fn blackhole() -> SocketAddr {
        "192.0.2.1:80".parse().unwrap()
    }

    fn connector(sched: &Scheduler) -> Rc<Connector> {
        let resolver = StaticResolver::new().with_host("peer.test", vec![blackhole()]);
        let connector = Rc::new(Connector::with_resolver(
            sched,
            "peer.test",
            80,
            ConnectorConfig::default(),
            Rc::new(resolver),
        ));
        connector.start();
        connector
    }

    /// A socket that stays unwritable until its peer drains it. Stands in
    /// for a TCP socket whose handshake is still in flight.
    fn stalled_pair() -> (Socket, UnixStream) {
        let (local, peer) = UnixStream::pair().unwrap();
        let local = Socket::from(local);
        local.set_nonblocking(true).unwrap();
        local.set_send_buffer_size(4096).unwrap();
        peer.set_nonblocking(true).unwrap();

        let chunk = [0u8; 4096];
        loop {
            match (&local).write(&chunk) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("fill failed: {}", e),
            }
        }
        (local, peer)
    }

    fn drain(peer: &mut UnixStream) {
        let mut buf = [0u8; 8192];
        loop {
            match peer.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("drain failed: {}", e),
            }
        }
    }

    fn spawn_await(
        sched: &Scheduler,
        connector: &Rc<Connector>,
        socket: Socket,
    ) -> (crate::green::handle::JoinHandle<Result<ConnectedSocket, ConnectError>>, RawFd) {
        let attempt = AttemptSocket::new(socket, sched.clone(), connector.stats.clone());
        let fd = attempt.fd();
        let c = connector.clone();
        let handle = sched.spawn(async move { c.await_connect(attempt, blackhole()).await });
        (handle, fd)
    }

    #[test]
    fn stop_cancels_in_progress_connect() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (socket, _peer) = stalled_pair();
        let (connecting, fd) = spawn_await(&sched, &connector, socket);

        let (c, s) = (connector.clone(), sched.clone());
        sched.spawn(async move {
            assert!(c.is_pending());
            assert_eq!(c.state(), ConnectState::AwaitingConnect);
            assert!(s.reactor().is_registered(fd));
            c.stop();
            // Registration gone before stop returns; the record waits for its owner.
            assert!(!s.reactor().is_registered(fd));
            assert_eq!(s.pending_ops(), 1);
        });

        sched.run().unwrap();
        assert!(matches!(
            connecting.try_take().unwrap(),
            Err(ConnectError::Cancelled)
        ));
        assert!(!connector.is_pending());
        assert!(!connector.is_running());
        assert_eq!(sched.pending_ops(), 0);
        assert_eq!(sched.reactor().registered(), 0);
        let stats = connector.stats();
        assert_eq!((stats.sockets_opened, stats.sockets_closed), (1, 1));
    }

    #[test]
    fn cancellation_wins_over_fired_event() {
        // Poll the reactor after every task so the event lands before stop runs.
        let sched = Scheduler::with_config(SchedulerConfig {
            event_interval: 1,
            ..Default::default()
        })
        .unwrap();
        let connector = connector(&sched);
        let (local, _peer) = UnixStream::pair().unwrap();
        let (connecting, _fd) = spawn_await(&sched, &connector, Socket::from(local));

        let (c, s) = (connector.clone(), sched.clone());
        sched.spawn(async move {
            let key = c.pending.get().unwrap();
            assert_eq!(s.with_pending(key, |op| op.fired), Some(true));
            c.stop();
        });

        sched.run().unwrap();
        assert!(matches!(
            connecting.try_take().unwrap(),
            Err(ConnectError::Cancelled)
        ));
        assert_eq!(sched.reactor().registered(), 0);
        assert_eq!(connector.stats().sockets_closed, 1);
    }

    #[test]
    fn readiness_completes_in_progress_connect() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (socket, mut peer) = stalled_pair();
        let (connecting, fd) = spawn_await(&sched, &connector, socket);

        let c = connector.clone();
        sched.spawn(async move {
            assert!(c.is_pending());
            drain(&mut peer);
        });

        sched.run().unwrap();
        let connected = connecting.try_take().unwrap().unwrap();
        assert_eq!(connected.as_raw_fd(), fd);
        assert_eq!(connected.peer_addr(), blackhole());
        assert!(!connector.is_pending());
        assert_eq!(sched.pending_ops(), 0);
        // Kept, but disabled, until the connected socket goes away.
        assert!(sched.reactor().is_registered(fd));
        assert_eq!(sched.reactor().armed(), 0);
        assert_eq!(connector.stats().sockets_closed, 0);

        drop(connected);
        assert_eq!(sched.reactor().registered(), 0);
    }

    #[test]
    fn timer_task_can_bound_a_connect() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (socket, _peer) = stalled_pair();
        let (connecting, _fd) = spawn_await(&sched, &connector, socket);

        let (c, s) = (connector.clone(), sched.clone());
        sched.spawn(async move {
            s.sleep(Duration::from_millis(20)).await;
            if c.is_pending() {
                c.stop();
            }
        });

        sched.run().unwrap();
        assert!(connecting.try_take().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn outside_a_task_fails_and_cleans_up() {
        struct Noop;
        impl Wake for Noop {
            fn wake(self: Arc<Self>) {}
        }

        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (socket, _peer) = stalled_pair();
        let attempt = AttemptSocket::new(socket, sched.clone(), connector.stats.clone());

        let waker = Waker::from(Arc::new(Noop));
        let mut cx = Context::from_waker(&waker);
        let fut = pin!(connector.await_connect(attempt, blackhole()));
        match fut.poll(&mut cx) {
            Poll::Ready(Err(ConnectError::SchedulerIntegrationFailed { op, .. })) => {
                assert_eq!(op, "current task")
            }
            other => panic!("unexpected {:?}", other.map(|r| r.map(|_| ()))),
        }
        assert!(!connector.is_pending());
        assert_eq!(connector.stats().sockets_closed, 1);
    }

    #[test]
    fn shutdown_releases_suspended_connect() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (socket, _peer) = stalled_pair();
        let (connecting, fd) = spawn_await(&sched, &connector, socket);

        // Only the suspended connect is left and nothing will make it writable.
        let s = sched.clone();
        sched.spawn(async move {
            s.sleep(Duration::from_millis(5)).await;
            s.shutdown();
        });
        sched.run().unwrap();

        assert!(!connecting.is_finished());
        assert!(!connector.is_pending());
        assert_eq!(connector.state(), ConnectState::Idle);
        assert!(!sched.reactor().is_registered(fd));
        assert_eq!(sched.pending_ops(), 0);
        assert_eq!(connector.stats().sockets_closed, 1);
    }

    #[test]
    fn stop_without_pending_only_clears_running() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        connector.stop();
        assert!(!connector.is_running());
        connector.start();
        assert!(connector.is_running());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "already stopped")]
    fn double_stop_is_a_precondition_violation() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        connector.stop();
        connector.stop();
    }

    #[test]
    fn immediate_success_skips_readiness_wait() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (local, _peer) = UnixStream::pair().unwrap();
        let attempt = AttemptSocket::new(Socket::from(local), sched.clone(), connector.stats.clone());
        let fd = attempt.fd();
        connector.enter(ConnectState::AwaitingAddress);

        let c = connector.clone();
        let connected = sched
            .block_on(async move { c.settle(Ok(()), attempt, blackhole()).await })
            .unwrap()
            .unwrap();

        assert_eq!(connected.as_raw_fd(), fd);
        assert_eq!(connected.peer_addr(), blackhole());
        // Never parked: no record, no registration, no state change.
        assert_eq!(connector.state(), ConnectState::AwaitingAddress);
        assert!(!connector.is_pending());
        assert_eq!(sched.pending_ops(), 0);
        assert!(!sched.reactor().is_registered(fd));
        assert_eq!(connector.stats().sockets_closed, 0);
    }

    #[test]
    fn immediate_refusal_closes_socket() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        let (local, _peer) = UnixStream::pair().unwrap();
        let attempt = AttemptSocket::new(Socket::from(local), sched.clone(), connector.stats.clone());

        let c = connector.clone();
        let refused = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        let result = sched
            .block_on(async move { c.settle(Err(refused), attempt, blackhole()).await })
            .unwrap();

        match result {
            Err(ConnectError::ConnectFailed { addr, source }) => {
                assert_eq!(addr, blackhole());
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected ConnectFailed, got {:?}", other),
        }
        assert_eq!(sched.pending_ops(), 0);
        assert_eq!(sched.reactor().registered(), 0);
        assert_eq!(connector.stats().sockets_closed, 1);
    }

    #[test]
    fn registration_failure_cleans_up() {
        let sched = Scheduler::new().unwrap();
        let connector = connector(&sched);
        // epoll refuses descriptors without poll support.
        let null = OwnedFd::from(File::open("/dev/null").unwrap());
        let (connecting, fd) = spawn_await(&sched, &connector, Socket::from(null));

        sched.run().unwrap();
        match connecting.try_take().unwrap() {
            Err(ConnectError::SchedulerIntegrationFailed { op, .. }) => {
                assert_eq!(op, "register write readiness")
            }
            other => panic!("expected SchedulerIntegrationFailed, got {:?}", other),
        }
        assert!(!connector.is_pending());
        assert_eq!(connector.state(), ConnectState::Idle);
        assert_eq!(sched.pending_ops(), 0);
        assert!(!sched.reactor().is_registered(fd));
        let stats = connector.stats();
        assert_eq!((stats.sockets_opened, stats.sockets_closed), (1, 1));
    }

    #[test]
    fn in_progress_detection() {
        assert!(connect_in_progress(&io::Error::from_raw_os_error(libc::EINPROGRESS)));
        assert!(connect_in_progress(&io::Error::from_raw_os_error(libc::EINTR)));
        assert!(!connect_in_progress(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        assert!(!connect_in_progress(&io::Error::from_raw_os_error(libc::ENETUNREACH)));
    }
}
