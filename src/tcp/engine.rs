//! The TCP socket engine: event loop, connect/accept state machines and
//! lifecycle management.
//!
//! Not thread-safe - use TcpHandle for cross-thread operation.

use super::interface::Command;
use super::ops::{QueuedRead, QueuedWrite, ReadOp, WriteOp};
use super::tls::{TlsOptions, TlsSession};
use super::*;
use crate::buffer::{PreBuffer, SocketBuffer};
use crate::error::Error;
use crate::resolver::{self, Resolved};
use crate::timer::{Timer, TimerKind, TimerQueue};
use ::config::Config;

use mio::net::TcpListener;
#[cfg(unix)]
use mio::net::UnixListener;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

// One in-flight connect attempt, registered for writability.
#[derive(Debug)]
struct Attempt {
    stream: Stream,
    desc: String,
}

// Connect-phase state: candidate addresses per family plus up to two racing
// attempts (the preferred family starts immediately, the alternate after a
// handicap delay).
#[derive(Debug)]
struct ConnectState {
    remaining_v4: VecDeque<SocketAddr>,
    remaining_v6: VecDeque<SocketAddr>,
    bind: Option<resolver::BindAddrs>,
    primary: Option<Attempt>,
    alternate: Option<Attempt>,
    primary_v6: bool,
}

impl ConnectState {
    fn new(bind: Option<resolver::BindAddrs>) -> Self {
        Self {
            remaining_v4: VecDeque::new(),
            remaining_v6: VecDeque::new(),
            bind,
            primary: None,
            alternate: None,
            primary_v6: false,
        }
    }

    fn pop_family(&mut self, v6: bool) -> Option<SocketAddr> {
        if v6 {
            self.remaining_v6.pop_front()
        } else {
            self.remaining_v4.pop_front()
        }
    }
}

/// Event-driven TCP (and unix-domain) socket with queued reads and writes.
///
/// Each socket owns its own mio `Poll`; the thread calling
/// [`fetch_events()`](Self::fetch_events) drives all I/O. Operations are
/// accepted from any thread through a [`TcpHandle`].
#[derive(Debug)]
pub struct TcpSocket {
    pub(super) flags: SocketFlags,
    // Bumped on every close; deferred completions (DNS results, timers)
    // carry the generation they were issued under and are discarded when it
    // no longer matches.
    pub(super) generation: u64,
    pub(super) tunables: Tunables,
    pub(super) poll: Poll,
    waker: Arc<Waker>,
    sender: Sender<Command>,
    receiver: Receiver<Command>,
    pub(super) interest: Interest,

    pub(super) stream: Option<Stream>,
    connecting: Option<ConnectState>,
    listener_v4: Option<TcpListener>,
    listener_v6: Option<TcpListener>,
    #[cfg(unix)]
    unix_listener: Option<UnixListener>,
    #[cfg(unix)]
    unix_listen_path: Option<std::path::PathBuf>,

    pub(super) read_queue: VecDeque<QueuedRead>,
    pub(super) write_queue: VecDeque<QueuedWrite>,
    pub(super) current_read: Option<ReadOp>,
    pub(super) current_write: Option<WriteOp>,
    pub(super) pre_buffer: PreBuffer,
    pub(super) tls: Option<TlsSession>,
    pub(super) pending_tls: Option<Arc<TlsOptions>>,

    pub(super) timers: TimerQueue,
    connect_timer: Option<u64>,
    alternate_timer: Option<u64>,
    pub(super) read_timer: Option<u64>,
    pub(super) write_timer: Option<u64>,

    pub(super) events: Vec<TcpEvent>,
}

// ============================================================================
// Constructors
// ============================================================================

impl TcpSocket {
    /// Creates a new socket from configuration.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a new socket with configuration namespacing: `{name}.{key}`
    /// is consulted before the bare `{key}`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::with_tunables(Tunables::from_config(config, name))
    }

    fn with_tunables(tunables: Tunables) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (sender, receiver) = channel();
        let pre_buffer = PreBuffer::with_capacity(tunables.pre_buffer_capacity);

        Ok(Self {
            flags: SocketFlags::empty(),
            generation: 1,
            tunables,
            poll,
            waker,
            sender,
            receiver,
            interest: Interest::READABLE,
            stream: None,
            connecting: None,
            listener_v4: None,
            listener_v6: None,
            #[cfg(unix)]
            unix_listener: None,
            #[cfg(unix)]
            unix_listen_path: None,
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            current_read: None,
            current_write: None,
            pre_buffer,
            tls: None,
            pending_tls: None,
            timers: TimerQueue::new(),
            connect_timer: None,
            alternate_timer: None,
            read_timer: None,
            write_timer: None,
            events: Vec::new(),
        })
    }

    // Wraps a stream produced by a listener. The child owns its own reactor
    // and inherits the parent's tunables.
    fn from_accepted(mut stream: Stream, tunables: Tunables) -> Result<Self, Error> {
        if let Stream::Tcp(s) = &stream {
            s.set_nodelay(true)?;
        }
        let mut socket = Self::with_tunables(tunables)?;
        socket
            .poll
            .registry()
            .register(&mut stream, SOCK, Interest::READABLE)
            .expect("Failed to register connection");
        let local = stream.local_endpoint();
        let peer = stream.peer_endpoint();
        socket.stream = Some(stream);
        socket.flags = SocketFlags::STARTED | SocketFlags::CONNECTED;
        socket.events.push(TcpEvent::Connected { local, peer });
        Ok(socket)
    }

    /// Gets a thread-safe handle for operating this socket from other
    /// threads.
    pub fn handle(&self) -> TcpHandle {
        TcpHandle {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl TcpSocket {
    /// Starts a connect to `host:port`. Resolution runs on a helper thread;
    /// establishment is reported by [`TcpEvent::Connected`].
    #[instrument(skip(self))]
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.connect_with_interface(host, port, None, timeout)
    }

    /// Like [`connect`](Self::connect), binding the local side to the given
    /// interface specification first (`"en0"`, `"192.168.1.10"`, ...).
    #[instrument(skip(self))]
    pub fn connect_via_interface(
        &mut self,
        host: &str,
        port: u16,
        interface: &str,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.connect_with_interface(host, port, Some(interface), timeout)
    }

    pub(super) fn connect_with_interface(
        &mut self,
        host: &str,
        port: u16,
        interface: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::AlreadyStarted);
        }
        let bind = match interface {
            Some(spec) => Some(resolver::resolve_interface(spec, 0)?),
            None => None,
        };

        self.flags.insert(SocketFlags::STARTED);
        self.connecting = Some(ConnectState::new(bind));
        if let Some(timeout) = timeout {
            self.connect_timer =
                Some(self.timers.arm(TimerKind::ConnectTimeout, timeout, self.generation));
        }

        info!(host, port, "Resolving");
        let sender = self.sender.clone();
        let waker = self.waker.clone();
        let generation = self.generation;
        let host = host.to_string();
        std::thread::spawn(move || {
            let result = resolver::resolve_host(&host, port);
            if sender
                .send(Command::HostResolved { generation, result })
                .is_ok()
            {
                let _ = waker.wake();
            }
        });
        Ok(())
    }

    /// Starts a connect to an already-resolved address, skipping DNS.
    #[instrument(skip(self))]
    pub fn connect_to_address(
        &mut self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::AlreadyStarted);
        }
        self.flags.insert(SocketFlags::STARTED);
        let mut state = ConnectState::new(None);
        match addr {
            SocketAddr::V4(_) => state.remaining_v4.push_back(addr),
            SocketAddr::V6(_) => state.remaining_v6.push_back(addr),
        }
        self.connecting = Some(state);
        if let Some(timeout) = timeout {
            self.connect_timer =
                Some(self.timers.arm(TimerKind::ConnectTimeout, timeout, self.generation));
        }
        self.start_first_attempts();
        Ok(())
    }

    /// Starts a connect to a unix-domain socket path.
    #[cfg(unix)]
    #[instrument(skip(self, path))]
    pub fn connect_unix(
        &mut self,
        path: impl AsRef<std::path::Path>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::AlreadyStarted);
        }
        let path = path.as_ref();
        let mut stream = UnixStream::connect(path)?;
        self.poll
            .registry()
            .register(&mut stream, SOCK, Interest::WRITABLE)
            .expect("Failed to register connection");
        info!(path = %path.display(), "Starting connect attempt");

        self.flags.insert(SocketFlags::STARTED);
        let mut state = ConnectState::new(None);
        state.primary = Some(Attempt {
            stream: Stream::Unix(stream),
            desc: path.display().to_string(),
        });
        self.connecting = Some(state);
        if let Some(timeout) = timeout {
            self.connect_timer =
                Some(self.timers.arm(TimerKind::ConnectTimeout, timeout, self.generation));
        }
        Ok(())
    }

    /// Starts listening on `interface:port`, one listener per address
    /// family covered by the interface specification. Returns the bound
    /// addresses. Accepted connections surface as [`TcpEvent::Accepted`].
    #[instrument(skip(self))]
    pub fn accept(&mut self, interface: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::AlreadyStarted);
        }
        let bind = resolver::resolve_interface(interface, port)?;
        if bind.is_empty() {
            return Err(Error::BothFamiliesDisabled);
        }

        let mut bound = Vec::new();
        if let Some(addr) = bind.v4 {
            let mut listener = bind_listener(addr)?;
            self.poll
                .registry()
                .register(&mut listener, LISTENER_V4, Interest::READABLE)
                .expect("Failed to register listener");
            let local_addr = listener.local_addr()?;
            info!(%local_addr, "Listening for connections");
            bound.push(local_addr);
            self.listener_v4 = Some(listener);
        }
        if let Some(addr) = bind.v6 {
            match bind_listener(addr) {
                Ok(mut listener) => {
                    self.poll
                        .registry()
                        .register(&mut listener, LISTENER_V6, Interest::READABLE)
                        .expect("Failed to register listener");
                    let local_addr = listener.local_addr()?;
                    info!(%local_addr, "Listening for connections");
                    bound.push(local_addr);
                    self.listener_v6 = Some(listener);
                }
                Err(err) => {
                    // Roll back the v4 listener so a failed dual bind leaves
                    // nothing registered.
                    if let Some(mut l) = self.listener_v4.take() {
                        let _ = self.poll.registry().deregister(&mut l);
                    }
                    return Err(err);
                }
            }
        }

        self.flags.insert(SocketFlags::STARTED | SocketFlags::ACCEPTING);
        Ok(bound)
    }

    /// Starts listening on a unix-domain socket path. The path is unlinked
    /// again when the socket closes.
    #[cfg(unix)]
    #[instrument(skip(self, path))]
    pub fn accept_unix(&mut self, path: impl AsRef<std::path::Path>) -> Result<(), Error> {
        if self.flags.contains(SocketFlags::STARTED) {
            return Err(Error::AlreadyStarted);
        }
        let path = path.as_ref();
        let mut listener = UnixListener::bind(path)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_UNIX, Interest::READABLE)
            .expect("Failed to register listener");
        info!(path = %path.display(), "Listening for connections");
        self.unix_listener = Some(listener);
        self.unix_listen_path = Some(path.to_path_buf());
        self.flags.insert(SocketFlags::STARTED | SocketFlags::ACCEPTING);
        Ok(())
    }

    /// Closes immediately. Pending operations are dropped; a
    /// [`TcpEvent::Disconnected`] with no error follows if the socket had
    /// started.
    pub fn close(&mut self) {
        self.close_with_error(None);
    }

    /// Rejects new operations and closes once every queued read completes.
    pub fn close_after_reads(&mut self) {
        self.flags
            .insert(SocketFlags::FORBID_READS_WRITES | SocketFlags::DISCONNECT_AFTER_READS);
        self.maybe_close_deferred();
    }

    /// Rejects new operations and closes once every queued write completes.
    pub fn close_after_writes(&mut self) {
        self.flags
            .insert(SocketFlags::FORBID_READS_WRITES | SocketFlags::DISCONNECT_AFTER_WRITES);
        self.maybe_close_deferred();
    }

    /// Rejects new operations and closes once both queues have drained.
    pub fn close_after_reads_and_writes(&mut self) {
        self.flags.insert(
            SocketFlags::FORBID_READS_WRITES
                | SocketFlags::DISCONNECT_AFTER_READS
                | SocketFlags::DISCONNECT_AFTER_WRITES,
        );
        self.maybe_close_deferred();
    }

    // Single close funnel. Idempotent: everything after the STARTED check
    // may assume a live socket.
    #[instrument(skip(self, error))]
    pub(super) fn close_with_error(&mut self, error: Option<Error>) {
        if !self.flags.contains(SocketFlags::STARTED) {
            return;
        }

        // Invalidate every deferred completion issued for this connection.
        self.generation += 1;
        self.timers.clear();
        self.connect_timer = None;
        self.alternate_timer = None;
        self.read_timer = None;
        self.write_timer = None;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            let _ = self.poll.registry().deregister(&mut stream);
        }
        if let Some(mut state) = self.connecting.take() {
            for attempt in [state.primary.take(), state.alternate.take()].into_iter().flatten() {
                let mut stream = attempt.stream;
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        if let Some(mut listener) = self.listener_v4.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        if let Some(mut listener) = self.listener_v6.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        #[cfg(unix)]
        {
            if let Some(mut listener) = self.unix_listener.take() {
                let _ = self.poll.registry().deregister(&mut listener);
            }
            if let Some(path) = self.unix_listen_path.take() {
                let _ = std::fs::remove_file(&path);
            }
        }

        self.read_queue.clear();
        self.write_queue.clear();
        self.current_read = None;
        self.current_write = None;
        self.pre_buffer.reset();
        self.tls = None;
        self.pending_tls = None;
        self.flags = SocketFlags::empty();
        self.interest = Interest::READABLE;

        match &error {
            Some(err) => info!(%err, "Closed"),
            None => info!("Closed"),
        }
        self.events.push(TcpEvent::Disconnected { error });
    }

    // Re-evaluated whenever an operation completes or a queue drains.
    pub(super) fn maybe_close_deferred(&mut self) {
        let wanted = self
            .flags
            .intersects(SocketFlags::DISCONNECT_AFTER_READS | SocketFlags::DISCONNECT_AFTER_WRITES);
        if !wanted {
            return;
        }
        let reads_done = self.current_read.is_none() && self.read_queue.is_empty();
        let writes_done = self.current_write.is_none() && self.write_queue.is_empty();
        let ready = (!self.flags.contains(SocketFlags::DISCONNECT_AFTER_READS) || reads_done)
            && (!self.flags.contains(SocketFlags::DISCONNECT_AFTER_WRITES) || writes_done);
        if ready {
            self.close_with_error(None);
        }
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

impl TcpSocket {
    pub fn is_connected(&self) -> bool {
        self.flags.contains(SocketFlags::CONNECTED)
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(SocketFlags::IS_SECURE)
    }

    /// Local endpoint of the established stream.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.stream.as_ref().and_then(Stream::local_endpoint)
    }

    /// Remote endpoint of the established stream.
    pub fn peer_endpoint(&self) -> Option<Endpoint> {
        self.stream.as_ref().and_then(Stream::peer_endpoint)
    }

    pub fn info(&self) -> SocketInfo {
        SocketInfo {
            local: self.local_endpoint(),
            peer: self.peer_endpoint(),
            connected: self.is_connected(),
            secure: self.is_secure(),
        }
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl TcpSocket {
    /// Blocks until socket events are available and returns them.
    ///
    /// Returns [`TcpEvent::Inactive`] without blocking when the socket has
    /// neither a connection, a connect in progress, nor listeners.
    #[instrument(skip(self))]
    pub fn fetch_events(&mut self) -> Result<Vec<TcpEvent>, Error> {
        let mut dispatch_events = std::mem::take(&mut self.events);

        while dispatch_events.is_empty() {
            // Process queued handle commands
            self.process_handle_commands();
            dispatch_events.append(&mut self.events);
            if !dispatch_events.is_empty() {
                break;
            }

            // Is there anything to do?
            if !self.flags.contains(SocketFlags::STARTED) {
                dispatch_events.push(TcpEvent::Inactive);
                return Ok(dispatch_events);
            }

            let timeout = self.timers.next_timeout(Instant::now());
            let mut poll_events = Events::with_capacity(self.tunables.poll_capacity);
            self.poll.poll(&mut poll_events, timeout)?;

            for timer in self.timers.fire_due(Instant::now()) {
                self.handle_timer(timer);
            }

            for event in poll_events.iter() {
                match event.token() {
                    WAKE => {
                        // Commands are drained at the top of the loop
                    }
                    LISTENER_V4 | LISTENER_V6 => self.accept_ready(event.token()),
                    #[cfg(unix)]
                    LISTENER_UNIX => self.accept_ready(event.token()),
                    token @ (SOCK | SOCK_ALT) => {
                        if event.is_writable() {
                            self.handle_writable(token);
                        }
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                    }
                    Token(id) => warn!(id, "Event for unknown token"),
                }
            }

            dispatch_events.append(&mut self.events);
        }

        debug!(count = dispatch_events.len(), "Fetched events");
        Ok(dispatch_events)
    }
}

// ============================================================================
// Internal Event Processing
// ============================================================================

impl TcpSocket {
    fn process_handle_commands(&mut self) {
        let commands: Vec<Command> = self.receiver.try_iter().collect();

        for command in commands {
            match command {
                Command::Connect {
                    host,
                    port,
                    interface,
                    timeout,
                    response,
                } => {
                    let result =
                        self.connect_with_interface(&host, port, interface.as_deref(), timeout);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send connect response: {:?}", e);
                    }
                }
                Command::ConnectAddr {
                    addr,
                    timeout,
                    response,
                } => {
                    let result = self.connect_to_address(addr, timeout);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send connect response: {:?}", e);
                    }
                }
                #[cfg(unix)]
                Command::ConnectUnix {
                    path,
                    timeout,
                    response,
                } => {
                    let result = self.connect_unix(&path, timeout);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send connect response: {:?}", e);
                    }
                }
                Command::Accept {
                    interface,
                    port,
                    response,
                } => {
                    let result = self.accept(&interface, port);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send accept response: {:?}", e);
                    }
                }
                #[cfg(unix)]
                Command::AcceptUnix { path, response } => {
                    let result = self.accept_unix(&path);
                    if let Err(e) = response.send(result) {
                        error!("Failed to send accept response: {:?}", e);
                    }
                }
                Command::Close => self.close(),
                Command::CloseAfterReads => self.close_after_reads(),
                Command::CloseAfterWrites => self.close_after_writes(),
                Command::CloseAfterReadsAndWrites => self.close_after_reads_and_writes(),
                Command::Read { request } => {
                    if let Err(err) = self.enqueue_read(request) {
                        warn!(%err, "Dropping invalid read request");
                    }
                }
                Command::Write { data, timeout, tag } => {
                    if let Err(err) = self.write(data, timeout, tag) {
                        warn!(%err, "Dropping invalid write request");
                    }
                }
                Command::StartTls { options } => {
                    if let Err(err) = self.start_tls(options) {
                        warn!(%err, "Dropping TLS upgrade request");
                    }
                }
                Command::ExtendReadTimeout { extra } => self.extend_read_timeout(extra),
                Command::ExtendWriteTimeout { extra } => self.extend_write_timeout(extra),
                Command::ReadProgress { response } => {
                    let _ = response.send(self.read_progress());
                }
                Command::WriteProgress { response } => {
                    let _ = response.send(self.write_progress());
                }
                Command::Info { response } => {
                    let _ = response.send(self.info());
                }
                Command::HostResolved { generation, result } => {
                    self.handle_resolved(generation, result);
                }
            }
        }
    }

    fn handle_timer(&mut self, timer: Timer) {
        if timer.generation != self.generation {
            trace!(?timer, "Stale timer");
            return;
        }
        match timer.kind {
            TimerKind::ConnectTimeout if self.connect_timer == Some(timer.id) => {
                self.connect_timer = None;
                if !self.flags.contains(SocketFlags::CONNECTED) {
                    warn!("Connect timed out");
                    self.close_with_error(Some(Error::ConnectTimeout));
                }
            }
            TimerKind::AlternateFamily if self.alternate_timer == Some(timer.id) => {
                self.alternate_timer = None;
                self.start_alternate_attempt();
            }
            TimerKind::ReadTimeout if self.read_timer == Some(timer.id) => {
                self.read_timer = None;
                if let Some(op) = &self.current_read {
                    warn!(tag = op.tag, "Read timed out");
                    self.flags.insert(SocketFlags::READS_PAUSED);
                    let tag = op.tag;
                    self.events.push(TcpEvent::ReadTimedOut { tag });
                }
            }
            TimerKind::WriteTimeout if self.write_timer == Some(timer.id) => {
                self.write_timer = None;
                if let Some(op) = &self.current_write {
                    warn!(tag = op.tag, "Write timed out");
                    self.flags.insert(SocketFlags::WRITES_PAUSED);
                    let tag = op.tag;
                    self.events.push(TcpEvent::WriteTimedOut { tag });
                }
            }
            _ => trace!(?timer, "Expired timer for a superseded operation"),
        }
    }

    fn handle_readable(&mut self, token: Token) {
        if !self.flags.contains(SocketFlags::CONNECTED) {
            // Connect attempts signal via writability only.
            return;
        }
        if token == SOCK_ALT {
            return;
        }
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            self.continue_tls_handshake();
            return;
        }
        self.do_read_data();
        self.update_interest();
    }

    fn handle_writable(&mut self, token: Token) {
        if !self.flags.contains(SocketFlags::CONNECTED) {
            self.finish_connect(token);
            return;
        }
        if token == SOCK_ALT {
            return;
        }
        if self.tls.as_ref().is_some_and(TlsSession::is_handshaking) {
            self.continue_tls_handshake();
            return;
        }
        self.do_write_data();
    }

    // Re-registers the established stream when the desired interest set
    // changed. Readability is always wanted; writability only while there is
    // something to flush.
    pub(super) fn update_interest(&mut self) {
        if !self.flags.contains(SocketFlags::CONNECTED) {
            return;
        }
        let tls_busy = self
            .tls
            .as_ref()
            .is_some_and(|t| t.wants_write() || t.is_handshaking());
        let desired = if self.current_write.is_some() || tls_busy {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if desired != self.interest {
            if let Some(stream) = self.stream.as_mut() {
                self.poll
                    .registry()
                    .reregister(stream, SOCK, desired)
                    .expect("Failed to reregister connection");
                self.interest = desired;
            }
        }
    }
}

// ============================================================================
// Internal Connect State Machine
// ============================================================================

impl TcpSocket {
    fn handle_resolved(&mut self, generation: u64, result: Result<Resolved, Error>) {
        if generation != self.generation {
            trace!("Stale resolution result");
            return;
        }
        if !self.flags.contains(SocketFlags::STARTED)
            || self.flags.contains(SocketFlags::CONNECTED)
        {
            return;
        }
        match result {
            Err(err) => {
                warn!(%err, "Resolution failed");
                self.close_with_error(Some(err));
            }
            Ok(resolved) => {
                debug!(
                    v4 = resolved.v4.len(),
                    v6 = resolved.v6.len(),
                    "Resolution completed"
                );
                let Some(state) = self.connecting.as_mut() else {
                    return;
                };
                state.remaining_v4 = resolved.v4.into();
                state.remaining_v6 = resolved.v6.into();
                self.start_first_attempts();
            }
        }
    }

    fn start_first_attempts(&mut self) {
        let prefer_ipv6 = self.tunables.prefer_ipv6;
        let Some(state) = self.connecting.as_mut() else {
            return;
        };
        // A bound interface restricts the usable families.
        if let Some(bind) = &state.bind {
            if bind.v4.is_none() {
                state.remaining_v4.clear();
            }
            if bind.v6.is_none() {
                state.remaining_v6.clear();
            }
        }
        if state.remaining_v4.is_empty() && state.remaining_v6.is_empty() {
            self.close_with_error(Some(Error::BothFamiliesDisabled));
            return;
        }

        state.primary_v6 = if prefer_ipv6 {
            !state.remaining_v6.is_empty()
        } else {
            state.remaining_v4.is_empty()
        };
        let race = !state.remaining_v4.is_empty() && !state.remaining_v6.is_empty();
        if race {
            self.alternate_timer = Some(self.timers.arm(
                TimerKind::AlternateFamily,
                self.tunables.alternate_family_delay,
                self.generation,
            ));
        }

        let placeholder = io::Error::new(io::ErrorKind::NotConnected, "no attempt started");
        self.start_next_attempt(SOCK, placeholder);
    }

    fn start_alternate_attempt(&mut self) {
        if !self.flags.contains(SocketFlags::STARTED)
            || self.flags.contains(SocketFlags::CONNECTED)
        {
            return;
        }
        let Some(state) = self.connecting.as_ref() else {
            return;
        };
        if state.alternate.is_some() {
            return;
        }
        let placeholder = io::Error::new(io::ErrorKind::NotConnected, "no attempt started");
        self.start_next_attempt(SOCK_ALT, placeholder);
    }

    // Starts the next candidate for the given slot, falling back to the
    // other family once this one is exhausted and nothing else is in
    // flight. Closes the socket when every candidate has failed.
    fn start_next_attempt(&mut self, token: Token, mut last_err: io::Error) {
        loop {
            let Some(state) = self.connecting.as_mut() else {
                return;
            };
            let slot_v6 = if token == SOCK {
                state.primary_v6
            } else {
                !state.primary_v6
            };
            let other_busy = if token == SOCK {
                state.alternate.is_some()
            } else {
                state.primary.is_some()
            };
            let other_scheduled = token == SOCK && self.alternate_timer.is_some();

            let addr = state.pop_family(slot_v6).or_else(|| {
                if other_busy || other_scheduled {
                    None
                } else {
                    state.pop_family(!slot_v6)
                }
            });
            let Some(addr) = addr else {
                if !other_busy && !other_scheduled {
                    warn!(?last_err, "All connect attempts failed");
                    self.close_with_error(Some(Error::ConnectFailed(last_err)));
                }
                return;
            };

            match self.begin_attempt(addr, token) {
                Ok(()) => return,
                Err(err) => {
                    warn!(%addr, ?err, "Connect attempt failed to start");
                    last_err = err;
                }
            }
        }
    }

    fn begin_attempt(&mut self, addr: SocketAddr, token: Token) -> io::Result<()> {
        let bind = self
            .connecting
            .as_ref()
            .and_then(|s| s.bind.as_ref())
            .and_then(|b| if addr.is_ipv4() { b.v4 } else { b.v6 });
        let mut stream = connect_nonblocking(addr, bind)?;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)
            .expect("Failed to register connection");
        info!(%addr, alternate = (token == SOCK_ALT), "Starting connect attempt");

        let attempt = Attempt {
            stream: Stream::Tcp(stream),
            desc: addr.to_string(),
        };
        if let Some(state) = self.connecting.as_mut() {
            if token == SOCK {
                state.primary = Some(attempt);
            } else {
                state.alternate = Some(attempt);
            }
        }
        Ok(())
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(state) = self.connecting.as_mut() else {
            return;
        };
        let slot = if token == SOCK {
            &mut state.primary
        } else {
            &mut state.alternate
        };
        let Some(mut attempt) = slot.take() else {
            return;
        };

        match attempt.stream.take_error() {
            Ok(None) => self.connection_established(attempt),
            Ok(Some(err)) | Err(err) => {
                warn!(peer = %attempt.desc, ?err, "Connect attempt failed");
                let _ = self.poll.registry().deregister(&mut attempt.stream);
                self.start_next_attempt(token, err);
            }
        }
    }

    fn connection_established(&mut self, attempt: Attempt) {
        // Tear down the losing attempt, if the race was still open.
        if let Some(mut state) = self.connecting.take() {
            for loser in [state.primary.take(), state.alternate.take()]
                .into_iter()
                .flatten()
            {
                let mut stream = loser.stream;
                let _ = self.poll.registry().deregister(&mut stream);
                debug!(peer = %loser.desc, "Abandoning losing connect attempt");
            }
        }
        self.connect_timer = None;
        self.alternate_timer = None;

        let mut stream = attempt.stream;
        self.poll
            .registry()
            .deregister(&mut stream)
            .expect("Failed to deregister connection");
        self.poll
            .registry()
            .register(&mut stream, SOCK, Interest::READABLE)
            .expect("Failed to register connection");
        self.interest = Interest::READABLE;

        let local = stream.local_endpoint();
        let peer = stream.peer_endpoint();
        info!(peer = %attempt.desc, "Connection established");
        self.stream = Some(stream);
        self.flags.insert(SocketFlags::CONNECTED);
        self.events.push(TcpEvent::Connected { local, peer });

        // Operations queued while connecting can start now.
        self.maybe_dequeue_read();
        self.maybe_dequeue_write();
        self.update_interest();
    }
}

// ============================================================================
// Internal Accept Handling
// ============================================================================

impl TcpSocket {
    #[instrument(skip(self))]
    fn accept_ready(&mut self, token: Token) {
        loop {
            let accepted = match token {
                LISTENER_V4 => self
                    .listener_v4
                    .as_ref()
                    .map(|l| l.accept().map(|(s, _)| Stream::Tcp(s))),
                LISTENER_V6 => self
                    .listener_v6
                    .as_ref()
                    .map(|l| l.accept().map(|(s, _)| Stream::Tcp(s))),
                #[cfg(unix)]
                LISTENER_UNIX => self
                    .unix_listener
                    .as_ref()
                    .map(|l| l.accept().map(|(s, _)| Stream::Unix(s))),
                _ => None,
            };
            let Some(result) = accepted else {
                return;
            };

            match result {
                Ok(stream) => {
                    match TcpSocket::from_accepted(stream, self.tunables.clone()) {
                        Ok(socket) => {
                            if let (Some(local), Some(peer)) =
                                (socket.local_endpoint(), socket.peer_endpoint())
                            {
                                info!(%local, %peer, "Accepted connection");
                            }
                            self.events.push(TcpEvent::Accepted { socket });
                        }
                        Err(err) => {
                            warn!(?err, "Failed to set up accepted connection");
                        }
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        // Further accepting would block, so we are done
                        return;
                    }
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        self.close_with_error(Some(err.into()));
                        return;
                    }
                },
            }
        }
    }
}

// ============================================================================
// Internal TLS Upgrade
// ============================================================================

impl TcpSocket {
    /// Queues a TLS upgrade. All reads and writes queued before this call
    /// complete in plaintext; everything queued after completes secured.
    #[instrument(skip(self, options))]
    pub fn start_tls(&mut self, options: Arc<TlsOptions>) -> Result<(), Error> {
        if self
            .flags
            .intersects(SocketFlags::QUEUED_TLS | SocketFlags::IS_SECURE)
        {
            return Err(Error::TlsAlreadyQueued);
        }
        if self.flags.contains(SocketFlags::FORBID_READS_WRITES) {
            return Err(Error::NotConnected);
        }
        debug!("Queuing TLS upgrade");
        self.flags.insert(SocketFlags::QUEUED_TLS);
        self.read_queue.push_back(QueuedRead::StartTls(options));
        self.write_queue.push_back(QueuedWrite::StartTls);
        self.maybe_dequeue_read();
        self.maybe_dequeue_write();
        Ok(())
    }

    // Both pipelines have to reach their marker before the handshake may
    // touch the wire.
    pub(super) fn maybe_begin_tls_handshake(&mut self) {
        if !self
            .flags
            .contains(SocketFlags::STARTING_READ_TLS | SocketFlags::STARTING_WRITE_TLS)
            || self.tls.is_some()
        {
            return;
        }
        let Some(options) = self.pending_tls.take() else {
            return;
        };
        match TlsSession::new(&options) {
            Err(err) => {
                error!(%err, "Failed to set up TLS session");
                self.close_with_error(Some(err));
            }
            Ok(mut session) => {
                // Bytes already pulled off the socket are ciphertext and
                // belong to the record layer, not the plaintext pipeline.
                if self.pre_buffer.available_bytes() > 0 {
                    session.absorb_ciphertext(self.pre_buffer.readable());
                    let n = self.pre_buffer.available_bytes();
                    self.pre_buffer.did_read(n);
                }
                info!("Starting TLS handshake");
                self.tls = Some(session);
                self.continue_tls_handshake();
            }
        }
    }

    pub(super) fn continue_tls_handshake(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let Some(tls) = self.tls.as_mut() else {
            return;
        };
        match tls.advance_handshake(stream) {
            Ok(true) => {
                self.flags.remove(
                    SocketFlags::STARTING_READ_TLS
                        | SocketFlags::STARTING_WRITE_TLS
                        | SocketFlags::QUEUED_TLS,
                );
                self.flags.insert(SocketFlags::IS_SECURE);
                info!("TLS handshake completed");
                self.events.push(TcpEvent::Secured);
                self.maybe_dequeue_read();
                self.maybe_dequeue_write();
                self.update_interest();
            }
            Ok(false) => {
                // Parked until the next readiness event.
                self.update_interest();
            }
            Err(err) => {
                error!(%err, "TLS handshake failed");
                self.close_with_error(Some(err));
            }
        }
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

// Non-blocking connect with an optional local bind, for interface-pinned
// connects. mio's TcpStream::connect cannot bind first, so the socket is
// built by hand.
fn connect_nonblocking(
    addr: SocketAddr,
    bind: Option<SocketAddr>,
) -> io::Result<mio::net::TcpStream> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    #[cfg(target_vendor = "apple")]
    socket.set_nosigpipe(true)?;
    if let Some(local) = bind {
        socket.bind(&local.into())?;
    }
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => return Err(err),
    }
    Ok(mio::net::TcpStream::from_std(socket.into()))
}

// Listener with SO_REUSEADDR, and IPV6_V6ONLY so wildcard binds of both
// families can coexist on one port.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}
