//! The UDP socket engine: per-family sockets, FIFO send queue with deferred
//! resolution and deferred connect, filter pipeline and receive modes.
//!
//! Not thread-safe - use UdpHandle for cross-thread operation.

use super::interface::Command;
use super::ops::{QueuedSend, SendDestination, SendPacket};
use super::*;
use crate::error::Error;
use crate::resolver::{self, Resolved};
use crate::timer::{Timer, TimerKind, TimerQueue};
use ::config::Config;

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{
    mpsc::{channel, Receiver, Sender},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

/// Event-driven datagram socket with a FIFO send queue.
///
/// Each socket owns its own mio `Poll`; the thread calling
/// [`fetch_events()`](Self::fetch_events) drives all I/O. Operations are
/// accepted from any thread through a [`UdpHandle`].
pub struct UdpSocket {
    flags: UdpFlags,
    // Same staleness discipline as the TCP engine: deferred completions
    // carry the generation they were issued under.
    generation: u64,
    tunables: UdpTunables,
    poll: Poll,
    waker: Arc<Waker>,
    sender: Sender<Command>,
    receiver: Receiver<Command>,

    sock_v4: Option<MioUdpSocket>,
    sock_v6: Option<MioUdpSocket>,
    interest_v4: Interest,
    interest_v6: Interest,
    connected_to: Option<SocketAddr>,

    send_queue: VecDeque<QueuedSend>,
    current_send: Option<SendPacket>,
    connect_in_flight: bool,
    next_send_id: u64,

    send_filter: Option<SendFilter>,
    send_filter_async: bool,
    receive_filter: Option<ReceiveFilter>,
    receive_filter_async: bool,

    timers: TimerQueue,
    send_timer: Option<u64>,

    events: Vec<UdpEvent>,
}

// ============================================================================
// Constructors
// ============================================================================

impl UdpSocket {
    /// Creates a new socket from configuration.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a new socket with configuration namespacing: `{name}.{key}`
    /// is consulted before the bare `{key}`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let tunables = UdpTunables::from_config(config, name);
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (sender, receiver) = channel();

        Ok(Self {
            flags: UdpFlags::empty(),
            generation: 1,
            tunables,
            poll,
            waker,
            sender,
            receiver,
            sock_v4: None,
            sock_v6: None,
            interest_v4: Interest::READABLE,
            interest_v6: Interest::READABLE,
            connected_to: None,
            send_queue: VecDeque::new(),
            current_send: None,
            connect_in_flight: false,
            next_send_id: 1,
            send_filter: None,
            send_filter_async: false,
            receive_filter: None,
            receive_filter_async: false,
            timers: TimerQueue::new(),
            send_timer: None,
            events: Vec::new(),
        })
    }

    /// Gets a thread-safe handle for operating this socket from other
    /// threads.
    pub fn handle(&self) -> UdpHandle {
        UdpHandle {
            sender: self.sender.clone(),
            waker: self.waker.clone(),
        }
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl UdpSocket {
    /// Binds to `interface:port`, creating one socket per address family the
    /// interface specification covers. Returns the bound addresses.
    #[instrument(skip(self))]
    pub fn bind(&mut self, interface: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        if self.flags.contains(UdpFlags::DID_BIND)
            || self.sock_v4.is_some()
            || self.sock_v6.is_some()
        {
            return Err(Error::AlreadyStarted);
        }
        if self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::BindAfterConnect);
        }

        let bind = resolver::resolve_interface(interface, port)?;
        let mut bound = Vec::new();
        if let Some(addr) = bind.v4 {
            if !self.flags.contains(UdpFlags::IPV4_DEACTIVATED) {
                let mut sock = create_datagram_socket(addr, self.tunables.receive_buffer_size)?;
                self.poll
                    .registry()
                    .register(&mut sock, SOCK_V4, Interest::READABLE)
                    .expect("Failed to register socket");
                let local_addr = sock.local_addr()?;
                info!(%local_addr, "Bound datagram socket");
                bound.push(local_addr);
                self.sock_v4 = Some(sock);
            }
        }
        if let Some(addr) = bind.v6 {
            if !self.flags.contains(UdpFlags::IPV6_DEACTIVATED) {
                match create_datagram_socket(addr, self.tunables.receive_buffer_size) {
                    Ok(mut sock) => {
                        self.poll
                            .registry()
                            .register(&mut sock, SOCK_V6, Interest::READABLE)
                            .expect("Failed to register socket");
                        let local_addr = sock.local_addr()?;
                        info!(%local_addr, "Bound datagram socket");
                        bound.push(local_addr);
                        self.sock_v6 = Some(sock);
                    }
                    Err(err) => {
                        if let Some(mut sock) = self.sock_v4.take() {
                            let _ = self.poll.registry().deregister(&mut sock);
                        }
                        return Err(err);
                    }
                }
            }
        }
        if bound.is_empty() {
            return Err(Error::BothFamiliesDisabled);
        }

        self.flags.insert(UdpFlags::DID_BIND);
        self.events.push(UdpEvent::DidBind);
        Ok(bound)
    }

    /// Queues a connect to `host:port` behind all currently queued sends.
    /// Resolution happens when the marker reaches the queue head; completion
    /// is reported by [`UdpEvent::DidConnect`]. Connecting fixes the
    /// destination of subsequent sends and deactivates the unused family.
    #[instrument(skip(self))]
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), Error> {
        if self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::AlreadyStarted);
        }
        self.flags.insert(UdpFlags::CONNECTING);
        self.send_queue.push_back(QueuedSend::Connect {
            host: host.to_string(),
            port,
        });
        self.maybe_dequeue_send();
        Ok(())
    }

    /// Like [`connect`](Self::connect), skipping DNS.
    #[instrument(skip(self))]
    pub fn connect_to_address(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::AlreadyStarted);
        }
        self.flags.insert(UdpFlags::CONNECTING);
        self.send_queue.push_back(QueuedSend::ConnectAddr(addr));
        self.maybe_dequeue_send();
        Ok(())
    }

    /// Closes immediately. Pending sends are dropped; a [`UdpEvent::Closed`]
    /// with no error follows if the socket had any live state.
    pub fn close(&mut self) {
        self.close_with_error(None);
    }

    /// Closes once every queued send has completed.
    pub fn close_after_sends(&mut self) {
        self.flags.insert(UdpFlags::CLOSE_AFTER_SENDS);
        if self.current_send.is_none() && self.send_queue.is_empty() && !self.connect_in_flight {
            self.close_with_error(None);
        }
    }

    // Single close funnel, idempotent like its TCP counterpart.
    #[instrument(skip(self, error))]
    fn close_with_error(&mut self, error: Option<Error>) {
        let live = self.sock_v4.is_some()
            || self.sock_v6.is_some()
            || self.current_send.is_some()
            || !self.send_queue.is_empty()
            || self.connect_in_flight
            || !self.flags.is_empty();
        if !live {
            return;
        }

        self.generation += 1;
        self.timers.clear();
        self.send_timer = None;

        if let Some(mut sock) = self.sock_v4.take() {
            let _ = self.poll.registry().deregister(&mut sock);
        }
        if let Some(mut sock) = self.sock_v6.take() {
            let _ = self.poll.registry().deregister(&mut sock);
        }
        self.send_queue.clear();
        self.current_send = None;
        self.connect_in_flight = false;
        self.connected_to = None;
        self.flags = UdpFlags::empty();
        self.interest_v4 = Interest::READABLE;
        self.interest_v6 = Interest::READABLE;

        match &error {
            Some(err) => info!(%err, "Closed"),
            None => info!("Closed"),
        }
        self.events.push(UdpEvent::Closed { error });
    }

    /// Local addresses of the live sockets.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        [self.sock_v4.as_ref(), self.sock_v6.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Address of the connected peer, if any.
    pub fn connected_address(&self) -> Option<SocketAddr> {
        self.connected_to
    }
}

// ============================================================================
// Send Operations
// ============================================================================

impl UdpSocket {
    /// Queues a datagram through the connected destination. Requires a
    /// connect (possibly still queued). Empty sends are ignored.
    pub fn send(
        &mut self,
        data: Vec<u8>,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        if !self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::NotConnected);
        }
        self.enqueue_send(data, SendDestination::Connected, timeout, tag)
    }

    /// Queues a datagram to `host:port`, resolving the host when the packet
    /// reaches the queue head. Rejected on a connected socket.
    pub fn send_to_host(
        &mut self,
        data: Vec<u8>,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        if self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::BadSendDestination("socket is connected"));
        }
        self.enqueue_send(
            data,
            SendDestination::Unresolved {
                host: host.to_string(),
                port,
            },
            timeout,
            tag,
        )
    }

    /// Queues a datagram to an already-resolved address. Rejected on a
    /// connected socket.
    pub fn send_to_address(
        &mut self,
        data: Vec<u8>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        if self
            .flags
            .intersects(UdpFlags::CONNECTING | UdpFlags::DID_CONNECT)
        {
            return Err(Error::BadSendDestination("socket is connected"));
        }
        self.enqueue_send(data, SendDestination::Addr(addr), timeout, tag)
    }

    fn enqueue_send(
        &mut self,
        data: Vec<u8>,
        dest: SendDestination,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Result<(), Error> {
        if data.is_empty() {
            trace!(tag, "Ignoring empty send");
            return Ok(());
        }
        let id = self.next_send_id;
        self.next_send_id += 1;
        trace!(tag, len = data.len(), "Queuing send");
        self.send_queue
            .push_back(QueuedSend::Send(SendPacket::new(id, data, dest, timeout, tag)));
        self.maybe_dequeue_send();
        Ok(())
    }

    /// Installs (or clears) the per-packet send filter.
    pub fn set_send_filter(&mut self, filter: Option<SendFilter>, asynchronous: bool) {
        self.send_filter = filter;
        self.send_filter_async = asynchronous;
    }

    /// Installs (or clears) the per-datagram receive filter.
    pub fn set_receive_filter(&mut self, filter: Option<ReceiveFilter>, asynchronous: bool) {
        self.receive_filter = filter;
        self.receive_filter_async = asynchronous;
    }
}

// ============================================================================
// Receive Operations
// ============================================================================

impl UdpSocket {
    /// Delivers exactly one datagram, then pauses.
    pub fn receive_once(&mut self) {
        self.flags.remove(UdpFlags::RECEIVE_CONTINUOUS);
        self.flags.insert(UdpFlags::RECEIVE_ONCE);
        self.do_receive();
    }

    /// Delivers datagrams continuously until paused.
    pub fn receive_always(&mut self) {
        self.flags.remove(UdpFlags::RECEIVE_ONCE);
        self.flags.insert(UdpFlags::RECEIVE_CONTINUOUS);
        self.do_receive();
    }

    /// Stops delivering datagrams.
    pub fn pause_receiving(&mut self) {
        self.flags
            .remove(UdpFlags::RECEIVE_ONCE | UdpFlags::RECEIVE_CONTINUOUS);
    }
}

// ============================================================================
// Multicast
// ============================================================================

impl UdpSocket {
    /// Joins a multicast group, optionally via a named interface. The
    /// socket must be bound first.
    #[instrument(skip(self))]
    pub fn join_multicast_group(
        &mut self,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), Error> {
        self.multicast_op(group, interface, true)
    }

    /// Leaves a multicast group.
    #[instrument(skip(self))]
    pub fn leave_multicast_group(
        &mut self,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), Error> {
        self.multicast_op(group, interface, false)
    }

    fn multicast_op(
        &mut self,
        group: &str,
        interface: Option<&str>,
        join: bool,
    ) -> Result<(), Error> {
        if !self.flags.contains(UdpFlags::DID_BIND) {
            return Err(Error::NotBound);
        }
        let ip: IpAddr = group
            .parse()
            .map_err(|_| Error::InvalidMulticastGroup(group.to_string()))?;
        if !ip.is_multicast() {
            return Err(Error::InvalidMulticastGroup(group.to_string()));
        }

        match ip {
            IpAddr::V4(group_addr) => {
                let iface = match interface {
                    Some(spec) => match resolver::resolve_interface(spec, 0)?.v4.map(|a| a.ip()) {
                        Some(IpAddr::V4(v4)) => v4,
                        _ => return Err(Error::InvalidInterface(spec.to_string())),
                    },
                    None => Ipv4Addr::UNSPECIFIED,
                };
                let Some(sock) = self.sock_v4.as_ref() else {
                    return Err(Error::FamilyDeactivated);
                };
                if join {
                    sock.join_multicast_v4(&group_addr, &iface)?;
                } else {
                    sock.leave_multicast_v4(&group_addr, &iface)?;
                }
                // Group membership pins the socket to one family; the other
                // is deactivated unless a bound counterpart still needs it.
                if join && self.sock_v6.is_none() {
                    self.flags.insert(UdpFlags::IPV6_DEACTIVATED);
                }
            }
            IpAddr::V6(group_addr) => {
                let index = match interface {
                    #[cfg(unix)]
                    Some(spec) => resolver::interface_index(spec)?,
                    #[cfg(not(unix))]
                    Some(spec) => return Err(Error::InvalidInterface(spec.to_string())),
                    None => 0,
                };
                let Some(sock) = self.sock_v6.as_ref() else {
                    return Err(Error::FamilyDeactivated);
                };
                if join {
                    sock.join_multicast_v6(&group_addr, index)?;
                } else {
                    sock.leave_multicast_v6(&group_addr, index)?;
                }
                if join && self.sock_v4.is_none() {
                    self.flags.insert(UdpFlags::IPV4_DEACTIVATED);
                }
            }
        }
        info!(group, join, "Multicast membership updated");
        Ok(())
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl UdpSocket {
    /// Blocks until socket events are available and returns them.
    ///
    /// Returns [`UdpEvent::Inactive`] without blocking when the socket has
    /// no live sockets and nothing queued or in flight.
    #[instrument(skip(self))]
    pub fn fetch_events(&mut self) -> Result<Vec<UdpEvent>, Error> {
        let mut dispatch_events = std::mem::take(&mut self.events);

        while dispatch_events.is_empty() {
            // Process queued handle commands
            self.process_handle_commands();
            dispatch_events.append(&mut self.events);
            if !dispatch_events.is_empty() {
                break;
            }

            // Is there anything to do?
            let live = self.sock_v4.is_some()
                || self.sock_v6.is_some()
                || self.current_send.is_some()
                || !self.send_queue.is_empty()
                || self.connect_in_flight;
            if !live {
                dispatch_events.push(UdpEvent::Inactive);
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
                    token @ (SOCK_V4 | SOCK_V6) => {
                        if event.is_writable() {
                            self.set_writable_interest(token == SOCK_V6, false);
                            self.maybe_send_current();
                        }
                        if event.is_readable() {
                            self.do_receive();
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

impl UdpSocket {
    fn process_handle_commands(&mut self) {
        let commands: Vec<Command> = self.receiver.try_iter().collect();

        for command in commands {
            match command {
                Command::Bind {
                    interface,
                    port,
                    response,
                } => {
                    let result = self.bind(&interface, port);
                    if response.send(result).is_err() {
                        error!("Failed to send bind response");
                    }
                }
                Command::Connect {
                    host,
                    port,
                    response,
                } => {
                    let result = self.connect(&host, port);
                    if response.send(result).is_err() {
                        error!("Failed to send connect response");
                    }
                }
                Command::ConnectAddr { addr, response } => {
                    let result = self.connect_to_address(addr);
                    if response.send(result).is_err() {
                        error!("Failed to send connect response");
                    }
                }
                Command::Close => self.close(),
                Command::CloseAfterSends => self.close_after_sends(),
                Command::Send { data, timeout, tag } => {
                    if let Err(err) = self.send(data, timeout, tag) {
                        warn!(%err, "Dropping invalid send request");
                    }
                }
                Command::SendToHost {
                    data,
                    host,
                    port,
                    timeout,
                    tag,
                } => {
                    if let Err(err) = self.send_to_host(data, &host, port, timeout, tag) {
                        warn!(%err, "Dropping invalid send request");
                    }
                }
                Command::SendToAddr {
                    data,
                    addr,
                    timeout,
                    tag,
                } => {
                    if let Err(err) = self.send_to_address(data, addr, timeout, tag) {
                        warn!(%err, "Dropping invalid send request");
                    }
                }
                Command::ReceiveOnce => self.receive_once(),
                Command::ReceiveAlways => self.receive_always(),
                Command::PauseReceiving => self.pause_receiving(),
                Command::SetSendFilter {
                    filter,
                    asynchronous,
                } => self.set_send_filter(filter, asynchronous),
                Command::SetReceiveFilter {
                    filter,
                    asynchronous,
                } => self.set_receive_filter(filter, asynchronous),
                Command::JoinMulticast {
                    group,
                    interface,
                    response,
                } => {
                    let result = self.join_multicast_group(&group, interface.as_deref());
                    if response.send(result).is_err() {
                        error!("Failed to send multicast response");
                    }
                }
                Command::LeaveMulticast {
                    group,
                    interface,
                    response,
                } => {
                    let result = self.leave_multicast_group(&group, interface.as_deref());
                    if response.send(result).is_err() {
                        error!("Failed to send multicast response");
                    }
                }
                Command::SendHostResolved {
                    id,
                    generation,
                    result,
                } => self.handle_send_resolved(id, generation, result),
                Command::ConnectHostResolved { generation, result } => {
                    self.handle_connect_resolved(generation, result);
                }
                Command::SendFilterVerdict {
                    id,
                    generation,
                    allow,
                } => self.handle_send_filter_verdict(id, generation, allow),
                Command::ReceiveFilterVerdict {
                    generation,
                    allow,
                    data,
                    from,
                    context,
                } => self.handle_receive_filter_verdict(generation, allow, data, from, context),
            }
        }
    }

    fn handle_timer(&mut self, timer: Timer) {
        if timer.generation != self.generation {
            trace!(?timer, "Stale timer");
            return;
        }
        match timer.kind {
            TimerKind::SendTimeout if self.send_timer == Some(timer.id) => {
                self.send_timer = None;
                if let Some(packet) = self.current_send.take() {
                    warn!(tag = packet.tag, "Send timed out");
                    self.finish_send(packet, Err(Error::SendTimeout));
                }
            }
            _ => trace!(?timer, "Expired timer for a superseded operation"),
        }
    }
}

// ============================================================================
// Internal Send Pipeline
// ============================================================================

impl UdpSocket {
    fn maybe_dequeue_send(&mut self) {
        if self.current_send.is_some() || self.connect_in_flight {
            return;
        }
        match self.send_queue.pop_front() {
            Some(QueuedSend::Send(packet)) => {
                trace!(tag = packet.tag, "Dequeued send");
                self.current_send = Some(packet);
                self.maybe_send_current();
            }
            Some(QueuedSend::Connect { host, port }) => {
                self.connect_in_flight = true;
                info!(host, port, "Resolving connect destination");
                let sender = self.sender.clone();
                let waker = self.waker.clone();
                let generation = self.generation;
                std::thread::spawn(move || {
                    let result = resolver::resolve_host(&host, port);
                    if sender
                        .send(Command::ConnectHostResolved { generation, result })
                        .is_ok()
                    {
                        let _ = waker.wake();
                    }
                });
            }
            Some(QueuedSend::ConnectAddr(addr)) => self.finish_connect(addr),
            None => {
                if self.flags.contains(UdpFlags::CLOSE_AFTER_SENDS) {
                    self.close_with_error(None);
                }
            }
        }
    }

    // Drives the current packet as far as it can go: resolution, filter
    // admission, timer, wire attempt. Parks the packet (leaving it current)
    // whenever it has to wait.
    fn maybe_send_current(&mut self) {
        let Some(mut packet) = self.current_send.take() else {
            return;
        };

        // Deferred per-packet resolution blocks the queue head.
        if let SendDestination::Unresolved { host, port } = &packet.dest {
            if !packet.resolving {
                packet.resolving = true;
                debug!(host, "Resolving send destination");
                let host = host.clone();
                let port = *port;
                let id = packet.id;
                let sender = self.sender.clone();
                let waker = self.waker.clone();
                let generation = self.generation;
                std::thread::spawn(move || {
                    let result = resolver::resolve_host(&host, port);
                    if sender
                        .send(Command::SendHostResolved {
                            id,
                            generation,
                            result,
                        })
                        .is_ok()
                    {
                        let _ = waker.wake();
                    }
                });
            }
            self.current_send = Some(packet);
            return;
        }

        let dest_addr = match &packet.dest {
            SendDestination::Addr(addr) => Some(*addr),
            _ => self.connected_to,
        };

        // Filter admission. A veto still completes the send, without I/O.
        if !packet.filter_passed {
            if let Some(filter) = self.send_filter.clone() {
                if packet.filter_pending {
                    self.current_send = Some(packet);
                    return;
                }
                if self.send_filter_async {
                    packet.filter_pending = true;
                    let data = packet.data.clone();
                    let tag = packet.tag;
                    let id = packet.id;
                    let sender = self.sender.clone();
                    let waker = self.waker.clone();
                    let generation = self.generation;
                    std::thread::spawn(move || {
                        let allow = filter(&data, dest_addr, tag);
                        if sender
                            .send(Command::SendFilterVerdict {
                                id,
                                generation,
                                allow,
                            })
                            .is_ok()
                        {
                            let _ = waker.wake();
                        }
                    });
                    self.current_send = Some(packet);
                    return;
                }
                if !filter(&packet.data, dest_addr, packet.tag) {
                    debug!(tag = packet.tag, "Send filter vetoed packet");
                    self.finish_send(packet, Ok(()));
                    return;
                }
            }
            packet.filter_passed = true;
        }

        if !packet.timer_armed {
            if let Some(timeout) = packet.timeout {
                packet.timer_armed = true;
                self.send_timer =
                    Some(self.timers.arm(TimerKind::SendTimeout, timeout, self.generation));
            }
        }

        // Wire attempt.
        let v6 = dest_addr.is_some_and(|a| a.is_ipv6());
        if let Err(err) = self.ensure_socket(v6) {
            self.finish_send(packet, Err(err));
            return;
        }
        let sock = if v6 {
            self.sock_v6.as_ref()
        } else {
            self.sock_v4.as_ref()
        };
        let Some(sock) = sock else {
            self.finish_send(packet, Err(Error::FamilyDeactivated));
            return;
        };
        let result = match &packet.dest {
            SendDestination::Addr(addr) => sock.send_to(&packet.data, *addr),
            _ => sock.send(&packet.data),
        };
        match result {
            Ok(_) => self.finish_send(packet, Ok(())),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!(tag = packet.tag, "Send would block");
                self.set_writable_interest(v6, true);
                self.current_send = Some(packet);
            }
            Err(err) => self.finish_send(packet, Err(err.into())),
        }
    }

    // Terminal bookkeeping for the current packet; the socket stays open
    // and the queue continues either way.
    fn finish_send(&mut self, packet: SendPacket, result: Result<(), Error>) {
        self.send_timer = None;
        match result {
            Ok(()) => {
                debug!(tag = packet.tag, "Send completed");
                self.events.push(UdpEvent::SendCompleted { tag: packet.tag });
            }
            Err(error) => {
                warn!(tag = packet.tag, %error, "Send failed");
                self.events.push(UdpEvent::SendFailed {
                    tag: packet.tag,
                    error,
                });
            }
        }
        self.maybe_dequeue_send();
    }

    fn handle_send_resolved(&mut self, id: u64, generation: u64, result: Result<Resolved, Error>) {
        if generation != self.generation {
            trace!("Stale resolution result");
            return;
        }
        let Some(mut packet) = self.current_send.take() else {
            return;
        };
        if packet.id != id {
            self.current_send = Some(packet);
            return;
        }
        packet.resolving = false;

        match result {
            Err(err) => self.finish_send(packet, Err(err)),
            Ok(resolved) => {
                let addr = self.pick_address(&resolved);
                match addr {
                    Some(addr) => {
                        packet.dest = SendDestination::Addr(addr);
                        self.current_send = Some(packet);
                        self.maybe_send_current();
                    }
                    None => self.finish_send(packet, Err(Error::FamilyDeactivated)),
                }
            }
        }
    }

    fn handle_connect_resolved(&mut self, generation: u64, result: Result<Resolved, Error>) {
        if generation != self.generation {
            trace!("Stale resolution result");
            return;
        }
        if !self.connect_in_flight {
            return;
        }
        self.connect_in_flight = false;
        match result {
            Err(err) => {
                warn!(%err, "Connect resolution failed");
                self.close_with_error(Some(err));
            }
            Ok(resolved) => match self.pick_address(&resolved) {
                Some(addr) => self.finish_connect(addr),
                None => self.close_with_error(Some(Error::BothFamiliesDisabled)),
            },
        }
    }

    fn finish_connect(&mut self, addr: SocketAddr) {
        let v6 = addr.is_ipv6();
        if let Err(err) = self.ensure_socket(v6) {
            self.close_with_error(Some(err));
            return;
        }
        let result = {
            let sock = if v6 {
                self.sock_v6.as_ref()
            } else {
                self.sock_v4.as_ref()
            };
            match sock {
                Some(sock) => sock.connect(addr).map_err(Error::from),
                None => Err(Error::FamilyDeactivated),
            }
        };
        if let Err(err) = result {
            self.close_with_error(Some(err));
            return;
        }

        // Connect pins the family; the counterpart socket is released.
        self.deactivate_family(!v6);
        self.connected_to = Some(addr);
        self.connect_in_flight = false;
        self.flags.remove(UdpFlags::CONNECTING);
        self.flags.insert(UdpFlags::DID_CONNECT);
        info!(%addr, "Datagram socket connected");
        self.events.push(UdpEvent::DidConnect { addr });
        self.maybe_dequeue_send();
    }

    fn handle_send_filter_verdict(&mut self, id: u64, generation: u64, allow: bool) {
        if generation != self.generation {
            trace!("Stale filter verdict");
            return;
        }
        let Some(mut packet) = self.current_send.take() else {
            return;
        };
        if packet.id != id {
            self.current_send = Some(packet);
            return;
        }
        packet.filter_pending = false;
        if allow {
            packet.filter_passed = true;
            self.current_send = Some(packet);
            self.maybe_send_current();
        } else {
            debug!(tag = packet.tag, "Send filter vetoed packet");
            self.finish_send(packet, Ok(()));
        }
    }

    // Picks a resolved address the live families can reach, preferring IPv4
    // like the unconnected send path.
    fn pick_address(&self, resolved: &Resolved) -> Option<SocketAddr> {
        if self.family_usable(false) {
            if let Some(addr) = resolved.v4.first() {
                return Some(*addr);
            }
        }
        if self.family_usable(true) {
            if let Some(addr) = resolved.v6.first() {
                return Some(*addr);
            }
        }
        None
    }

    fn family_usable(&self, v6: bool) -> bool {
        let deactivated = if v6 {
            self.flags.contains(UdpFlags::IPV6_DEACTIVATED)
        } else {
            self.flags.contains(UdpFlags::IPV4_DEACTIVATED)
        };
        if deactivated {
            return false;
        }
        if self.flags.contains(UdpFlags::DID_BIND) {
            if v6 {
                self.sock_v6.is_some()
            } else {
                self.sock_v4.is_some()
            }
        } else {
            true
        }
    }
}

// ============================================================================
// Internal Receive Pipeline
// ============================================================================

impl UdpSocket {
    // Pumps datagrams while a receive mode is active. Parks when both
    // sockets would block or an asynchronous filter verdict is pending.
    fn do_receive(&mut self) {
        loop {
            if !self
                .flags
                .intersects(UdpFlags::RECEIVE_ONCE | UdpFlags::RECEIVE_CONTINUOUS)
                || self.flags.contains(UdpFlags::RECEIVE_FILTERING)
            {
                return;
            }

            let v4_live = self.sock_v4.is_some();
            let v6_live = self.sock_v6.is_some();
            if !v4_live && !v6_live {
                return;
            }
            // With two live sockets, alternate which family is polled first
            // so neither can starve the other.
            let first_v6 = if v4_live && v6_live {
                self.flags.toggle(UdpFlags::FLIP_FLOP);
                self.flags.contains(UdpFlags::FLIP_FLOP)
            } else {
                v6_live
            };

            let mut received = self.try_recv(first_v6);
            if received.is_none() && v4_live && v6_live {
                received = self.try_recv(!first_v6);
            }
            let Some(result) = received else {
                return;
            };

            match result {
                Err(err) => {
                    error!(?err, "Error receiving datagram");
                    self.close_with_error(Some(err.into()));
                    return;
                }
                Ok((data, from)) => {
                    // A connected socket only hears its peer.
                    if let Some(connected) = self.connected_to {
                        if from != connected {
                            trace!(%from, "Dropping datagram from foreign source");
                            continue;
                        }
                    }

                    if let Some(filter) = self.receive_filter.clone() {
                        if self.receive_filter_async {
                            self.flags.insert(UdpFlags::RECEIVE_FILTERING);
                            let sender = self.sender.clone();
                            let waker = self.waker.clone();
                            let generation = self.generation;
                            std::thread::spawn(move || {
                                let (allow, context) = filter(&data, from);
                                if sender
                                    .send(Command::ReceiveFilterVerdict {
                                        generation,
                                        allow,
                                        data,
                                        from,
                                        context,
                                    })
                                    .is_ok()
                                {
                                    let _ = waker.wake();
                                }
                            });
                            return;
                        }
                        let (allow, context) = filter(&data, from);
                        if !allow {
                            trace!(%from, "Receive filter dropped datagram");
                            continue;
                        }
                        self.deliver_datagram(data, from, context);
                    } else {
                        self.deliver_datagram(data, from, None);
                    }
                }
            }
        }
    }

    fn try_recv(&self, v6: bool) -> Option<io::Result<(Vec<u8>, SocketAddr)>> {
        let sock = if v6 {
            self.sock_v6.as_ref()
        } else {
            self.sock_v4.as_ref()
        }?;
        let mut buf = vec![0u8; self.tunables.max_receive_size];
        match sock.recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                Some(Ok((buf, from)))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => Some(Err(err)),
        }
    }

    fn deliver_datagram(
        &mut self,
        data: Vec<u8>,
        from: SocketAddr,
        context: Option<FilterContext>,
    ) {
        trace!(%from, len = data.len(), "Datagram received");
        self.events.push(UdpEvent::Received {
            data,
            from,
            context,
        });
        self.flags.remove(UdpFlags::RECEIVE_ONCE);
    }

    fn handle_receive_filter_verdict(
        &mut self,
        generation: u64,
        allow: bool,
        data: Vec<u8>,
        from: SocketAddr,
        context: Option<FilterContext>,
    ) {
        if generation != self.generation {
            trace!("Stale filter verdict");
            return;
        }
        self.flags.remove(UdpFlags::RECEIVE_FILTERING);
        if allow
            && self
                .flags
                .intersects(UdpFlags::RECEIVE_ONCE | UdpFlags::RECEIVE_CONTINUOUS)
        {
            self.deliver_datagram(data, from, context);
        } else if !allow {
            trace!(%from, "Receive filter dropped datagram");
        }
        self.do_receive();
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl UdpSocket {
    // Lazily creates the wildcard-bound socket for a family the first time
    // an unbound send needs it.
    fn ensure_socket(&mut self, v6: bool) -> Result<(), Error> {
        let deactivated = if v6 {
            self.flags.contains(UdpFlags::IPV6_DEACTIVATED)
        } else {
            self.flags.contains(UdpFlags::IPV4_DEACTIVATED)
        };
        if deactivated {
            return Err(Error::FamilyDeactivated);
        }
        let slot = if v6 { &self.sock_v6 } else { &self.sock_v4 };
        if slot.is_some() {
            return Ok(());
        }
        // An explicit bind pins the socket set; missing families stay
        // missing instead of being conjured unbound.
        if self.flags.contains(UdpFlags::DID_BIND) {
            return Err(Error::FamilyDeactivated);
        }

        let wildcard: SocketAddr = if v6 {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut sock = create_datagram_socket(wildcard, self.tunables.receive_buffer_size)?;
        let token = if v6 { SOCK_V6 } else { SOCK_V4 };
        self.poll
            .registry()
            .register(&mut sock, token, Interest::READABLE)
            .expect("Failed to register socket");
        debug!(v6, "Created datagram socket on demand");
        if v6 {
            self.sock_v6 = Some(sock);
        } else {
            self.sock_v4 = Some(sock);
        }
        Ok(())
    }

    fn deactivate_family(&mut self, v6: bool) {
        if v6 {
            self.flags.insert(UdpFlags::IPV6_DEACTIVATED);
            if let Some(mut sock) = self.sock_v6.take() {
                let _ = self.poll.registry().deregister(&mut sock);
            }
        } else {
            self.flags.insert(UdpFlags::IPV4_DEACTIVATED);
            if let Some(mut sock) = self.sock_v4.take() {
                let _ = self.poll.registry().deregister(&mut sock);
            }
        }
    }

    fn set_writable_interest(&mut self, v6: bool, want: bool) {
        let desired = if want {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if v6 {
            if desired != self.interest_v6 {
                if let Some(sock) = self.sock_v6.as_mut() {
                    self.poll
                        .registry()
                        .reregister(sock, SOCK_V6, desired)
                        .expect("Failed to reregister socket");
                    self.interest_v6 = desired;
                }
            }
        } else if desired != self.interest_v4 {
            if let Some(sock) = self.sock_v4.as_mut() {
                self.poll
                    .registry()
                    .reregister(sock, SOCK_V4, desired)
                    .expect("Failed to reregister socket");
                self.interest_v4 = desired;
            }
        }
    }
}

// Datagram socket with SO_REUSEADDR, optional SO_RCVBUF sizing, and
// IPV6_V6ONLY so wildcard binds of both families can coexist.
fn create_datagram_socket(
    addr: SocketAddr,
    receive_buffer_size: Option<usize>,
) -> Result<MioUdpSocket, Error> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if let Some(size) = receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    Ok(MioUdpSocket::from_std(socket.into()))
}
