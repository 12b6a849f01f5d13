use super::{FilterContext, ReceiveFilter, SendFilter};
use crate::error::Error;
use crate::resolver::Resolved;
use mio::Waker;
use std::net::SocketAddr;
use std::sync::{
    mpsc::{channel, Sender},
    Arc,
};
use std::time::Duration;

// Internal request type for cross-thread communication. Not Debug: filters
// are opaque closures.
pub(crate) enum Command {
    // Connection Management

    Bind {
        interface: String,
        port: u16,
        response: Sender<Result<Vec<SocketAddr>, Error>>,
    },
    Connect {
        host: String,
        port: u16,
        response: Sender<Result<(), Error>>,
    },
    ConnectAddr {
        addr: SocketAddr,
        response: Sender<Result<(), Error>>,
    },
    Close,
    CloseAfterSends,

    // Data Operations

    Send {
        data: Vec<u8>,
        timeout: Option<Duration>,
        tag: i64,
    },
    SendToHost {
        data: Vec<u8>,
        host: String,
        port: u16,
        timeout: Option<Duration>,
        tag: i64,
    },
    SendToAddr {
        data: Vec<u8>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        tag: i64,
    },
    ReceiveOnce,
    ReceiveAlways,
    PauseReceiving,

    // Filters and Multicast

    SetSendFilter {
        filter: Option<SendFilter>,
        asynchronous: bool,
    },
    SetReceiveFilter {
        filter: Option<ReceiveFilter>,
        asynchronous: bool,
    },
    JoinMulticast {
        group: String,
        interface: Option<String>,
        response: Sender<Result<(), Error>>,
    },
    LeaveMulticast {
        group: String,
        interface: Option<String>,
        response: Sender<Result<(), Error>>,
    },

    // Posted by helper threads, never by consumers.

    SendHostResolved {
        id: u64,
        generation: u64,
        result: Result<Resolved, Error>,
    },
    ConnectHostResolved {
        generation: u64,
        result: Result<Resolved, Error>,
    },
    SendFilterVerdict {
        id: u64,
        generation: u64,
        allow: bool,
    },
    ReceiveFilterVerdict {
        generation: u64,
        allow: bool,
        data: Vec<u8>,
        from: SocketAddr,
        context: Option<FilterContext>,
    },
}

/// Thread-safe interface to a [`UdpSocket`](super::UdpSocket).
///
/// Obtain an instance via [`UdpSocket::handle()`](super::UdpSocket::handle);
/// clones share the same socket.
#[derive(Debug, Clone)]
pub struct UdpHandle {
    pub(crate) sender: Sender<Command>,
    pub(crate) waker: Arc<Waker>,
}

impl UdpHandle {
    fn post(&self, command: Command) {
        self.sender
            .send(command)
            .expect("Failed to send request to event loop");
        self.waker.wake().expect("Failed to wake event loop");
    }

    fn post_and_wait<T>(&self, command: Command, rx: std::sync::mpsc::Receiver<T>) -> T {
        self.post(command);
        rx.recv()
            .expect("Failed to receive response from event loop")
    }

    // ============================================================================
    // Connection Management
    // ============================================================================

    /// Binds to `interface:port` and returns the bound addresses.
    pub fn bind(&self, interface: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::Bind {
                interface: interface.to_string(),
                port,
                response: tx,
            },
            rx,
        )
    }

    /// Queues a deferred connect behind all currently queued sends.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::Connect {
                host: host.to_string(),
                port,
                response: tx,
            },
            rx,
        )
    }

    /// Queues a deferred connect to an already-resolved address.
    pub fn connect_to_address(&self, addr: SocketAddr) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(Command::ConnectAddr { addr, response: tx }, rx)
    }

    /// Queues an immediate close.
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Closes once every queued send has completed.
    pub fn close_after_sends(&self) {
        self.post(Command::CloseAfterSends);
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    /// Queues a datagram through the connected destination.
    pub fn send(&self, data: Vec<u8>, timeout: Option<Duration>, tag: i64) {
        self.post(Command::Send { data, timeout, tag });
    }

    /// Queues a datagram to `host:port`, resolving when it reaches the queue
    /// head.
    pub fn send_to_host(
        &self,
        data: Vec<u8>,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        tag: i64,
    ) {
        self.post(Command::SendToHost {
            data,
            host: host.to_string(),
            port,
            timeout,
            tag,
        });
    }

    /// Queues a datagram to an already-resolved address.
    pub fn send_to_address(
        &self,
        data: Vec<u8>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        tag: i64,
    ) {
        self.post(Command::SendToAddr {
            data,
            addr,
            timeout,
            tag,
        });
    }

    /// Delivers exactly one datagram, then pauses receiving.
    pub fn receive_once(&self) {
        self.post(Command::ReceiveOnce);
    }

    /// Delivers datagrams continuously until paused.
    pub fn receive_always(&self) {
        self.post(Command::ReceiveAlways);
    }

    /// Stops delivering datagrams. Already queued events still dispatch.
    pub fn pause_receiving(&self) {
        self.post(Command::PauseReceiving);
    }

    // ============================================================================
    // Filters and Multicast
    // ============================================================================

    /// Installs (or clears) the per-packet send filter. Asynchronous filters
    /// run on a helper thread without blocking the event loop.
    pub fn set_send_filter(&self, filter: Option<SendFilter>, asynchronous: bool) {
        self.post(Command::SetSendFilter {
            filter,
            asynchronous,
        });
    }

    /// Installs (or clears) the per-datagram receive filter.
    pub fn set_receive_filter(&self, filter: Option<ReceiveFilter>, asynchronous: bool) {
        self.post(Command::SetReceiveFilter {
            filter,
            asynchronous,
        });
    }

    /// Joins a multicast group, optionally via a named interface.
    pub fn join_multicast_group(
        &self,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::JoinMulticast {
                group: group.to_string(),
                interface: interface.map(str::to_string),
                response: tx,
            },
            rx,
        )
    }

    /// Leaves a multicast group.
    pub fn leave_multicast_group(
        &self,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::LeaveMulticast {
                group: group.to_string(),
                interface: interface.map(str::to_string),
                response: tx,
            },
            rx,
        )
    }
}
