//! Queued datagram send packets.
//!
//! The send queue is FIFO like the TCP write queue, with one twist: a
//! deferred `connect` is itself a queue entry, so sends issued before the
//! connect complete unconnected and sends issued after complete connected.

use std::net::SocketAddr;
use std::time::Duration;

/// Where a queued datagram goes.
#[derive(Debug, Clone)]
pub(crate) enum SendDestination {
    /// Through the connected socket.
    Connected,
    /// Explicit address, no resolution needed.
    Addr(SocketAddr),
    /// Host name; resolved when the packet reaches the queue head.
    Unresolved { host: String, port: u16 },
}

/// One pending datagram. `id` identifies the packet across helper-thread
/// round trips (resolution, asynchronous filters); a verdict for a packet
/// that is no longer current is dropped.
#[derive(Debug)]
pub(crate) struct SendPacket {
    pub id: u64,
    pub data: Vec<u8>,
    pub dest: SendDestination,
    pub timeout: Option<Duration>,
    pub tag: i64,
    /// A resolution helper thread is in flight for this packet.
    pub resolving: bool,
    /// An asynchronous send filter verdict is in flight.
    pub filter_pending: bool,
    /// The send filter approved this packet (or none is installed).
    pub filter_passed: bool,
    /// The send timer has been armed for this packet.
    pub timer_armed: bool,
}

impl SendPacket {
    pub fn new(
        id: u64,
        data: Vec<u8>,
        dest: SendDestination,
        timeout: Option<Duration>,
        tag: i64,
    ) -> Self {
        Self {
            id,
            data,
            dest,
            timeout,
            tag,
            resolving: false,
            filter_pending: false,
            filter_passed: false,
            timer_armed: false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum QueuedSend {
    Send(SendPacket),
    /// Deferred connect, resolved when it reaches the queue head.
    Connect { host: String, port: u16 },
    ConnectAddr(SocketAddr),
}
