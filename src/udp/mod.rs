//! Event-driven UDP socket with a FIFO send queue and filter pipeline.
//!
//! The connectionless analogue of the TCP module: a [`UdpSocket`] owns up to
//! two datagram sockets (one per address family) and its own mio `Poll`;
//! the thread calling [`UdpSocket::fetch_events()`] drives all I/O, and
//! other threads go through a [`UdpHandle`].

mod engine;
mod interface;
mod ops;

pub use engine::UdpSocket;
pub use interface::UdpHandle;

pub(crate) use interface::Command;

use crate::error::Error;
use bitflags::bitflags;
use mio::Token;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub(crate) const WAKE: Token = Token(0);
pub(crate) const SOCK_V4: Token = Token(1);
pub(crate) const SOCK_V6: Token = Token(2);

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 128;
pub(crate) const DEFAULT_MAX_RECEIVE_SIZE: usize = 65_535;

bitflags! {
    /// Lifecycle and receive-mode state of a datagram socket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct UdpFlags: u32 {
        /// An explicit bind has completed.
        const DID_BIND = 1 << 0;
        /// A connect marker sits in the send queue or is resolving.
        const CONNECTING = 1 << 1;
        /// The socket is connected; destinations are fixed.
        const DID_CONNECT = 1 << 2;
        /// IPv4 is unusable (connect or multicast pinned the other family).
        const IPV4_DEACTIVATED = 1 << 3;
        /// IPv6 counterpart of `IPV4_DEACTIVATED`.
        const IPV6_DEACTIVATED = 1 << 4;
        /// Deliver exactly one datagram, then pause.
        const RECEIVE_ONCE = 1 << 5;
        /// Deliver datagrams until paused.
        const RECEIVE_CONTINUOUS = 1 << 6;
        /// An asynchronous receive filter verdict is in flight; the receive
        /// pump is parked until it lands.
        const RECEIVE_FILTERING = 1 << 7;
        /// Close once the send queue drains.
        const CLOSE_AFTER_SENDS = 1 << 8;
        /// Dual-socket receive alternation: which family is tried first.
        const FLIP_FLOP = 1 << 9;
    }
}

/// Opaque caller context a receive filter may attach to a datagram.
#[derive(Clone)]
pub struct FilterContext(pub Arc<dyn Any + Send + Sync>);

impl fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterContext")
    }
}

/// Per-packet send admission decision. Receives the payload, the destination
/// (None for connected sends) and the tag; returning `false` vetoes the
/// network I/O, but the send still completes normally.
pub type SendFilter = Arc<dyn Fn(&[u8], Option<SocketAddr>, i64) -> bool + Send + Sync>;

/// Per-datagram receive admission decision. Returning `(false, _)` silently
/// drops the datagram; `(true, context)` delivers it with the context
/// attached.
pub type ReceiveFilter =
    Arc<dyn Fn(&[u8], SocketAddr) -> (bool, Option<FilterContext>) + Send + Sync>;

/// Events produced by [`UdpSocket::fetch_events()`].
#[derive(Debug)]
pub enum UdpEvent {
    /// The socket has no sockets, no queued sends and nothing in flight.
    Inactive,
    /// An explicit bind completed.
    DidBind,
    /// A deferred connect completed; subsequent sends go to `addr`.
    DidConnect { addr: SocketAddr },
    /// A queued send finished (or was vetoed by the send filter).
    SendCompleted { tag: i64 },
    /// A queued send failed; the socket stays open and the queue continues.
    SendFailed { tag: i64, error: Error },
    /// A datagram arrived and passed the receive filter.
    Received {
        data: Vec<u8>,
        from: SocketAddr,
        context: Option<FilterContext>,
    },
    /// The socket closed. `None` means a locally requested close.
    Closed { error: Option<Error> },
}

// Tunables extracted once from config.
#[derive(Debug, Clone)]
pub(crate) struct UdpTunables {
    pub poll_capacity: usize,
    pub max_receive_size: usize,
    pub receive_buffer_size: Option<usize>,
}

impl UdpTunables {
    pub fn from_config(config: &::config::Config, name: &str) -> Self {
        use crate::config::get_namespaced_usize;
        Self {
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(DEFAULT_POLL_CAPACITY),
            max_receive_size: get_namespaced_usize(config, name, "udp_max_receive_size")
                .unwrap_or(DEFAULT_MAX_RECEIVE_SIZE),
            receive_buffer_size: get_namespaced_usize(config, name, "udp_receive_buffer_size")
                .ok(),
        }
    }
}
