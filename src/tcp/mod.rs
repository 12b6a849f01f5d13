//! Event-driven TCP socket with queued reads, writes and TLS upgrade.
//!
//! A [`TcpSocket`] owns its own mio `Poll`. The thread that calls
//! [`TcpSocket::fetch_events()`] is the socket's work loop; every other
//! thread goes through a [`TcpHandle`], which marshals operations onto the
//! loop via a channel and a waker.

mod engine;
mod interface;
mod ops;
mod read;
mod tls;
mod write;

pub use engine::TcpSocket;
pub use interface::TcpHandle;
pub use tls::{TlsOptions, TlsRole};

pub(crate) use interface::Command;

use crate::error::Error;
use bitflags::bitflags;
use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

// Poll tokens. One socket instance owns at most one established stream, two
// racing connect attempts, and one listener per family.
pub(crate) const WAKE: Token = Token(0);
pub(crate) const SOCK: Token = Token(1);
pub(crate) const SOCK_ALT: Token = Token(2);
pub(crate) const LISTENER_V4: Token = Token(3);
pub(crate) const LISTENER_V6: Token = Token(4);
#[cfg(unix)]
pub(crate) const LISTENER_UNIX: Token = Token(5);

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 128;
pub(crate) const DEFAULT_MAX_READ_SIZE: usize = 32 * 1024;
pub(crate) const DEFAULT_PRE_BUFFER_CAPACITY: usize = 4 * 1024;
pub(crate) const DEFAULT_ALTERNATE_FAMILY_DELAY: Duration = Duration::from_millis(300);

bitflags! {
    /// Lifecycle and pipeline state of a socket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SocketFlags: u32 {
        /// A connect or accept has been issued.
        const STARTED = 1 << 0;
        /// The stream is established.
        const CONNECTED = 1 << 1;
        /// The socket is closing; reject new reads and writes.
        const FORBID_READS_WRITES = 1 << 2;
        /// Read dequeue suspended (timed-out read awaiting extension).
        const READS_PAUSED = 1 << 3;
        /// Write dequeue suspended (timed-out write awaiting extension).
        const WRITES_PAUSED = 1 << 4;
        /// Close once the read queue drains.
        const DISCONNECT_AFTER_READS = 1 << 5;
        /// Close once the write queue drains.
        const DISCONNECT_AFTER_WRITES = 1 << 6;
        /// A TLS upgrade marker sits in the queues.
        const QUEUED_TLS = 1 << 7;
        /// The read queue has reached its TLS marker.
        const STARTING_READ_TLS = 1 << 8;
        /// The write queue has reached its TLS marker.
        const STARTING_WRITE_TLS = 1 << 9;
        /// TLS handshake completed; all I/O goes through the record layer.
        const IS_SECURE = 1 << 10;
        /// The transport reported EOF.
        const HAS_READ_EOF = 1 << 11;
        /// Half-duplex mode: read side closed, writes still flowing.
        const READ_STREAM_CLOSED = 1 << 12;
        /// The socket is a listener.
        const ACCEPTING = 1 << 13;
    }
}

/// Where a socket is connected or bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Ip(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Events produced by [`TcpSocket::fetch_events()`].
#[derive(Debug)]
pub enum TcpEvent {
    /// The socket has no connection and no listeners.
    Inactive,
    /// Connection established.
    Connected {
        local: Option<Endpoint>,
        peer: Option<Endpoint>,
    },
    /// A listener produced a new connection. The child socket owns its own
    /// event loop; drive it with `fetch_events` like any other socket.
    Accepted { socket: TcpSocket },
    /// A queued read finished; `data` contains exactly the requested bytes
    /// (including the terminator for terminator reads, and any caller-owned
    /// buffer prefix).
    ReadCompleted { tag: i64, data: Vec<u8> },
    /// A read made progress but is not yet complete.
    ReadPartial { tag: i64, bytes_done: usize },
    /// A queued write finished.
    WriteCompleted { tag: i64 },
    /// A write made progress but is not yet complete.
    WritePartial { tag: i64, bytes_done: usize },
    /// The current read hit its timeout. Reads stay paused until the
    /// consumer answers with [`TcpSocket::extend_read_timeout`]; declining
    /// closes the socket with [`Error::ReadTimeout`].
    ReadTimedOut { tag: i64 },
    /// Write counterpart of [`TcpEvent::ReadTimedOut`].
    WriteTimedOut { tag: i64 },
    /// TLS handshake completed; subsequent reads and writes are secured.
    Secured,
    /// Half-duplex: the peer closed its write side, this socket keeps
    /// writing. Emitted at most once per connection.
    ReadStreamClosed,
    /// The socket closed. `None` means a locally requested close.
    Disconnected { error: Option<Error> },
}

/// Progress of the in-flight read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub tag: i64,
    pub bytes_done: usize,
    /// Total expected bytes, when knowable (length reads and writes).
    pub total: Option<usize>,
}

/// Point-in-time diagnostics, also available through [`TcpHandle::info`].
#[derive(Debug, Clone)]
pub struct SocketInfo {
    pub local: Option<Endpoint>,
    pub peer: Option<Endpoint>,
    pub connected: bool,
    pub secure: bool,
}

// Tunables extracted once from config; accepted child sockets inherit them.
#[derive(Debug, Clone)]
pub(crate) struct Tunables {
    pub poll_capacity: usize,
    pub max_read_size: usize,
    pub pre_buffer_capacity: usize,
    pub alternate_family_delay: Duration,
    pub half_duplex: bool,
    pub prefer_ipv6: bool,
}

impl Tunables {
    pub fn from_config(config: &::config::Config, name: &str) -> Self {
        use crate::config::{get_namespaced_bool, get_namespaced_millis, get_namespaced_usize};
        Self {
            poll_capacity: get_namespaced_usize(config, name, "poll_capacity")
                .unwrap_or(DEFAULT_POLL_CAPACITY),
            max_read_size: get_namespaced_usize(config, name, "max_read_size")
                .unwrap_or(DEFAULT_MAX_READ_SIZE),
            pre_buffer_capacity: get_namespaced_usize(config, name, "pre_buffer_capacity")
                .unwrap_or(DEFAULT_PRE_BUFFER_CAPACITY),
            alternate_family_delay: get_namespaced_millis(
                config,
                name,
                "alternate_family_delay_ms",
            )
            .unwrap_or(DEFAULT_ALTERNATE_FAMILY_DELAY),
            half_duplex: get_namespaced_bool(config, name, "half_duplex").unwrap_or(false),
            prefer_ipv6: get_namespaced_bool(config, name, "prefer_ipv6").unwrap_or(false),
        }
    }
}

// The established stream. TCP and unix-domain streams share the whole
// read/write pipeline.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        match self {
            Stream::Tcp(s) => s.local_addr().ok().map(Endpoint::Ip),
            #[cfg(unix)]
            Stream::Unix(s) => s
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| Endpoint::Unix(p.to_path_buf()))),
        }
    }

    pub fn peer_endpoint(&self) -> Option<Endpoint> {
        match self {
            Stream::Tcp(s) => s.peer_addr().ok().map(Endpoint::Ip),
            #[cfg(unix)]
            Stream::Unix(s) => s
                .peer_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| Endpoint::Unix(p.to_path_buf()))),
        }
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Stream::Tcp(s) => s.take_error(),
            #[cfg(unix)]
            Stream::Unix(s) => s.take_error(),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown(how),
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(how),
        }
    }

    /// Zero-timeout `poll(2)` writability probe, used by the half-duplex EOF
    /// policy to distinguish "peer shut down its write side" from "socket is
    /// dead in both directions".
    #[cfg(unix)]
    pub fn probe_writable(&self) -> bool {
        use std::os::fd::AsRawFd;
        let fd = match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc == 1 && (pfd.revents & libc::POLLOUT) != 0 && (pfd.revents & libc::POLLHUP) == 0
    }

    #[cfg(not(unix))]
    pub fn probe_writable(&self) -> bool {
        false
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}
