//! evsock - Event-driven TCP and UDP sockets for Rust
//!
//! evsock provides queued, non-blocking socket engines: every read, write and
//! send is a queued operation with an optional timeout and a caller-supplied
//! tag, and completions arrive as events from a blocking fetch loop. TCP
//! sockets support dual-family connect racing, delimiter- and length-framed
//! reads, and in-place TLS upgrades; UDP sockets support deferred connects,
//! multicast membership and per-packet filters.
//!
//! Each socket is single-threaded by design. The thread calling
//! `fetch_events()` drives all I/O; other threads operate the socket through
//! its thread-safe handle.

// Internal-only modules
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod resolver;
pub(crate) mod timer;

// These are the intended public API
pub mod tcp;
pub mod udp;

pub use error::Error;
pub use tcp::{
    Endpoint, Progress, SocketInfo, TcpEvent, TcpHandle, TcpSocket, TlsOptions, TlsRole,
};
pub use udp::{FilterContext, ReceiveFilter, SendFilter, UdpEvent, UdpHandle, UdpSocket};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::tcp::{TcpEvent, TcpHandle, TcpSocket, TlsOptions, TlsRole};
    pub use crate::udp::{UdpEvent, UdpHandle, UdpSocket};
}
