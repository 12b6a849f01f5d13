use super::tls::TlsOptions;
use super::{Progress, SocketInfo};
use crate::error::Error;
use crate::resolver::Resolved;
use mio::Waker;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::{
    mpsc::{channel, Sender},
    Arc,
};
use std::time::Duration;

// Parameters of a queued read, shared between the owner-facing methods and
// the handle.
#[derive(Debug)]
pub(crate) struct ReadRequest {
    pub buffer: Option<Vec<u8>>,
    pub offset: usize,
    pub read_length: Option<usize>,
    pub terminator: Option<Vec<u8>>,
    pub max_length: Option<usize>,
    pub timeout: Option<Duration>,
    pub tag: i64,
}

// Internal request type for cross-thread communication.
#[derive(Debug)]
pub(crate) enum Command {
    // Connection Management

    Connect {
        host: String,
        port: u16,
        interface: Option<String>,
        timeout: Option<Duration>,
        response: Sender<Result<(), Error>>,
    },
    ConnectAddr {
        addr: SocketAddr,
        timeout: Option<Duration>,
        response: Sender<Result<(), Error>>,
    },
    #[cfg(unix)]
    ConnectUnix {
        path: PathBuf,
        timeout: Option<Duration>,
        response: Sender<Result<(), Error>>,
    },
    Accept {
        interface: String,
        port: u16,
        response: Sender<Result<Vec<SocketAddr>, Error>>,
    },
    #[cfg(unix)]
    AcceptUnix {
        path: PathBuf,
        response: Sender<Result<(), Error>>,
    },
    Close,
    CloseAfterReads,
    CloseAfterWrites,
    CloseAfterReadsAndWrites,

    // Data Operations

    Read {
        request: ReadRequest,
    },
    Write {
        data: Vec<u8>,
        timeout: Option<Duration>,
        tag: i64,
    },
    StartTls {
        options: Arc<TlsOptions>,
    },
    ExtendReadTimeout {
        extra: Option<Duration>,
    },
    ExtendWriteTimeout {
        extra: Option<Duration>,
    },

    // Diagnostics

    ReadProgress {
        response: Sender<Option<Progress>>,
    },
    WriteProgress {
        response: Sender<Option<Progress>>,
    },
    Info {
        response: Sender<SocketInfo>,
    },

    // Posted by the resolver helper thread, never by consumers.
    HostResolved {
        generation: u64,
        result: Result<Resolved, Error>,
    },
}

/// Thread-safe interface to a [`TcpSocket`](super::TcpSocket).
///
/// Allows threads other than the one driving `fetch_events()` to operate the
/// socket. Obtain an instance via
/// [`TcpSocket::handle()`](super::TcpSocket::handle); clones share the same
/// socket.
#[derive(Debug, Clone)]
pub struct TcpHandle {
    pub(crate) sender: Sender<Command>,
    pub(crate) waker: Arc<Waker>,
}

impl TcpHandle {
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

    /// Starts a connect to `host:port`. Blocks only for parameter
    /// validation; establishment is reported by `TcpEvent::Connected`.
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::Connect {
                host: host.to_string(),
                port,
                interface: None,
                timeout,
                response: tx,
            },
            rx,
        )
    }

    /// Like [`connect`](Self::connect), binding the local side to `interface`
    /// first.
    pub fn connect_via_interface(
        &self,
        host: &str,
        port: u16,
        interface: &str,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::Connect {
                host: host.to_string(),
                port,
                interface: Some(interface.to_string()),
                timeout,
                response: tx,
            },
            rx,
        )
    }

    /// Starts a connect to an already-resolved address.
    pub fn connect_to_address(
        &self,
        addr: SocketAddr,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::ConnectAddr {
                addr,
                timeout,
                response: tx,
            },
            rx,
        )
    }

    /// Starts a connect to a unix-domain socket path.
    #[cfg(unix)]
    pub fn connect_unix(
        &self,
        path: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::ConnectUnix {
                path: path.into(),
                timeout,
                response: tx,
            },
            rx,
        )
    }

    /// Starts listening on `interface:port`. Returns the bound listener
    /// addresses (one per address family).
    pub fn accept(&self, interface: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::Accept {
                interface: interface.to_string(),
                port,
                response: tx,
            },
            rx,
        )
    }

    /// Starts listening on a unix-domain socket path.
    #[cfg(unix)]
    pub fn accept_unix(&self, path: impl Into<PathBuf>) -> Result<(), Error> {
        let (tx, rx) = channel();
        self.post_and_wait(
            Command::AcceptUnix {
                path: path.into(),
                response: tx,
            },
            rx,
        )
    }

    /// Queues an immediate close. Pending operations are dropped.
    pub fn close(&self) {
        self.post(Command::Close);
    }

    /// Closes once every queued read has completed.
    pub fn close_after_reads(&self) {
        self.post(Command::CloseAfterReads);
    }

    /// Closes once every queued write has completed.
    pub fn close_after_writes(&self) {
        self.post(Command::CloseAfterWrites);
    }

    /// Closes once both queues have drained.
    pub fn close_after_reads_and_writes(&self) {
        self.post(Command::CloseAfterReadsAndWrites);
    }

    // ============================================================================
    // Data Operations
    // ============================================================================
    //
    // These are fire-and-forget like the owner-facing methods, but parameter
    // errors cannot be returned across the channel; the event loop logs and
    // drops invalid requests.

    /// Queues a read that completes with whatever data arrives next.
    pub fn read_data(&self, timeout: Option<Duration>, tag: i64) {
        self.post(Command::Read {
            request: ReadRequest {
                buffer: None,
                offset: 0,
                read_length: None,
                terminator: None,
                max_length: None,
                timeout,
                tag,
            },
        });
    }

    /// Queues a read of exactly `length` bytes.
    pub fn read_to_length(&self, length: usize, timeout: Option<Duration>, tag: i64) {
        self.post(Command::Read {
            request: ReadRequest {
                buffer: None,
                offset: 0,
                read_length: Some(length),
                terminator: None,
                max_length: None,
                timeout,
                tag,
            },
        });
    }

    /// Queues a read that completes at the given terminator sequence.
    pub fn read_to_terminator(
        &self,
        terminator: Vec<u8>,
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tag: i64,
    ) {
        self.post(Command::Read {
            request: ReadRequest {
                buffer: None,
                offset: 0,
                read_length: None,
                terminator: Some(terminator),
                max_length,
                timeout,
                tag,
            },
        });
    }

    /// Queues a write of the full contents of `data`.
    pub fn write(&self, data: Vec<u8>, timeout: Option<Duration>, tag: i64) {
        self.post(Command::Write { data, timeout, tag });
    }

    /// Queues a TLS upgrade behind all currently queued reads and writes.
    pub fn start_tls(&self, options: Arc<TlsOptions>) {
        self.post(Command::StartTls { options });
    }

    /// Answers a `ReadTimedOut` event. `Some(extra)` grants more time; `None`
    /// (or zero) closes the socket with a read timeout error.
    pub fn extend_read_timeout(&self, extra: Option<Duration>) {
        self.post(Command::ExtendReadTimeout { extra });
    }

    /// Answers a `WriteTimedOut` event.
    pub fn extend_write_timeout(&self, extra: Option<Duration>) {
        self.post(Command::ExtendWriteTimeout { extra });
    }

    // ============================================================================
    // Diagnostics
    // ============================================================================

    /// Progress of the in-flight read, if any.
    pub fn read_progress(&self) -> Option<Progress> {
        let (tx, rx) = channel();
        self.post_and_wait(Command::ReadProgress { response: tx }, rx)
    }

    /// Progress of the in-flight write, if any.
    pub fn write_progress(&self) -> Option<Progress> {
        let (tx, rx) = channel();
        self.post_and_wait(Command::WriteProgress { response: tx }, rx)
    }

    /// Snapshot of addresses and connection state.
    pub fn info(&self) -> SocketInfo {
        let (tx, rx) = channel();
        self.post_and_wait(Command::Info { response: tx }, rx)
    }
}
