use thiserror::Error;

/// The error type for evsock operations.
///
/// Synchronous precondition failures (bad parameters, wrong call order) are
/// returned directly from the call site. Anything that requires network I/O
/// or name resolution fails asynchronously: the socket closes itself and the
/// error arrives in the terminal `Disconnected` / `Closed` event. There is no
/// second channel for asynchronous failures.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration and call-order errors
    // ============================================================================

    /// The socket has already started a connect or accept.
    #[error("Socket is already started")]
    AlreadyStarted,

    /// Operation requires an established connection.
    #[error("Socket is not connected")]
    NotConnected,

    /// Both address families were disabled or unavailable, leaving nothing
    /// to bind or connect.
    #[error("Both IPv4 and IPv6 are disabled")]
    BothFamiliesDisabled,

    /// A bind was requested after the socket was already connected or bound.
    #[error("Cannot bind after the socket is connected or bound")]
    BindAfterConnect,

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // ============================================================================
    // Parameter errors
    // ============================================================================

    /// The interface specification could not be parsed or matched.
    #[error("Invalid interface specification '{0}'")]
    InvalidInterface(String),

    /// A read-to-terminator was issued with a terminator longer than its
    /// maximum length, which could never complete.
    #[error("Terminator ({terminator} bytes) cannot exceed max length ({max_length})")]
    TerminatorTooLong {
        terminator: usize,
        max_length: usize,
    },

    /// An empty terminator or zero read length was supplied.
    #[error("Invalid read parameter: {0}")]
    InvalidReadParameter(&'static str),

    // ============================================================================
    // Resolution errors
    // ============================================================================

    /// Host name resolution failed.
    #[error("Failed to resolve '{host}': {source}")]
    Resolution {
        host: String,
        source: std::io::Error,
    },

    /// Resolution succeeded but produced no usable addresses.
    #[error("Resolution of '{0}' produced no addresses")]
    NoAddresses(String),

    // ============================================================================
    // I/O and protocol errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connect attempt did not complete within its timeout.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// A read operation timed out and was not extended.
    #[error("Read operation timed out")]
    ReadTimeout,

    /// A write operation timed out and was not extended.
    #[error("Write operation timed out")]
    WriteTimeout,

    /// A datagram send timed out while waiting for socket writability.
    #[error("Send operation timed out")]
    SendTimeout,

    /// A read-to-terminator consumed its maximum length without finding the
    /// terminator.
    #[error("Read reached max length ({0} bytes) without finding terminator")]
    ReadMaxedOut(usize),

    /// The remote peer closed the connection.
    #[error("Connection closed by peer")]
    ClosedByPeer,

    /// The connect attempt was refused or otherwise failed at the OS level.
    #[error("Connection failed: {0}")]
    ConnectFailed(std::io::Error),

    /// A datagram send was attempted to an address family whose socket has
    /// been deactivated (e.g. after a connect restricted the socket).
    #[error("Address family is deactivated for this socket")]
    FamilyDeactivated,

    /// A send was attempted on a connected UDP socket with a mismatched
    /// destination, or on an unconnected socket without a destination.
    #[error("Send destination does not match socket state: {0}")]
    BadSendDestination(&'static str),

    /// Operation requires a bound socket (e.g. multicast membership).
    #[error("Socket must be bound first")]
    NotBound,

    /// The multicast group address could not be parsed or is not a
    /// multicast address.
    #[error("Invalid multicast group '{0}'")]
    InvalidMulticastGroup(String),

    // ============================================================================
    // TLS errors
    // ============================================================================

    /// Failed to load a TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load a TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// The TLS state machine reported a fatal error (handshake or record
    /// layer), including certificate rejection by a custom verifier.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// `start_tls` was queued without the role's required configuration.
    #[error("TLS configuration missing: {0}")]
    TlsConfigMissing(&'static str),

    /// `start_tls` was called while an upgrade was already queued or active.
    #[error("TLS upgrade already queued")]
    TlsAlreadyQueued,
}

impl Error {
    /// True for the terminal condition a consumer usually treats as a normal
    /// end of conversation rather than a fault.
    pub fn is_peer_close(&self) -> bool {
        matches!(self, Error::ClosedByPeer)
    }

    // Would-block is not a failure on a non-blocking socket; the pipelines
    // use this to decide between "park until the next readiness event" and
    // "close with an error".
    pub(crate) fn would_block(&self) -> bool {
        matches!(self, Error::Io(err) if err.kind() == std::io::ErrorKind::WouldBlock)
    }
}
