//! In-place TLS upgrade.
//!
//! `start_tls` queues an upgrade marker behind all pending reads and writes;
//! the handshake starts only once both pipelines have drained to their
//! marker. Ciphertext that was already sitting in the socket pre-buffer at
//! that point migrates into the session's own pre-buffer and is consumed by
//! the record layer before any fresh socket reads.

use super::Stream;
use crate::buffer::{PreBuffer, SocketBuffer};
use crate::error::Error;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// How the socket should behave once its TLS marker is reached.
#[derive(Debug, Clone)]
pub enum TlsRole {
    Client {
        /// Name presented for SNI and certificate validation.
        server_name: String,
        /// Path to a PEM CA bundle to trust.
        ca_cert: Option<PathBuf>,
        /// Custom trust evaluation, replacing the CA bundle. This is the
        /// manual-verification escape hatch; the verifier runs synchronously
        /// inside the record machine during the handshake.
        verifier: Option<Arc<dyn ServerCertVerifier>>,
        /// Fully prebuilt config; wins over `ca_cert`/`verifier`.
        config: Option<Arc<rustls::ClientConfig>>,
    },
    Server {
        /// Path to the PEM certificate chain.
        cert: Option<PathBuf>,
        /// Path to the PEM private key.
        key: Option<PathBuf>,
        /// Fully prebuilt config; wins over `cert`/`key`.
        config: Option<Arc<rustls::ServerConfig>>,
    },
}

/// Parameters for a queued TLS upgrade.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub(crate) role: TlsRole,
}

impl TlsOptions {
    /// Client-side upgrade validating against a PEM CA bundle.
    pub fn client(server_name: impl Into<String>, ca_cert: impl Into<PathBuf>) -> Self {
        Self {
            role: TlsRole::Client {
                server_name: server_name.into(),
                ca_cert: Some(ca_cert.into()),
                verifier: None,
                config: None,
            },
        }
    }

    /// Client-side upgrade with caller-controlled certificate evaluation.
    pub fn client_with_verifier(
        server_name: impl Into<String>,
        verifier: Arc<dyn ServerCertVerifier>,
    ) -> Self {
        Self {
            role: TlsRole::Client {
                server_name: server_name.into(),
                ca_cert: None,
                verifier: Some(verifier),
                config: None,
            },
        }
    }

    /// Client-side upgrade from a prebuilt rustls config.
    pub fn client_with_config(
        server_name: impl Into<String>,
        config: Arc<rustls::ClientConfig>,
    ) -> Self {
        Self {
            role: TlsRole::Client {
                server_name: server_name.into(),
                ca_cert: None,
                verifier: None,
                config: Some(config),
            },
        }
    }

    /// Server-side upgrade from PEM certificate and key files.
    pub fn server(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            role: TlsRole::Server {
                cert: Some(cert.into()),
                key: Some(key.into()),
                config: None,
            },
        }
    }

    /// Server-side upgrade from a prebuilt rustls config.
    pub fn server_with_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            role: TlsRole::Server {
                cert: None,
                key: None,
                config: Some(config),
            },
        }
    }

    /// Client options from config keys `tls_ca_cert` and `tls_server_name`.
    pub fn client_from_config(config: &::config::Config, name: &str) -> Result<Self, Error> {
        use crate::config::get_namespaced_string;
        let ca_cert = get_namespaced_string(config, name, "tls_ca_cert")
            .map_err(|_| Error::TlsConfigMissing("tls_ca_cert"))?;
        let server_name = get_namespaced_string(config, name, "tls_server_name")
            .unwrap_or_else(|_| "localhost".to_string());
        Ok(Self::client(server_name, ca_cert))
    }

    /// Server options from config keys `tls_server_cert` and `tls_server_key`.
    pub fn server_from_config(config: &::config::Config, name: &str) -> Result<Self, Error> {
        use crate::config::get_namespaced_string;
        let cert = get_namespaced_string(config, name, "tls_server_cert")
            .map_err(|_| Error::TlsConfigMissing("tls_server_cert"))?;
        let key = get_namespaced_string(config, name, "tls_server_key")
            .map_err(|_| Error::TlsConfigMissing("tls_server_key"))?;
        Ok(Self::server(cert, key))
    }
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.display().to_string(),
        source: e,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    if certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_pem_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.display().to_string(),
        source: e,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(e.to_string()))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("no private key in {}", path.display())))
}

// Internal enum over the two rustls connection roles.
enum TlsConnection {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

// The live record layer plus the ciphertext carried over from before the
// upgrade.
pub(crate) struct TlsSession {
    conn: TlsConnection,
    pre_buffer: PreBuffer,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.is_handshaking())
            .field("buffered_ciphertext", &self.pre_buffer.available_bytes())
            .finish()
    }
}

// Serves migrated ciphertext before touching the socket, so records that
// arrived pre-upgrade are never lost.
struct PreBufferedRead<'a> {
    pre: &'a mut PreBuffer,
    io: &'a mut Stream,
}

impl Read for PreBufferedRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pre.available_bytes() > 0 {
            return Ok(self.pre.drain_into(buf));
        }
        self.io.read(buf)
    }
}

impl TlsSession {
    pub fn new(options: &TlsOptions) -> Result<Self, Error> {
        let conn = match &options.role {
            TlsRole::Client {
                server_name,
                ca_cert,
                verifier,
                config,
            } => {
                let cfg = if let Some(cfg) = config {
                    cfg.clone()
                } else if let Some(verifier) = verifier {
                    Arc::new(
                        rustls::ClientConfig::builder()
                            .dangerous()
                            .with_custom_certificate_verifier(verifier.clone())
                            .with_no_client_auth(),
                    )
                } else if let Some(ca_cert) = ca_cert {
                    let mut roots = RootCertStore::empty();
                    for cert in read_pem_certs(ca_cert)? {
                        roots
                            .add(cert)
                            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
                    }
                    Arc::new(
                        rustls::ClientConfig::builder()
                            .with_root_certificates(roots)
                            .with_no_client_auth(),
                    )
                } else {
                    return Err(Error::TlsConfigMissing(
                        "client trust source (ca cert, verifier, or config)",
                    ));
                };
                let name = ServerName::try_from(server_name.clone())
                    .map_err(|_| Error::TlsInvalidServerName(server_name.clone()))?;
                TlsConnection::Client(rustls::ClientConnection::new(cfg, name)?)
            }
            TlsRole::Server { cert, key, config } => {
                let cfg = if let Some(cfg) = config {
                    cfg.clone()
                } else if let (Some(cert), Some(key)) = (cert, key) {
                    let chain = read_pem_certs(cert)?;
                    let key = read_pem_private_key(key)?;
                    Arc::new(
                        rustls::ServerConfig::builder()
                            .with_no_client_auth()
                            .with_single_cert(chain, key)?,
                    )
                } else {
                    return Err(Error::TlsConfigMissing("server certificate and key"));
                };
                TlsConnection::Server(rustls::ServerConnection::new(cfg)?)
            }
        };
        Ok(Self {
            conn,
            pre_buffer: PreBuffer::with_capacity(0),
        })
    }

    /// Takes ownership of ciphertext read from the socket before the
    /// upgrade; it is replayed to the record layer ahead of socket reads.
    pub fn absorb_ciphertext(&mut self, data: &[u8]) {
        self.pre_buffer.append(data);
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.conn {
            TlsConnection::Client(c) => c.is_handshaking(),
            TlsConnection::Server(c) => c.is_handshaking(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match &self.conn {
            TlsConnection::Client(c) => c.wants_write(),
            TlsConnection::Server(c) => c.wants_write(),
        }
    }

    fn read_tls_from(&mut self, io: &mut Stream) -> io::Result<usize> {
        let mut src = PreBufferedRead {
            pre: &mut self.pre_buffer,
            io,
        };
        match &mut self.conn {
            TlsConnection::Client(c) => c.read_tls(&mut src),
            TlsConnection::Server(c) => c.read_tls(&mut src),
        }
    }

    fn write_tls_to(&mut self, io: &mut Stream) -> io::Result<usize> {
        match &mut self.conn {
            TlsConnection::Client(c) => c.write_tls(io),
            TlsConnection::Server(c) => c.write_tls(io),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match &mut self.conn {
            TlsConnection::Client(c) => c.process_new_packets(),
            TlsConnection::Server(c) => c.process_new_packets(),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.conn {
            TlsConnection::Client(c) => c.reader().read(buf),
            TlsConnection::Server(c) => c.reader().read(buf),
        }
    }

    fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write;
        match &mut self.conn {
            TlsConnection::Client(c) => c.writer().write(buf),
            TlsConnection::Server(c) => c.writer().write(buf),
        }
    }

    /// Drives the handshake as far as current socket readiness allows.
    /// Returns `Ok(true)` once the handshake is complete.
    pub fn advance_handshake(&mut self, io: &mut Stream) -> Result<bool, Error> {
        loop {
            self.flush_ciphertext(io)?;

            if !self.is_handshaking() {
                return Ok(true);
            }

            match self.read_tls_from(io) {
                Ok(0) => return Err(Error::ClosedByPeer),
                Ok(n) => {
                    trace!(len = n, "Read handshake ciphertext");
                    self.process_new_packets()?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // The next readiness event re-drives the handshake.
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Secured read: plaintext out of the record layer, pulling ciphertext
    /// from the socket as needed. `Ok(0)` means a clean TLS close.
    pub fn read(&mut self, io: &mut Stream, dst: &mut [u8]) -> Result<usize, Error> {
        loop {
            match self.read_plaintext(dst) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }

            match self.read_tls_from(io) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    trace!(len = n, "Read ciphertext from socket");
                    let state = self.process_new_packets()?;
                    if state.plaintext_bytes_to_read() == 0 && state.peer_has_closed() {
                        return Ok(0);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Secured write: plaintext into the record layer, then as much
    /// ciphertext to the socket as it will take. Returns the plaintext bytes
    /// accepted; unflushed ciphertext stays buffered (`wants_write`).
    pub fn write(&mut self, io: &mut Stream, src: &[u8]) -> Result<usize, Error> {
        let accepted = self.write_plaintext(src)?;
        self.flush_ciphertext(io)?;
        Ok(accepted)
    }

    /// Writes buffered ciphertext to the socket until drained or would-block.
    /// Would-block is not an error here; `wants_write()` keeps the socket
    /// registered for writability until the rest drains.
    pub fn flush_ciphertext(&mut self, io: &mut Stream) -> Result<(), Error> {
        while self.wants_write() {
            match self.write_tls_to(io) {
                Ok(0) => break,
                Ok(n) => trace!(len = n, "Wrote ciphertext to socket"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
