//! Blocking socket transport with per-operation timeouts.
//!
//! # Connect Steps
//!
//! ```text
//! resolve ─► socket ─► connect (bounded) ─► send timeout ─► recv timeout ─► [TLS]
//! ```
//!
//! Every connect sub-step surfaces as [`ProtocolError::ConnectTimeout`]; the
//! failing step is kept in the error for diagnostics only. Timeouts are set
//! before any byte is exchanged so no later call can block forever.
//!
//! With TLS enabled the same `send` / `recv` contract holds over the
//! encrypted stream.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use extidx_core::error::ConnectStep;
use extidx_core::failure_point::{
    CONNECT_ELAPSED, CONNECT_FETCH_ERROR, CONNECT_INITIATE, CONNECT_PENDING_ERROR,
    CONNECT_RESTORE_BLOCKING, CONNECT_WAIT, FailurePoint, REQUEST_SIZE_CHECK,
    RESPONSE_SIZE_CHECK, SET_RECV_TIMEOUT, SET_SEND_TIMEOUT, SOCKET_CREATE,
};
use extidx_core::{FailurePoints, ProtocolError, ProtocolResult};
use tracing::debug;

use crate::config::ClientConfig;
use crate::tls::{self, TlsStream};

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(tcp) => tcp,
            Self::Tls(tls) => tls.get_ref(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(tcp) => tcp.write(buf),
            Self::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(tcp) => tcp.flush(),
            Self::Tls(tls) => tls.flush(),
        }
    }
}

/// A connected socket to the indexing server.
pub struct Transport {
    stream: Stream,
    peer: SocketAddr,
    points: Arc<FailurePoints>,
}

impl Transport {
    /// Connects to the configured server and applies the socket timeouts.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::AddressResolution`] if the host does not resolve
    /// - [`ProtocolError::SocketCreateFailed`] if no socket can be allocated
    /// - [`ProtocolError::ConnectTimeout`] if any connect step fails
    /// - [`ProtocolError::SendTimeoutSetFailed`] /
    ///   [`ProtocolError::RecvTimeoutSetFailed`] if a timeout cannot be set
    /// - TLS errors when `secure` is set
    pub fn connect(config: &ClientConfig, points: Arc<FailurePoints>) -> ProtocolResult<Self> {
        let peer = resolve(&config.host, config.port)?;
        if points.is_triggered(SOCKET_CREATE) {
            return Err(ProtocolError::SocketCreateFailed {
                source: Some(ProtocolError::injected()),
            });
        }

        let tcp = connect_with_timeout(peer, config.connect_timeout, &points)?;
        apply_send_timeout(&tcp, config.send_timeout, &points)?;
        apply_recv_timeout(&tcp, config.recv_timeout, &points)?;

        let stream = if config.secure {
            let tls_config = tls::client_config(config.ca_file.as_deref())?;
            Stream::Tls(Box::new(tls::handshake(tls_config, &config.host, tcp)?))
        } else {
            Stream::Plain(tcp)
        };
        let transport = Self {
            stream,
            peer,
            points,
        };

        debug!(peer = %peer, secure = config.secure, "connected to indexing server");
        Ok(transport)
    }

    /// Returns the server address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns `true` if the connection is TLS-wrapped.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Bounds every later send.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SendTimeoutSetFailed`] if the option cannot
    /// be applied.
    pub fn set_send_timeout(&self, timeout: Duration) -> ProtocolResult<()> {
        apply_send_timeout(self.stream.tcp(), timeout, &self.points)
    }

    /// Bounds every later receive.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::RecvTimeoutSetFailed`] if the option cannot
    /// be applied.
    pub fn set_recv_timeout(&self, timeout: Duration) -> ProtocolResult<()> {
        apply_recv_timeout(self.stream.tcp(), timeout, &self.points)
    }

    /// Writes all of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SocketWriteFailed`] on timeout, peer close or
    /// a short write.
    pub fn send(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush())
            .map_err(ProtocolError::write_failed)?;
        if self.points.is_triggered(REQUEST_SIZE_CHECK) {
            return Err(ProtocolError::write_failed(ProtocolError::injected()));
        }
        Ok(())
    }

    /// Fills `buf` completely.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SocketReadFailed`] on timeout or if the peer
    /// closes before `buf` is full.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> ProtocolResult<()> {
        let received = self.recv_up_to(buf)?;
        if received < buf.len() {
            return Err(ProtocolError::peer_closed_early(
                received as u64,
                buf.len() as u64,
            ));
        }
        Ok(())
    }

    /// Reads until `buf` is full or the peer closes; returns the bytes read.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SocketReadFailed`] on timeout or socket
    /// error.
    pub fn recv_up_to(&mut self, buf: &mut [u8]) -> ProtocolResult<usize> {
        let received = read_full(&mut self.stream, buf).map_err(ProtocolError::read_failed)?;
        if self.points.is_triggered(RESPONSE_SIZE_CHECK) {
            return Err(ProtocolError::read_failed(ProtocolError::injected()));
        }
        Ok(received)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("secure", &self.is_secure())
            .finish_non_exhaustive()
    }
}

fn resolve(host: &str, port: u16) -> ProtocolResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ProtocolError::AddressResolution {
            detail: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ProtocolError::AddressResolution {
            detail: format!("{host}: no addresses"),
        })
}

fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
    points: &FailurePoints,
) -> ProtocolResult<TcpStream> {
    let injected = |point: FailurePoint, step: ConnectStep| {
        if points.is_triggered(point) {
            Err(ProtocolError::ConnectTimeout {
                step,
                source: Some(ProtocolError::injected()),
            })
        } else {
            Ok(())
        }
    };

    injected(CONNECT_INITIATE, ConnectStep::Initiate)?;
    injected(CONNECT_WAIT, ConnectStep::WaitReady)?;
    // connect_timeout allocates the socket itself, so a local allocation
    // failure also surfaces as ConnectTimeout rather than SocketCreateFailed.
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
        let step = if e.kind() == io::ErrorKind::TimedOut {
            ConnectStep::Elapsed
        } else {
            ConnectStep::PendingError
        };
        ProtocolError::ConnectTimeout {
            step,
            source: Some(e),
        }
    })?;
    injected(CONNECT_ELAPSED, ConnectStep::Elapsed)?;
    injected(CONNECT_FETCH_ERROR, ConnectStep::FetchErrorStatus)?;
    injected(CONNECT_PENDING_ERROR, ConnectStep::PendingError)?;
    injected(CONNECT_RESTORE_BLOCKING, ConnectStep::RestoreBlocking)?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

fn apply_send_timeout(
    tcp: &TcpStream,
    timeout: Duration,
    points: &FailurePoints,
) -> ProtocolResult<()> {
    let result = if points.is_triggered(SET_SEND_TIMEOUT) {
        Err(ProtocolError::injected())
    } else {
        tcp.set_write_timeout(Some(timeout))
    };
    result.map_err(|e| ProtocolError::SendTimeoutSetFailed { source: Some(e) })
}

fn apply_recv_timeout(
    tcp: &TcpStream,
    timeout: Duration,
    points: &FailurePoints,
) -> ProtocolResult<()> {
    let result = if points.is_triggered(SET_RECV_TIMEOUT) {
        Err(ProtocolError::injected())
    } else {
        tcp.set_read_timeout(Some(timeout))
    };
    result.map_err(|e| ProtocolError::RecvTimeoutSetFailed { source: Some(e) })
}

/// Reads until `buf` is full or end of stream.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            // A TLS peer that closes without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
