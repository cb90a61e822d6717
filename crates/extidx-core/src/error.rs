//! Error taxonomy for the external index build protocol.
//!
//! Every failure on either side of the wire is a [`ProtocolError`]. The
//! `Display` text of each variant is a stable, user-facing message: the
//! database side surfaces it verbatim and operators (and tests) match on it.
//! Variable detail is kept out of the message prefix, usually in a `#[source]`
//! or a structured field.
//!
//! # Classification
//!
//! [`ProtocolError::kind`] groups variants into the four failure classes of
//! the protocol plus a usage class for caller mistakes:
//!
//! | Kind         | Examples                                          |
//! |--------------|---------------------------------------------------|
//! | `Connection` | socket creation, connect timeout, timeout options |
//! | `Handshake`  | endianness, version mismatch, bad preamble        |
//! | `Transfer`   | socket read/write, invalid index header           |
//! | `Build`      | index builder failure reported by the server      |
//! | `Usage`      | invalid parameters, out-of-order session calls    |
//!
//! # Propagation
//!
//! There is no retry inside a session. Any error aborts the session; the
//! caller may start a new one over a fresh connection.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failure class of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Establishing or configuring the socket failed.
    Connection,
    /// Preamble exchange failed.
    Handshake,
    /// Frame transfer failed after the handshake.
    Transfer,
    /// The index builder failed on the server.
    Build,
    /// The caller misused the API.
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Handshake => write!(f, "handshake"),
            Self::Transfer => write!(f, "transfer"),
            Self::Build => write!(f, "build"),
            Self::Usage => write!(f, "usage"),
        }
    }
}

/// Sub-step of a connect attempt that failed.
///
/// Only used for diagnostics: every step surfaces as
/// [`ProtocolError::ConnectTimeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    /// Starting the TCP handshake.
    Initiate,
    /// Waiting for the socket to become writable.
    WaitReady,
    /// The wait elapsed without the peer answering.
    Elapsed,
    /// Fetching the pending socket error status.
    FetchErrorStatus,
    /// The socket reported a pending error.
    PendingError,
    /// Switching the socket back to blocking mode.
    RestoreBlocking,
}

impl fmt::Display for ConnectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiate => write!(f, "initiate"),
            Self::WaitReady => write!(f, "wait_ready"),
            Self::Elapsed => write!(f, "elapsed"),
            Self::FetchErrorStatus => write!(f, "fetch_error_status"),
            Self::PendingError => write!(f, "pending_error"),
            Self::RestoreBlocking => write!(f, "restore_blocking"),
        }
    }
}

/// Phase of the handshake a [`ProtocolError::HandshakeFailed`] happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Reading or writing the preamble.
    Preamble,
    /// Checking the byte order of both peers.
    EndiannessCheck,
    /// Comparing protocol versions and peer roles.
    VersionExchange,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preamble => write!(f, "preamble exchange"),
            Self::EndiannessCheck => write!(f, "endianness check"),
            Self::VersionExchange => write!(f, "version exchange"),
        }
    }
}

/// Errors raised by the external index build protocol.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The local socket could not be allocated.
    #[error("external index: socket creation failed")]
    SocketCreateFailed {
        /// Underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// The server host name could not be resolved.
    #[error("external index: getaddrinfo {detail}")]
    AddressResolution {
        /// Resolver message.
        detail: String,
    },

    /// The TCP connection was not established in time.
    ///
    /// Every connect sub-step maps to this variant.
    #[error("external index: connect timeout")]
    ConnectTimeout {
        /// The sub-step that failed.
        step: ConnectStep,
        /// Underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// The send timeout socket option could not be applied.
    #[error("external index: failed to set send timeout for socket")]
    SendTimeoutSetFailed {
        /// Underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// The receive timeout socket option could not be applied.
    #[error("external index: failed to set receive timeout for socket")]
    RecvTimeoutSetFailed {
        /// Underlying cause, if any.
        #[source]
        source: Option<io::Error>,
    },

    /// TLS negotiation with the peer failed.
    #[error("external index: tls handshake failed: {detail}")]
    TlsHandshake {
        /// TLS library message.
        detail: String,
    },

    /// TLS material could not be loaded or assembled.
    #[error("external index: tls configuration error: {detail}")]
    TlsConfig {
        /// What went wrong.
        detail: String,
    },

    /// One of the peers is not little-endian.
    #[error("external indexing is supported only for little endian byte ordering")]
    UnsupportedEndianness,

    /// Client and server speak different protocol versions.
    #[error(
        "external index protocol version mismatch - client version: {client}, server version: {server}"
    )]
    ProtocolVersionMismatch {
        /// Version spoken by the client.
        client: u32,
        /// Version spoken by the server.
        server: u32,
    },

    /// The handshake failed for a reason other than endianness or version.
    #[error("external index handshake failed during {phase}: {reason}")]
    HandshakeFailed {
        /// Phase that failed.
        phase: HandshakePhase,
        /// Human-readable reason.
        reason: String,
    },

    /// Writing to the socket failed or timed out.
    #[error("external index socket send failed")]
    SocketWriteFailed {
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// Reading from the socket failed, timed out, or the peer closed early.
    #[error("external index socket read failed")]
    SocketReadFailed {
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// The index header was short or failed its consistency check.
    #[error("received invalid index header")]
    InvalidIndexHeader {
        /// Why the header was rejected.
        reason: String,
    },

    /// The index body did not match the checksum declared in its header.
    #[error("received corrupted index body")]
    IndexBodyCorrupted {
        /// Checksum from the header.
        expected: u32,
        /// Checksum of the received bytes.
        actual: u32,
    },

    /// A frame was truncated or could not be parsed.
    #[error("Invalid frame received")]
    InvalidFrame,

    /// A frame carried an unknown or out-of-sequence message tag.
    #[error("Invalid message header")]
    UnexpectedMessage {
        /// The tag that was received.
        tag: u32,
    },

    /// A vector record arrived before the metadata frame.
    #[error("send init message first")]
    MissingInit,

    /// The server reported a build failure.
    #[error("external index error: {detail}")]
    Build {
        /// Free-text detail sent by the server.
        detail: String,
    },

    /// Index metadata failed validation.
    #[error("invalid index metadata: {0}")]
    InvalidMetadata(String),

    /// A vector payload does not match the session layout.
    #[error("Wrong number of dimensions: {actual} instead of {expected} expected")]
    InvalidVector {
        /// Payload elements received.
        actual: usize,
        /// Payload elements required by the metadata.
        expected: usize,
    },

    /// A session method was called in the wrong state.
    #[error("illegal session transition from {from} to {to}")]
    IllegalTransition {
        /// State the session was in.
        from: &'static str,
        /// State the call would have moved to.
        to: &'static str,
    },

    /// A fault-injection point that is not registered.
    #[error("unknown failure point (func={func} name={name})")]
    UnknownFailurePoint {
        /// Function part of the point name.
        func: String,
        /// Label part of the point name.
        name: String,
    },

    /// A receive or send exceeded its per-operation timeout on the server.
    #[error("external index: {operation} timed out")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns the failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SocketCreateFailed { .. }
            | Self::AddressResolution { .. }
            | Self::ConnectTimeout { .. }
            | Self::SendTimeoutSetFailed { .. }
            | Self::RecvTimeoutSetFailed { .. }
            | Self::TlsHandshake { .. }
            | Self::TlsConfig { .. } => ErrorKind::Connection,
            Self::UnsupportedEndianness
            | Self::ProtocolVersionMismatch { .. }
            | Self::HandshakeFailed { .. } => ErrorKind::Handshake,
            Self::SocketWriteFailed { .. }
            | Self::SocketReadFailed { .. }
            | Self::InvalidIndexHeader { .. }
            | Self::IndexBodyCorrupted { .. }
            | Self::InvalidFrame
            | Self::UnexpectedMessage { .. }
            | Self::MissingInit
            | Self::Timeout { .. }
            | Self::Io(_) => ErrorKind::Transfer,
            Self::Build { .. } => ErrorKind::Build,
            Self::InvalidMetadata(_)
            | Self::InvalidVector { .. }
            | Self::IllegalTransition { .. }
            | Self::UnknownFailurePoint { .. } => ErrorKind::Usage,
        }
    }

    /// Creates a handshake failure for the given phase.
    #[must_use]
    pub fn handshake_failed(phase: HandshakePhase, reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            phase,
            reason: reason.into(),
        }
    }

    /// Creates a socket read failure from an I/O error.
    #[must_use]
    pub const fn read_failed(source: io::Error) -> Self {
        Self::SocketReadFailed { source }
    }

    /// Creates a socket write failure from an I/O error.
    #[must_use]
    pub const fn write_failed(source: io::Error) -> Self {
        Self::SocketWriteFailed { source }
    }

    /// Creates the read failure reported when the peer closes before a
    /// fixed-size read completed.
    ///
    /// Surfaces as "resource temporarily unavailable" so a truncated index
    /// is never mistaken for a complete one.
    #[must_use]
    pub fn peer_closed_early(received: u64, expected: u64) -> Self {
        Self::SocketReadFailed {
            source: io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "resource temporarily unavailable: peer closed after {received} of {expected} bytes"
                ),
            ),
        }
    }

    /// Creates an invalid index header error.
    #[must_use]
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidIndexHeader {
            reason: reason.into(),
        }
    }

    /// Creates the error produced by an injected fault at a call site that
    /// has no real I/O error to report.
    #[must_use]
    pub fn injected() -> io::Error {
        io::Error::other("injected failure")
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_stable_connection_messages() {
        let err = ProtocolError::ConnectTimeout {
            step: ConnectStep::PendingError,
            source: None,
        };
        assert_eq!(err.to_string(), "external index: connect timeout");
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = ProtocolError::SendTimeoutSetFailed { source: None };
        assert_eq!(
            err.to_string(),
            "external index: failed to set send timeout for socket"
        );

        let err = ProtocolError::RecvTimeoutSetFailed { source: None };
        assert_eq!(
            err.to_string(),
            "external index: failed to set receive timeout for socket"
        );
    }

    #[test]
    fn test_version_mismatch_message() {
        let err = ProtocolError::ProtocolVersionMismatch {
            client: 1,
            server: 2,
        };
        assert_eq!(
            err.to_string(),
            "external index protocol version mismatch - client version: 1, server version: 2"
        );
        assert_eq!(err.kind(), ErrorKind::Handshake);
    }

    #[test]
    fn test_endianness_message() {
        assert_eq!(
            ProtocolError::UnsupportedEndianness.to_string(),
            "external indexing is supported only for little endian byte ordering"
        );
    }

    #[test]
    fn test_peer_closed_early_is_resource_unavailable() {
        let err = ProtocolError::peer_closed_early(10, 100);
        assert_eq!(err.to_string(), "external index socket read failed");
        assert_eq!(err.kind(), ErrorKind::Transfer);

        let source = err.source().unwrap();
        assert!(source.to_string().contains("resource temporarily unavailable"));
        if let ProtocolError::SocketReadFailed { source } = &err {
            assert_eq!(source.kind(), io::ErrorKind::WouldBlock);
        } else {
            panic!("expected SocketReadFailed");
        }
    }

    #[test]
    fn test_build_error_prefix() {
        let err = ProtocolError::Build {
            detail: "duplicate vector id 7".into(),
        };
        assert_eq!(err.to_string(), "external index error: duplicate vector id 7");
        assert_eq!(err.kind(), ErrorKind::Build);
    }

    #[test]
    fn test_handshake_failure_names_phase() {
        let err = ProtocolError::handshake_failed(HandshakePhase::Preamble, "bad magic");
        assert_eq!(
            err.to_string(),
            "external index handshake failed during preamble exchange: bad magic"
        );
    }
}
