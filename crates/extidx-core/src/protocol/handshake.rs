//! Preamble exchange and handshake state machines.
//!
//! # Handshake Sequence
//!
//! ```text
//! Client                                         Server
//!   |                                               |
//!   |  check local byte order                       |
//!   |  -- Preamble { version, marker, CLIENT } -->  |
//!   |                                               |  validate magic
//!   |                                               |  check peer byte order
//!   |  <-- Preamble { version, marker, SERVER } --  |
//!   |      OR                                       |
//!   |  <-- Error { "... little endian ..." } -----  |
//!   |                                               |
//!   |  compare versions, check server role          |
//! ```
//!
//! On a version mismatch the server still replies with its own preamble so
//! the client can report both versions, then closes the connection.
//!
//! Both peers move through `Init -> EndiannessCheck -> VersionExchange ->
//! Ready`. Any failure leaves the state machine in `Failed`; no further frame
//! may be exchanged on that connection.

use bytes::{Buf, BufMut};

use super::{ENDIANNESS_MARKER, PREAMBLE_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use crate::error::{HandshakePhase, ProtocolError, ProtocolResult};
use crate::failure_point::{CHECK_LITTLE_ENDIAN, CHECK_PROTOCOL_VERSION, FailurePoints};

/// Byte order advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Endianness {
    /// Byte order of this process.
    #[must_use]
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    fn marker_bytes(self) -> [u8; 4] {
        match self {
            Self::Little => ENDIANNESS_MARKER.to_le_bytes(),
            Self::Big => ENDIANNESS_MARKER.to_be_bytes(),
        }
    }

    fn from_marker(bytes: [u8; 4]) -> ProtocolResult<Self> {
        if bytes == ENDIANNESS_MARKER.to_le_bytes() {
            Ok(Self::Little)
        } else if bytes == ENDIANNESS_MARKER.to_be_bytes() {
            Ok(Self::Big)
        } else {
            Err(ProtocolError::handshake_failed(
                HandshakePhase::EndiannessCheck,
                format!("unrecognized endianness marker {bytes:02x?}"),
            ))
        }
    }
}

/// Role a peer announces in its preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The database side streaming vectors.
    Client,
    /// The indexing server building the index.
    IndexingServer,
}

impl PeerRole {
    const fn wire_id(self) -> u32 {
        match self {
            Self::Client => 0,
            Self::IndexingServer => 1,
        }
    }

    fn from_wire(id: u32) -> ProtocolResult<Self> {
        match id {
            0 => Ok(Self::Client),
            1 => Ok(Self::IndexingServer),
            other => Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                format!("unknown peer role {other}"),
            )),
        }
    }
}

/// First frame sent by each peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Protocol version the peer speaks.
    pub version: u32,
    /// Byte order of the peer.
    pub endianness: Endianness,
    /// Role of the peer.
    pub role: PeerRole,
}

impl Preamble {
    /// Preamble of this process in the given role.
    #[must_use]
    pub const fn local(role: PeerRole) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            endianness: Endianness::native(),
            role,
        }
    }

    /// Overrides the advertised version.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Overrides the advertised byte order.
    #[must_use]
    pub const fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Appends the 16-byte encoding.
    ///
    /// Integer fields use the advertised byte order, so a preamble built
    /// with [`Endianness::Big`] looks exactly like one from a big-endian
    /// peer.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(&PROTOCOL_MAGIC);
        match self.endianness {
            Endianness::Little => buf.put_u32_le(self.version),
            Endianness::Big => buf.put_u32(self.version),
        }
        buf.put_slice(&self.endianness.marker_bytes());
        match self.endianness {
            Endianness::Little => buf.put_u32_le(self.role.wire_id()),
            Endianness::Big => buf.put_u32(self.role.wire_id()),
        }
    }

    /// Returns the 16-byte encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PREAMBLE_LEN] {
        let mut out = [0u8; PREAMBLE_LEN];
        self.put(&mut &mut out[..]);
        out
    }

    /// Decodes a preamble.
    ///
    /// The magic is validated first and the marker next, so a big-endian
    /// peer is recognized even if its other fields are unreadable. The role
    /// of a big-endian peer is not validated.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::HandshakeFailed`] on a short buffer, bad
    /// magic, unknown marker or unknown role.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                format!("short preamble of {} bytes", bytes.len()),
            ));
        }
        let mut buf = &bytes[..PREAMBLE_LEN];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                "invalid protocol magic",
            ));
        }
        let mut version = [0u8; 4];
        buf.copy_to_slice(&mut version);
        let mut marker = [0u8; 4];
        buf.copy_to_slice(&mut marker);
        let endianness = Endianness::from_marker(marker)?;

        let (version, role) = match endianness {
            Endianness::Little => (
                u32::from_le_bytes(version),
                PeerRole::from_wire(buf.get_u32_le())?,
            ),
            // The rest of a big-endian preamble is only used for diagnostics
            Endianness::Big => (u32::from_be_bytes(version), PeerRole::Client),
        };

        Ok(Self {
            version,
            endianness,
            role,
        })
    }
}

/// Handshake progress shared by both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Nothing exchanged yet.
    #[default]
    Init,
    /// Checking byte order.
    EndiannessCheck,
    /// Comparing versions and roles.
    VersionExchange,
    /// Handshake completed; frames may flow.
    Ready,
    /// Handshake failed; the connection must be closed.
    Failed,
}

/// What the server must send after processing a client preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Send this preamble and continue with the session.
    Accept(Preamble),
    /// Send this preamble, then close the connection.
    VersionMismatch(Preamble),
    /// Send an error frame with this message, then close the connection.
    Reject(String),
}

/// Server-side handshake handler.
#[derive(Debug, Default)]
pub struct ServerHandshake {
    state: HandshakeState,
    negotiated_version: Option<u32>,
}

impl ServerHandshake {
    /// Creates a handler awaiting the client preamble.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes the client preamble and decides the reply.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a preamble was already processed.
    pub fn process_preamble(&mut self, preamble: &Preamble) -> ProtocolResult<HandshakeReply> {
        if self.state != HandshakeState::Init {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                "unexpected preamble (already handshaked)",
            ));
        }

        self.state = HandshakeState::EndiannessCheck;
        if preamble.endianness != Endianness::Little {
            self.state = HandshakeState::Failed;
            return Ok(HandshakeReply::Reject(
                ProtocolError::UnsupportedEndianness.to_string(),
            ));
        }

        self.state = HandshakeState::VersionExchange;
        if preamble.role != PeerRole::Client {
            self.state = HandshakeState::Failed;
            return Ok(HandshakeReply::Reject(format!(
                "unexpected peer role {:?}",
                preamble.role
            )));
        }

        let reply = Preamble::local(PeerRole::IndexingServer);
        if preamble.version != PROTOCOL_VERSION {
            self.state = HandshakeState::Failed;
            return Ok(HandshakeReply::VersionMismatch(reply));
        }

        self.state = HandshakeState::Ready;
        self.negotiated_version = Some(PROTOCOL_VERSION);
        Ok(HandshakeReply::Accept(reply))
    }

    /// Returns the current handshake state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns the negotiated protocol version if the handshake completed.
    #[must_use]
    pub const fn negotiated_version(&self) -> Option<u32> {
        self.negotiated_version
    }

    /// Returns `true` if the handshake completed successfully.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Ready)
    }
}

/// Client-side handshake handler.
#[derive(Debug, Default)]
pub struct ClientHandshake {
    state: HandshakeState,
    negotiated_version: Option<u32>,
}

impl ClientHandshake {
    /// Creates a handler that has not sent anything yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the local byte order and returns the preamble to send.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedEndianness`] on a big-endian host
    /// (or when the `CHECK_LITTLE_ENDIAN` point triggers).
    pub fn create_preamble(&mut self, points: &FailurePoints) -> ProtocolResult<Preamble> {
        if self.state != HandshakeState::Init {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                "preamble already sent",
            ));
        }

        self.state = HandshakeState::EndiannessCheck;
        if Endianness::native() != Endianness::Little || points.is_triggered(CHECK_LITTLE_ENDIAN) {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::UnsupportedEndianness);
        }

        self.state = HandshakeState::VersionExchange;
        Ok(Preamble::local(PeerRole::Client))
    }

    /// Processes the server preamble.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ProtocolVersionMismatch`] if the versions
    /// differ (or when the `CHECK_PROTOCOL_VERSION` point triggers), and
    /// [`ProtocolError::HandshakeFailed`] if the peer is not an indexing
    /// server or the call is out of order.
    pub fn process_response(
        &mut self,
        preamble: &Preamble,
        points: &FailurePoints,
    ) -> ProtocolResult<()> {
        if self.state != HandshakeState::VersionExchange {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::VersionExchange,
                "server preamble received before client preamble was sent",
            ));
        }

        if preamble.endianness != Endianness::Little {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::UnsupportedEndianness);
        }

        if preamble.version != PROTOCOL_VERSION || points.is_triggered(CHECK_PROTOCOL_VERSION) {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::ProtocolVersionMismatch {
                client: PROTOCOL_VERSION,
                server: preamble.version,
            });
        }

        if preamble.role != PeerRole::IndexingServer {
            self.state = HandshakeState::Failed;
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::VersionExchange,
                format!("unsupported server type {}", preamble.role.wire_id()),
            ));
        }

        self.state = HandshakeState::Ready;
        self.negotiated_version = Some(preamble.version);
        Ok(())
    }

    /// Returns the current handshake state.
    #[must_use]
    pub const fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns the negotiated protocol version if the handshake completed.
    #[must_use]
    pub const fn negotiated_version(&self) -> Option<u32> {
        self.negotiated_version
    }

    /// Returns `true` if the handshake completed successfully.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, HandshakeState::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_layout() {
        let bytes = Preamble::local(PeerRole::IndexingServer).to_bytes();
        assert_eq!(&bytes[0..4], b"EXIX");
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
    }

    #[test]
    fn test_preamble_decode() {
        let preamble = Preamble::local(PeerRole::Client).with_version(7);
        let decoded = Preamble::decode(&preamble.to_bytes()).unwrap();
        assert_eq!(decoded, preamble);
    }

    #[test]
    fn test_big_endian_preamble_detected() {
        let bytes = Preamble::local(PeerRole::Client)
            .with_endianness(Endianness::Big)
            .to_bytes();
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]);

        let decoded = Preamble::decode(&bytes).unwrap();
        assert_eq!(decoded.endianness, Endianness::Big);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Preamble::local(PeerRole::Client).to_bytes();
        bytes[0] = b'X';
        let err = Preamble::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("invalid protocol magic"));
    }

    #[test]
    fn test_short_preamble_rejected() {
        assert!(Preamble::decode(b"EXIX").is_err());
    }

    #[test]
    fn test_server_handshake_success() {
        let mut server = ServerHandshake::new();
        assert_eq!(server.state(), HandshakeState::Init);

        let reply = server
            .process_preamble(&Preamble::local(PeerRole::Client))
            .unwrap();

        assert_eq!(
            reply,
            HandshakeReply::Accept(Preamble::local(PeerRole::IndexingServer))
        );
        assert!(server.is_completed());
        assert_eq!(server.negotiated_version(), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn test_server_handshake_version_mismatch() {
        let mut server = ServerHandshake::new();
        let reply = server
            .process_preamble(&Preamble::local(PeerRole::Client).with_version(99))
            .unwrap();

        assert!(matches!(reply, HandshakeReply::VersionMismatch(p) if p.version == PROTOCOL_VERSION));
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_server_handshake_rejects_big_endian() {
        let mut server = ServerHandshake::new();
        let reply = server
            .process_preamble(&Preamble::local(PeerRole::Client).with_endianness(Endianness::Big))
            .unwrap();

        assert_eq!(
            reply,
            HandshakeReply::Reject(
                "external indexing is supported only for little endian byte ordering".into()
            )
        );
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_server_handshake_duplicate_preamble() {
        let mut server = ServerHandshake::new();
        server
            .process_preamble(&Preamble::local(PeerRole::Client))
            .unwrap();

        let result = server.process_preamble(&Preamble::local(PeerRole::Client));
        assert!(result.is_err());
        assert_eq!(server.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_client_handshake_success() {
        let points = FailurePoints::new();
        let mut client = ClientHandshake::new();

        let preamble = client.create_preamble(&points).unwrap();
        assert_eq!(preamble.role, PeerRole::Client);
        assert_eq!(client.state(), HandshakeState::VersionExchange);

        client
            .process_response(&Preamble::local(PeerRole::IndexingServer), &points)
            .unwrap();
        assert!(client.is_completed());
        assert_eq!(client.negotiated_version(), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn test_client_handshake_version_mismatch() {
        let points = FailurePoints::new();
        let mut client = ClientHandshake::new();
        client.create_preamble(&points).unwrap();

        let err = client
            .process_response(
                &Preamble::local(PeerRole::IndexingServer).with_version(2),
                &points,
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "external index protocol version mismatch - client version: 1, server version: 2"
        );
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_client_handshake_rejects_client_role() {
        let points = FailurePoints::new();
        let mut client = ClientHandshake::new();
        client.create_preamble(&points).unwrap();

        let err = client
            .process_response(&Preamble::local(PeerRole::Client), &points)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported server type 0"));
    }

    #[test]
    fn test_client_response_before_preamble() {
        let points = FailurePoints::new();
        let mut client = ClientHandshake::new();
        let result =
            client.process_response(&Preamble::local(PeerRole::IndexingServer), &points);
        assert!(result.is_err());
    }

    #[cfg(feature = "failure-points")]
    #[test]
    fn test_injected_endianness_failure() {
        let points = FailurePoints::new();
        points
            .enable(CHECK_LITTLE_ENDIAN.func, CHECK_LITTLE_ENDIAN.name, 0)
            .unwrap();

        let mut client = ClientHandshake::new();
        let err = client.create_preamble(&points).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEndianness));

        // A fresh handshake succeeds once the point disarmed itself
        ClientHandshake::new().create_preamble(&points).unwrap();
    }
}
