//! Client build session.
//!
//! # State Machine
//!
//! ```text
//! Connecting ─► Handshaking ─► SendingMetadata ─► StreamingVectors
//!                                                        │
//!          Complete ◄── ReceivingBody ◄── AwaitingHeader ◄┘
//!
//! any state ──(error)──► Failed
//! ```
//!
//! Each transition is one method. Calling a method in the wrong state is a
//! [`ProtocolError::IllegalTransition`]; any other error moves the session
//! to `Failed` and drops the connection. There is no retry in place: the
//! caller starts a new session.
//!
//! Frames are written without waiting for acknowledgements. Vector frames
//! are batched in a local buffer and written when it fills, so back-pressure
//! comes from the socket send timeout.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use extidx_core::failure_point::{END_MESSAGE, RECV_HEADER};
use extidx_core::protocol::{
    ClientFrame, ClientHandshake, ERR_MSG, FrameCodec, INDEX_HEADER_LEN, INDEX_MSG, INIT_MSG,
    IndexHeader, IndexMetadata, PREAMBLE_LEN, Preamble, TAG_LEN, VectorRecord,
    decode_error_message, error_message_len,
};
use extidx_core::error::HandshakePhase;
use extidx_core::{FailurePoints, ProtocolError, ProtocolResult};
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BuildParams, ClientConfig};
use crate::transport::Transport;

/// Buffered vector bytes that trigger a socket write.
const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Largest single read while receiving the index body.
const BODY_READ_CHUNK: usize = 1024 * 1024;

/// Position of a session in the build protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected yet.
    Connecting,
    /// Connected; preambles not exchanged.
    Handshaking,
    /// Handshake done; metadata not sent.
    SendingMetadata,
    /// Streaming vector records.
    StreamingVectors,
    /// End of stream sent; waiting for the index header.
    AwaitingHeader,
    /// Header received; reading the body.
    ReceivingBody,
    /// Index received and handed over.
    Complete,
    /// The session failed and cannot continue.
    Failed,
}

impl SessionState {
    /// Returns the state name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::SendingMetadata => "sending_metadata",
            Self::StreamingVectors => "streaming_vectors",
            Self::AwaitingHeader => "awaiting_header",
            Self::ReceivingBody => "receiving_body",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives a completed index for persistence.
pub trait IndexSink {
    /// Stores the index. Called at most once per session, only after the
    /// body was received in full and passed its checksum.
    ///
    /// # Errors
    ///
    /// An error is returned to the caller of [`BuildSession::run`] as is.
    fn store(&mut self, header: &IndexHeader, body: Vec<u8>) -> ProtocolResult<()>;
}

impl<F> IndexSink for F
where
    F: FnMut(&IndexHeader, Vec<u8>) -> ProtocolResult<()>,
{
    fn store(&mut self, header: &IndexHeader, body: Vec<u8>) -> ProtocolResult<()> {
        self(header, body)
    }
}

/// Summary of a completed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Session identifier used in logs.
    pub session_id: Uuid,
    /// Vectors streamed to the server.
    pub vectors_sent: u64,
    /// Header of the received index.
    pub header: IndexHeader,
}

/// One build over one connection.
pub struct BuildSession {
    config: ClientConfig,
    points: Arc<FailurePoints>,
    state: SessionState,
    transport: Option<Transport>,
    handshake: ClientHandshake,
    codec: FrameCodec,
    buffer: BytesMut,
    metadata: Option<IndexMetadata>,
    vectors_sent: u64,
    session_id: Uuid,
}

impl BuildSession {
    /// Creates a session in the `Connecting` state.
    #[must_use]
    pub fn new(config: ClientConfig, points: Arc<FailurePoints>) -> Self {
        Self {
            config,
            points,
            state: SessionState::Connecting,
            transport: None,
            handshake: ClientHandshake::new(),
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(SEND_BUFFER_SIZE),
            metadata: None,
            vectors_sent: 0,
            session_id: Uuid::new_v4(),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Returns the vectors written so far.
    #[must_use]
    pub const fn vectors_sent(&self) -> u64 {
        self.vectors_sent
    }

    /// Returns the metadata sent to the server, once sent.
    #[must_use]
    pub const fn metadata(&self) -> Option<&IndexMetadata> {
        self.metadata.as_ref()
    }

    /// Runs a whole build: connect, handshake, metadata, the records, then
    /// the index, which is handed to `sink`.
    ///
    /// The iterator's lower size bound is sent as the row count hint.
    ///
    /// # Errors
    ///
    /// Returns the first error of any step. Nothing reaches `sink` unless
    /// the whole index was received.
    pub fn run<I>(
        mut self,
        params: &BuildParams,
        records: I,
        sink: &mut dyn IndexSink,
    ) -> ProtocolResult<BuildOutcome>
    where
        I: IntoIterator<Item = VectorRecord>,
    {
        let records = records.into_iter();
        let row_count = records.size_hint().0 as u64;
        // Refuse bad parameters before opening a connection
        params.to_metadata(row_count)?;

        self.connect()?;
        self.handshake()?;
        self.send_metadata(params, row_count)?;
        for record in records {
            self.send_vector(record)?;
        }
        self.finish_stream()?;
        let header = self.receive_header()?;
        let body = self.receive_body(&header)?;
        sink.store(&header, body)?;

        info!(
            session_id = %self.session_id,
            vectors = self.vectors_sent,
            body_size = header.body_size,
            "external index build complete"
        );
        Ok(BuildOutcome {
            session_id: self.session_id,
            vectors_sent: self.vectors_sent,
            header,
        })
    }

    /// `Connecting → Handshaking`: opens the connection.
    ///
    /// # Errors
    ///
    /// Connection errors from [`Transport::connect`].
    pub fn connect(&mut self) -> ProtocolResult<()> {
        self.begin(SessionState::Connecting, SessionState::Handshaking)?;
        let result = Transport::connect(&self.config, Arc::clone(&self.points));
        let transport = self.guard(result)?;
        debug!(
            session_id = %self.session_id,
            peer = %transport.peer(),
            secure = transport.is_secure(),
            "connected"
        );
        self.transport = Some(transport);
        self.state = SessionState::Handshaking;
        Ok(())
    }

    /// `Handshaking → SendingMetadata`: exchanges preambles.
    ///
    /// # Errors
    ///
    /// Handshake errors. A server error frame in place of the preamble
    /// becomes [`ProtocolError::UnsupportedEndianness`] or
    /// [`ProtocolError::HandshakeFailed`].
    pub fn handshake(&mut self) -> ProtocolResult<()> {
        self.begin(SessionState::Handshaking, SessionState::SendingMetadata)?;
        let result = self.exchange_preambles();
        self.guard(result)?;
        self.state = SessionState::SendingMetadata;
        Ok(())
    }

    /// `SendingMetadata → StreamingVectors`: sends the metadata frame and,
    /// for PQ builds, the codebook.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidMetadata`] for bad parameters, or a socket
    /// write failure.
    pub fn send_metadata(&mut self, params: &BuildParams, row_count: u64) -> ProtocolResult<()> {
        self.begin(SessionState::SendingMetadata, SessionState::StreamingVectors)?;
        let result = self.write_metadata(params, row_count);
        self.guard(result)?;
        self.state = SessionState::StreamingVectors;
        Ok(())
    }

    /// Queues one record; stays in `StreamingVectors`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidVector`] if the payload does not match the
    /// metadata, or a socket write failure.
    pub fn send_vector(&mut self, record: VectorRecord) -> ProtocolResult<()> {
        self.begin(SessionState::StreamingVectors, SessionState::StreamingVectors)?;
        let result = self.write_vector(record);
        self.guard(result)
    }

    /// `StreamingVectors → AwaitingHeader`: sends the end-of-stream marker.
    ///
    /// # Errors
    ///
    /// Socket write failure.
    pub fn finish_stream(&mut self) -> ProtocolResult<()> {
        self.begin(SessionState::StreamingVectors, SessionState::AwaitingHeader)?;
        if self.points.is_triggered(END_MESSAGE) {
            // The server sees a second metadata frame
            self.buffer.put_u32_le(INIT_MSG);
        } else {
            let result = self.codec.encode(ClientFrame::End, &mut self.buffer);
            self.guard(result)?;
        }
        let result = self.flush();
        self.guard(result)?;
        debug!(session_id = %self.session_id, vectors = self.vectors_sent, "vector stream sent");
        self.state = SessionState::AwaitingHeader;
        Ok(())
    }

    /// `AwaitingHeader → ReceivingBody`: waits for the index header.
    ///
    /// Waits up to the header timeout, since the server builds the index
    /// before it answers.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidIndexHeader`] for a short or inconsistent
    /// header, [`ProtocolError::Build`] if the server reports an error.
    pub fn receive_header(&mut self) -> ProtocolResult<IndexHeader> {
        self.begin(SessionState::AwaitingHeader, SessionState::ReceivingBody)?;
        let result = self.read_header();
        let header = self.guard(result)?;
        debug!(
            session_id = %self.session_id,
            num_vectors = header.num_vectors,
            body_size = header.body_size,
            "index header received"
        );
        self.state = SessionState::ReceivingBody;
        Ok(header)
    }

    /// `ReceivingBody → Complete`: reads exactly the declared body.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::SocketReadFailed`] if the peer closes early,
    /// [`ProtocolError::IndexBodyCorrupted`] on a checksum mismatch.
    pub fn receive_body(&mut self, header: &IndexHeader) -> ProtocolResult<Vec<u8>> {
        self.begin(SessionState::ReceivingBody, SessionState::Complete)?;
        let result = self.read_body(header);
        let body = self.guard(result)?;
        self.state = SessionState::Complete;
        self.transport = None;
        Ok(body)
    }

    fn begin(&self, from: SessionState, to: SessionState) -> ProtocolResult<()> {
        if self.state == from {
            Ok(())
        } else {
            Err(ProtocolError::IllegalTransition {
                from: self.state.as_str(),
                to: to.as_str(),
            })
        }
    }

    /// Moves to `Failed` and drops the connection on error.
    fn guard<T>(&mut self, result: ProtocolResult<T>) -> ProtocolResult<T> {
        if let Err(err) = &result {
            warn!(
                session_id = %self.session_id,
                state = %self.state,
                kind = %err.kind(),
                error = %err,
                "external index build failed"
            );
            self.state = SessionState::Failed;
            self.transport = None;
        }
        result
    }

    fn transport(&mut self) -> ProtocolResult<&mut Transport> {
        let state = self.state.as_str();
        self.transport
            .as_mut()
            .ok_or(ProtocolError::IllegalTransition {
                from: state,
                to: "io",
            })
    }

    fn flush(&mut self) -> ProtocolResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let bytes = self.buffer.split().freeze();
        self.transport()?.send(&bytes)
    }

    fn exchange_preambles(&mut self) -> ProtocolResult<()> {
        let preamble = self.handshake.create_preamble(&self.points)?;
        self.codec
            .encode(ClientFrame::Preamble(preamble), &mut self.buffer)?;
        self.flush()?;

        let mut reply = [0u8; PREAMBLE_LEN];
        self.transport()?.recv_exact(&mut reply[..TAG_LEN])?;
        if reply[..TAG_LEN] == ERR_MSG.to_le_bytes() {
            return Err(self.read_rejection());
        }
        self.transport()?.recv_exact(&mut reply[TAG_LEN..])?;

        let reply = Preamble::decode(&reply)?;
        self.handshake.process_response(&reply, &self.points)?;
        debug!(session_id = %self.session_id, version = reply.version, "handshake complete");
        Ok(())
    }

    fn write_metadata(&mut self, params: &BuildParams, row_count: u64) -> ProtocolResult<()> {
        let metadata = params.to_metadata(row_count)?;
        self.codec
            .encode(ClientFrame::Metadata(metadata), &mut self.buffer)?;
        if let Some(codebook) = params.codebook.as_ref().filter(|_| metadata.pq) {
            for row in codebook.rows() {
                self.codec
                    .encode(ClientFrame::CodebookRow(row.to_vec()), &mut self.buffer)?;
            }
        }
        self.metadata = Some(metadata);
        info!(
            session_id = %self.session_id,
            dimensions = metadata.dimensions,
            metric = %metadata.metric,
            quant_bits = metadata.quantization.bits(),
            m = metadata.m,
            pq = metadata.pq,
            row_count,
            "sending index metadata"
        );
        self.flush()
    }

    fn write_vector(&mut self, record: VectorRecord) -> ProtocolResult<()> {
        self.codec
            .encode(ClientFrame::Vector(record), &mut self.buffer)?;
        self.vectors_sent += 1;
        if self.buffer.len() >= SEND_BUFFER_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn read_header(&mut self) -> ProtocolResult<IndexHeader> {
        let header_timeout = self.config.header_timeout;
        let recv_timeout = self.config.recv_timeout;
        self.transport()?.set_recv_timeout(header_timeout)?;

        let mut bytes = [0u8; INDEX_HEADER_LEN];
        let received = self.transport()?.recv_up_to(&mut bytes[..TAG_LEN])?;
        if received == TAG_LEN && bytes[..TAG_LEN] == ERR_MSG.to_le_bytes() {
            return Err(self.read_error_frame());
        }
        let received = if received == TAG_LEN {
            TAG_LEN + self.transport()?.recv_up_to(&mut bytes[TAG_LEN..])?
        } else {
            received
        };
        if received < INDEX_HEADER_LEN {
            return Err(ProtocolError::invalid_header(format!(
                "received {received} of {INDEX_HEADER_LEN} header bytes"
            )));
        }
        if self.points.is_triggered(RECV_HEADER) {
            return Err(ProtocolError::invalid_header("header check failed"));
        }
        if bytes[..TAG_LEN] != INDEX_MSG.to_le_bytes() {
            return Err(ProtocolError::invalid_header("unexpected message tag"));
        }

        let header = IndexHeader::decode(&bytes)?;
        self.transport()?.set_recv_timeout(recv_timeout)?;
        Ok(header)
    }

    fn read_body(&mut self, header: &IndexHeader) -> ProtocolResult<Vec<u8>> {
        let size = usize::try_from(header.body_size)
            .map_err(|_| ProtocolError::invalid_header("body does not fit in memory"))?;
        // Grow with the bytes actually received, not the declared size
        let mut body = Vec::with_capacity(size.min(BODY_READ_CHUNK));
        while body.len() < size {
            let start = body.len();
            body.resize(start + (size - start).min(BODY_READ_CHUNK), 0);
            self.transport()?.recv_exact(&mut body[start..])?;
        }
        header.verify_body(&body)?;
        Ok(body)
    }

    /// Reads an error frame sent in place of the server preamble.
    fn read_rejection(&mut self) -> ProtocolError {
        match self.read_error_message() {
            Ok(detail) if detail == ProtocolError::UnsupportedEndianness.to_string() => {
                ProtocolError::UnsupportedEndianness
            },
            Ok(detail) => ProtocolError::handshake_failed(HandshakePhase::Preamble, detail),
            Err(err) => err,
        }
    }

    /// Reads the rest of an error frame whose tag was already consumed.
    fn read_error_frame(&mut self) -> ProtocolError {
        match self.read_error_message() {
            Ok(detail) => ProtocolError::Build { detail },
            Err(err) => err,
        }
    }

    fn read_error_message(&mut self) -> ProtocolResult<String> {
        let transport = self.transport()?;
        let mut len = [0u8; 4];
        transport.recv_exact(&mut len)?;
        let len = error_message_len(u32::from_le_bytes(len))?;
        let mut message = vec![0u8; len];
        transport.recv_exact(&mut message)?;
        Ok(decode_error_message(&message))
    }
}

impl fmt::Debug for BuildSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSession")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("vectors_sent", &self.vectors_sent)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use extidx_core::ErrorKind;
    use extidx_core::protocol::{
        END_MSG, MAX_INDEX_BODY_SIZE, MetricKind, PeerRole, ServerFrame, encode_error_frame,
    };

    use super::*;

    /// Serves one connection on an ephemeral port with `handler`.
    fn mock_server<F>(handler: F) -> (u16, JoinHandle<()>)
    where
        F: FnOnce(std::net::TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            handler(stream);
        });
        (port, handle)
    }

    fn session_on(port: u16) -> BuildSession {
        BuildSession::new(
            ClientConfig::new("127.0.0.1", port),
            Arc::new(FailurePoints::new()),
        )
    }

    fn reject_preamble_with(message: String) -> (u16, JoinHandle<()>) {
        mock_server(move |mut stream| {
            let mut preamble = [0u8; PREAMBLE_LEN];
            stream.read_exact(&mut preamble).unwrap();
            let mut buf = BytesMut::new();
            encode_error_frame(&message, &mut buf);
            stream.write_all(&buf).unwrap();
        })
    }

    fn session() -> BuildSession {
        BuildSession::new(
            ClientConfig::new("127.0.0.1", 1),
            Arc::new(FailurePoints::new()),
        )
    }

    #[test]
    fn test_out_of_order_call() {
        let mut session = session();
        let err = session
            .send_metadata(&BuildParams::new(4, MetricKind::L2sq), 0)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal session transition from connecting to streaming_vectors"
        );
        // A usage error does not fail the session
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_failed_session_stays_failed() {
        let mut session = BuildSession::new(
            ClientConfig::new("host.invalid", 1),
            Arc::new(FailurePoints::new()),
        );
        assert!(session.connect().is_err());
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, ProtocolError::IllegalTransition { from: "failed", .. }));
    }

    // =========================================================================
    // Server replies
    // =========================================================================

    #[test]
    fn test_endianness_rejection_is_handshake_error() {
        let (port, server) =
            reject_preamble_with(ProtocolError::UnsupportedEndianness.to_string());
        let mut session = session_on(port);
        session.connect().unwrap();

        let err = session.handshake().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedEndianness));
        assert_eq!(err.kind(), ErrorKind::Handshake);
        assert_eq!(session.state(), SessionState::Failed);
        server.join().unwrap();
    }

    #[test]
    fn test_preamble_rejection_is_handshake_error() {
        let (port, server) = reject_preamble_with("Invalid frame received".to_string());
        let mut session = session_on(port);
        session.connect().unwrap();

        let err = session.handshake().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::HandshakeFailed { phase: HandshakePhase::Preamble, ref reason }
                if reason == "Invalid frame received"
        ));
        assert_eq!(err.kind(), ErrorKind::Handshake);
        server.join().unwrap();
    }

    #[test]
    fn test_oversized_body_claim_fails_on_read() {
        let (port, server) = mock_server(|mut stream| {
            let mut preamble = [0u8; PREAMBLE_LEN];
            stream.read_exact(&mut preamble).unwrap();

            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            codec
                .encode(
                    ServerFrame::Preamble(Preamble::local(PeerRole::IndexingServer)),
                    &mut buf,
                )
                .unwrap();
            stream.write_all(&buf).unwrap();

            // Drain the request so closing sends a clean FIN
            let mut request = Vec::new();
            let mut chunk = [0u8; 256];
            while !request.ends_with(&END_MSG.to_le_bytes()) {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "client closed before END");
                request.extend_from_slice(&chunk[..n]);
            }

            buf.clear();
            let header = IndexHeader {
                format: *b"EXGR",
                num_vectors: 1,
                body_size: MAX_INDEX_BODY_SIZE,
                body_crc32: 0,
            };
            codec
                .encode(ServerFrame::IndexHeader(header), &mut buf)
                .unwrap();
            buf.extend_from_slice(&[0u8; 64]);
            stream.write_all(&buf).unwrap();
        });

        let mut session = session_on(port);
        session.connect().unwrap();
        session.handshake().unwrap();
        session
            .send_metadata(&BuildParams::new(4, MetricKind::L2sq), 0)
            .unwrap();
        session.finish_stream().unwrap();
        let header = session.receive_header().unwrap();
        assert_eq!(header.body_size, MAX_INDEX_BODY_SIZE);

        let err = session.receive_body(&header).unwrap_err();
        assert!(matches!(err, ProtocolError::SocketReadFailed { .. }));
        server.join().unwrap();
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::AwaitingHeader.to_string(), "awaiting_header");
        assert_eq!(SessionState::ReceivingBody.as_str(), "receiving_body");
    }
}
