//! Server side of one build session.
//!
//! # Lifecycle
//!
//! ```text
//! preamble ──► metadata ──► codebook rows (pq only) ──► vectors ──► END
//!                                                                    │
//!          error frame ◄── failure at any step          build (blocking pool)
//!                                                                    │
//!                                         index header ◄─────────────┘
//!                                         index body (chunked)
//! ```
//!
//! Every receive and send is bounded by the configured socket timeout. There
//! is no session-wide deadline: a large stream may take as long as it needs
//! while each frame arrives in time.
//!
//! On failure the session sends a best-effort error frame and closes. A
//! build error travels as its bare detail so the client can prefix it once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use extidx_core::error::HandshakePhase;
use extidx_core::failure_point::SERVER_BUILD;
use extidx_core::graph::{BuildInput, BuiltIndex, IndexBuilder};
use extidx_core::protocol::{
    CODEBOOK_MSG, ClientFrame, Codebook, END_MSG, FrameCodec, HandshakeReply, INIT_MSG,
    IndexHeader, IndexMetadata, PROTOCOL_VERSION, ServerFrame, ServerHandshake, VECTOR_MSG,
};
use extidx_core::{FailurePoints, ProtocolError, ProtocolResult};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Detail sent to the client when an injected build failure fires.
pub const INJECTED_BUILD_FAILURE: &str = "index build failed";

/// Vectors between progress log lines.
const PROGRESS_INTERVAL: u64 = 10_000;

/// Settings shared by every session of a server.
#[derive(Clone)]
pub struct SessionContext {
    /// Builder invoked once per session.
    pub builder: Arc<dyn IndexBuilder>,
    /// Fault-injection registry.
    pub failure_points: Arc<FailurePoints>,
    /// Bound on each frame receive and send.
    pub socket_timeout: Duration,
    /// Largest body chunk written at once.
    pub body_chunk_size: usize,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("socket_timeout", &self.socket_timeout)
            .field("body_chunk_size", &self.body_chunk_size)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session identifier used in logs.
    pub session_id: Uuid,
    /// Vectors received.
    pub num_vectors: u64,
    /// Bytes of index body sent.
    pub body_size: u64,
    /// Wall time from preamble to last body byte.
    pub elapsed: Duration,
}

/// One connection's build session.
pub struct ServerSession<S> {
    framed: Framed<S, FrameCodec>,
    context: Arc<SessionContext>,
    handshake: ServerHandshake,
    session_id: Uuid,
    peer: SocketAddr,
    /// Set once the peer has been told why the session ends.
    reported: bool,
}

impl<S> ServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an accepted (and, if configured, TLS-terminated) stream.
    pub fn new(stream: S, peer: SocketAddr, session_id: Uuid, context: Arc<SessionContext>) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            context,
            handshake: ServerHandshake::new(),
            session_id,
            peer,
            reported: false,
        }
    }

    /// Runs the session to completion.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session. The peer has already been
    /// sent an error frame where the connection allowed it.
    pub async fn run(mut self) -> ProtocolResult<SessionSummary> {
        let started = Instant::now();
        match self.drive(started).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.report(&err).await;
                Err(err)
            },
        }
    }

    async fn drive(&mut self, started: Instant) -> ProtocolResult<SessionSummary> {
        self.handshake().await?;

        let metadata = match self.receive().await? {
            ClientFrame::Metadata(metadata) => metadata,
            other => return Err(unexpected(&other)),
        };
        info!(
            session_id = %self.session_id,
            peer = %self.peer,
            dimensions = metadata.dimensions,
            metric = %metadata.metric,
            quant_bits = metadata.quantization.bits(),
            m = metadata.m,
            pq = metadata.pq,
            row_count = metadata.row_count,
            "received index metadata"
        );

        let mut input = BuildInput::new(metadata);
        if metadata.pq {
            input.codebook = Some(self.receive_codebook(&metadata).await?);
        }

        loop {
            match self.receive().await? {
                ClientFrame::Vector(record) => {
                    input.records.push(record);
                    let received = input.records.len() as u64;
                    if received % PROGRESS_INTERVAL == 0 {
                        debug!(session_id = %self.session_id, received, "receiving vectors");
                    }
                },
                ClientFrame::End => break,
                other => return Err(unexpected(&other)),
            }
        }
        let num_vectors = input.records.len() as u64;
        info!(session_id = %self.session_id, num_vectors, "vector stream complete");

        let built = self.build(input).await?;
        let body_size = self.send_index(built).await?;

        Ok(SessionSummary {
            session_id: self.session_id,
            num_vectors,
            body_size,
            elapsed: started.elapsed(),
        })
    }

    async fn handshake(&mut self) -> ProtocolResult<()> {
        let preamble = match self.receive().await? {
            ClientFrame::Preamble(preamble) => preamble,
            other => return Err(unexpected(&other)),
        };

        match self.handshake.process_preamble(&preamble)? {
            HandshakeReply::Accept(reply) => {
                self.send(ServerFrame::Preamble(reply)).await?;
                debug!(session_id = %self.session_id, "handshake complete");
                Ok(())
            },
            HandshakeReply::VersionMismatch(reply) => {
                // The client compares versions itself and closes
                self.reported = true;
                self.send(ServerFrame::Preamble(reply)).await?;
                Err(ProtocolError::ProtocolVersionMismatch {
                    client: preamble.version,
                    server: PROTOCOL_VERSION,
                })
            },
            HandshakeReply::Reject(message) => {
                self.reported = true;
                self.send(ServerFrame::Error(message.clone())).await?;
                Err(ProtocolError::handshake_failed(HandshakePhase::Preamble, message))
            },
        }
    }

    async fn receive_codebook(&mut self, metadata: &IndexMetadata) -> ProtocolResult<Codebook> {
        let mut rows = Vec::with_capacity(metadata.num_centroids as usize);
        while rows.len() < metadata.num_centroids as usize {
            match self.receive().await? {
                ClientFrame::CodebookRow(row) => rows.push(row),
                other => return Err(unexpected(&other)),
            }
        }
        Codebook::from_rows(metadata.dimensions as usize, rows)
    }

    async fn build(&self, input: BuildInput) -> ProtocolResult<BuiltIndex> {
        let builder = Arc::clone(&self.context.builder);
        let points = Arc::clone(&self.context.failure_points);
        let started = Instant::now();

        let built = tokio::task::spawn_blocking(move || {
            if points.is_triggered(SERVER_BUILD) {
                return Err(ProtocolError::Build {
                    detail: INJECTED_BUILD_FAILURE.to_string(),
                });
            }
            builder.build(input).map_err(|e| ProtocolError::Build {
                detail: e.to_string(),
            })
        })
        .await
        .map_err(|e| ProtocolError::Build {
            detail: format!("build task failed: {e}"),
        })??;

        info!(
            session_id = %self.session_id,
            num_vectors = built.num_vectors,
            body_size = built.bytes.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "index built"
        );
        Ok(built)
    }

    /// Sends the header and the body; returns the body size.
    async fn send_index(&mut self, built: BuiltIndex) -> ProtocolResult<u64> {
        let header = IndexHeader::for_body(built.format, built.num_vectors, &built.bytes);
        self.send(ServerFrame::IndexHeader(header)).await?;

        let body = Bytes::from(built.bytes);
        let chunk_size = self.context.body_chunk_size.max(1);
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            self.send(ServerFrame::IndexBody(body.slice(offset..end)))
                .await?;
            offset = end;
        }
        debug!(session_id = %self.session_id, body_size = body.len(), "index transferred");
        Ok(body.len() as u64)
    }

    async fn receive(&mut self) -> ProtocolResult<ClientFrame> {
        match timeout(self.context.socket_timeout, self.framed.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => Err(ProtocolError::read_failed(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            ))),
            Err(_) => Err(ProtocolError::Timeout {
                operation: "receive",
            }),
        }
    }

    async fn send(&mut self, frame: ServerFrame) -> ProtocolResult<()> {
        timeout(self.context.socket_timeout, self.framed.send(frame))
            .await
            .map_err(|_| ProtocolError::Timeout { operation: "send" })?
    }

    /// Tells the peer why the session ends, unless it already knows or the
    /// connection is gone.
    async fn report(&mut self, err: &ProtocolError) {
        if self.reported || matches!(err, ProtocolError::SocketReadFailed { .. }) {
            return;
        }
        self.reported = true;
        let message = match err {
            ProtocolError::Build { detail } => detail.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self.send(ServerFrame::Error(message)).await {
            warn!(session_id = %self.session_id, error = %e, "failed to send error frame");
        }
    }
}

fn unexpected(frame: &ClientFrame) -> ProtocolError {
    let tag = match frame {
        ClientFrame::Preamble(_) => return ProtocolError::InvalidFrame,
        ClientFrame::Metadata(_) => INIT_MSG,
        ClientFrame::CodebookRow(_) => CODEBOOK_MSG,
        ClientFrame::Vector(_) => VECTOR_MSG,
        ClientFrame::End => END_MSG,
    };
    ProtocolError::UnexpectedMessage { tag }
}
