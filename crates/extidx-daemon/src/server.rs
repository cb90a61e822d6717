//! TCP listener for build sessions.
//!
//! # Connection Lifecycle
//!
//! 1. The listener accepts a connection once a connection permit is free
//! 2. The connection is wrapped in TLS when the server is configured for it
//! 3. A spawned task runs one [`ServerSession`] over the stream
//! 4. The permit is released when the task ends, success or failure
//!
//! Sessions share nothing but the builder, the fault-injection registry and
//! the status counters. Every build gets its own input and output buffers.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use extidx_core::graph::{GraphIndexBuilder, IndexBuilder};
use extidx_core::{FailurePoints, ProtocolError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ServerSession, SessionContext};
use crate::status::StatusTracker;
use crate::tls::TlsFiles;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8998;

/// Default limit on concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default bound on each frame receive and send.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size of index body writes.
pub const DEFAULT_BODY_CHUNK_SIZE: usize = 1024 * 1024;

/// Errors that stop the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded.
    #[error("tls setup failed for {}: {detail}", path.display())]
    Tls {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        detail: String,
    },

    /// Accepting a connection failed.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The connection limiter was closed.
    #[error("connection limiter closed")]
    LimiterClosed,
}

/// Configuration for the indexing server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Bound on each frame receive and send.
    pub socket_timeout: Duration,

    /// Certificate and key; plaintext TCP when `None`.
    pub tls: Option<TlsFiles>,

    /// Builder invoked by every session.
    pub builder: Arc<dyn IndexBuilder>,

    /// Fault-injection registry.
    pub failure_points: Arc<FailurePoints>,

    /// Size of index body writes.
    pub body_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            tls: None,
            builder: Arc::new(GraphIndexBuilder::new()),
            failure_points: Arc::new(FailurePoints::new()),
            body_chunk_size: DEFAULT_BODY_CHUNK_SIZE,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("max_connections", &self.max_connections)
            .field("socket_timeout", &self.socket_timeout)
            .field("tls", &self.tls)
            .field("body_chunk_size", &self.body_chunk_size)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Create a config listening on `listen_addr`.
    #[must_use]
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set the maximum concurrent sessions.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-frame socket timeout.
    #[must_use]
    pub const fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Enable TLS with the given files.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsFiles) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Replace the index builder.
    #[must_use]
    pub fn with_builder(mut self, builder: Arc<dyn IndexBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Share a fault-injection registry with the server.
    #[must_use]
    pub fn with_failure_points(mut self, points: Arc<FailurePoints>) -> Self {
        self.failure_points = points;
        self
    }

    /// Set the size of index body writes.
    #[must_use]
    pub const fn with_body_chunk_size(mut self, size: usize) -> Self {
        self.body_chunk_size = size;
        self
    }
}

/// Permit for an active connection.
///
/// Holds a semaphore permit that is released when dropped, allowing another
/// connection to be accepted.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Indexing server bound to a TCP port.
///
/// # Invariants
///
/// - Concurrent sessions are limited by a semaphore.
/// - A session's failure never affects another session.
pub struct IndexServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    connection_sem: Arc<Semaphore>,
    context: Arc<SessionContext>,
    status: Arc<StatusTracker>,
}

impl IndexServer {
    /// Loads TLS material and binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS files are unusable or the address cannot
    /// be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let acceptor = config.tls.as_ref().map(TlsFiles::acceptor).transpose()?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr,
                source,
            })?;

        info!(
            addr = %listener.local_addr().unwrap_or(config.listen_addr),
            max_connections = config.max_connections,
            tls = acceptor.is_some(),
            "indexing server bound"
        );

        Ok(Self {
            listener,
            acceptor,
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            context: Arc::new(SessionContext {
                builder: config.builder,
                failure_points: config.failure_points,
                socket_timeout: config.socket_timeout,
                body_chunk_size: config.body_chunk_size,
            }),
            status: Arc::new(StatusTracker::new()),
        })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the status counters, for the status endpoint.
    #[must_use]
    pub fn status(&self) -> Arc<StatusTracker> {
        Arc::clone(&self.status)
    }

    /// Accept the next incoming connection.
    ///
    /// Waits for a free connection permit first; the permit must be held for
    /// as long as the connection is served.
    ///
    /// # Errors
    ///
    /// Returns an error if the limiter is closed or `accept` fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ServerError> {
        let permit = Arc::clone(&self.connection_sem)
            .acquire_owned()
            .await
            .map_err(|_| ServerError::LimiterClosed)?;

        let (stream, peer) = self.listener.accept().await.map_err(ServerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        debug!(peer = %peer, "accepted connection");

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Serves connections until an unrecoverable error.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limiter is closed.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer, permit) = match self.accept().await {
                Ok(accepted) => accepted,
                Err(ServerError::Accept(e)) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                },
                Err(e) => return Err(e),
            };

            let acceptor = self.acceptor.clone();
            let context = Arc::clone(&self.context);
            let status = Arc::clone(&self.status);
            tokio::spawn(async move {
                serve_connection(stream, peer, acceptor, context, status, permit).await;
            });
        }
    }

    /// Serves connections until `shutdown` completes.
    ///
    /// Sessions already running are not waited for.
    ///
    /// # Errors
    ///
    /// Returns an error if [`IndexServer::run`] fails first.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => result,
            () = shutdown => {
                info!("indexing server shutting down");
                Ok(())
            },
        }
    }
}

impl std::fmt::Debug for IndexServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("tls", &self.acceptor.is_some())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    context: Arc<SessionContext>,
    status: Arc<StatusTracker>,
    _permit: ConnectionPermit,
) {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, peer = %peer, "session started");
    status.session_started();

    let outcome = match acceptor {
        Some(acceptor) => match timeout(context.socket_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => {
                ServerSession::new(tls, peer, session_id, Arc::clone(&context))
                    .run()
                    .await
            },
            Ok(Err(e)) => Err(ProtocolError::TlsHandshake {
                detail: e.to_string(),
            }),
            Err(_) => Err(ProtocolError::Timeout {
                operation: "tls handshake",
            }),
        },
        None => {
            ServerSession::new(stream, peer, session_id, Arc::clone(&context))
                .run()
                .await
        },
    };

    match outcome {
        Ok(summary) => {
            status.session_succeeded();
            info!(
                session_id = %session_id,
                peer = %peer,
                num_vectors = summary.num_vectors,
                body_size = summary.body_size,
                elapsed_ms = summary.elapsed.as_millis(),
                "session completed"
            );
        },
        Err(e) => {
            status.session_failed();
            warn!(
                session_id = %session_id,
                peer = %peer,
                kind = %e.kind(),
                error = %e,
                "session failed"
            );
        },
    }
}
