//! Indexing server for the external index build protocol.
//!
//! The daemon accepts build sessions from database backends over TCP or TLS,
//! builds each index on a blocking worker and streams the serialized result
//! back over the same connection.
//!
//! ```text
//! ┌──────────────┐  preamble, metadata, vectors, END   ┌───────────────┐
//! │   database   │ ──────────────────────────────────► │  IndexServer  │
//! │   backend    │ ◄────────────────────────────────── │  (one task    │
//! └──────────────┘  preamble, index header, body       │  per session) │
//!                                                      └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`server`]: listener, connection limiting and configuration
//! - [`session`]: the per-connection state machine
//! - [`tls`]: certificate and key loading
//! - [`status`]: the `/status` HTTP endpoint

pub mod server;
pub mod session;
pub mod status;
pub mod tls;

pub use server::{ConnectionPermit, IndexServer, ServerConfig, ServerError};
pub use session::{ServerSession, SessionContext, SessionSummary};
pub use status::{ServerStatus, StatusReport, StatusTracker};
pub use tls::TlsFiles;
