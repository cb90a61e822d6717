//! Core types for offloading HNSW index construction to an external server.
//!
//! This crate is shared by the indexing daemon and the database-side client:
//!
//! - [`protocol`]: preamble, frames, metadata and the index header
//! - [`error`]: the [`ProtocolError`] taxonomy with stable messages
//! - [`failure_point`]: fault injection for error-path tests
//! - [`graph`]: the reference graph builder, validation and search
//!
//! Nothing here performs I/O. The daemon drives [`protocol::FrameCodec`]
//! through tokio; the client uses the same encoder over blocking sockets.

pub mod error;
pub mod failure_point;
pub mod graph;
pub mod protocol;

pub use error::{ErrorKind, ProtocolError, ProtocolResult};
pub use failure_point::{FailurePoint, FailurePoints};
