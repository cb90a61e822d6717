//! External index build wire protocol.
//!
//! A database process (client) streams vectors to an indexing server, which
//! builds the graph index and streams the serialized index back. One TCP
//! (optionally TLS) connection carries exactly one build.
//!
//! # Layers
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Index header + index body         │  result transfer
//! ├─────────────────────────────────────────┤
//! │   Metadata, codebook, vectors, end       │  tagged frames
//! ├─────────────────────────────────────────┤
//! │               Preamble                   │  magic, version, byte order
//! ├─────────────────────────────────────────┤
//! │            TCP / TLS stream              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Wire Format
//!
//! Every integer is little-endian except the endianness marker, which each
//! peer writes in its native byte order so the other side can detect it.
//!
//! ```text
//! Preamble (16 bytes, both directions)
//! +-------------+-------------+----------------+-------------+
//! | magic "EXIX"| version u32 | marker u32 (ne)| role u32    |
//! +-------------+-------------+----------------+-------------+
//!
//! Metadata (48 bytes)
//! +----------+----+--------+------------+-----+---+-----+----+-----------+---------------+-----------+
//! | INIT_MSG | pq | metric | quant_bits | dim | m | efc | ef | centroids | subvectors    | rows u64  |
//! +----------+----+--------+------------+-----+---+-----+----+-----------+---------------+-----------+
//!
//! Codebook row (PQ only, num_centroids times)
//! +--------------+-----------------+
//! | CODEBOOK_MSG | dim x f32       |
//! +--------------+-----------------+
//!
//! Vector record
//! +------------+--------+------------------------------------------+
//! | VECTOR_MSG | id u64 | dim x f32 | dim x u32 | subvectors x u8  |
//! +------------+--------+------------------------------------------+
//!
//! End of stream:  END_MSG
//! Error:          ERR_MSG | len u32 | utf-8 message
//! ```
//!
//! The server answers the end marker with an [`IndexHeader`] followed by
//! exactly `body_size` bytes of index body.
//!
//! # Module Overview
//!
//! - [`handshake`]: preamble encoding and both handshake state machines
//! - [`metadata`]: build parameters, payload layouts and vector records
//! - [`framing`]: frame codec used by the server and the client encoder
//! - [`header`]: index header with checksums

pub mod framing;
pub mod handshake;
pub mod header;
pub mod metadata;

pub use framing::{
    ClientFrame, FrameCodec, ServerFrame, decode_error_message, encode_error_frame,
    error_message_len,
};
pub use handshake::{
    ClientHandshake, Endianness, HandshakeReply, HandshakeState, PeerRole, Preamble,
    ServerHandshake,
};
pub use header::IndexHeader;
pub use metadata::{
    Codebook, DEFAULT_EF, DEFAULT_EF_CONSTRUCTION, DEFAULT_M, IndexMetadata, MetricKind,
    PayloadLayout, Quantization, VectorPayload, VectorRecord,
};

/// Magic bytes opening every preamble.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"EXIX";

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Marker written in native byte order; reads as this value on little-endian
/// peers.
pub const ENDIANNESS_MARKER: u32 = 0x0102_0304;

/// Preamble length in bytes.
pub const PREAMBLE_LEN: usize = 16;

/// Length of a message tag.
pub const TAG_LEN: usize = 4;

/// Length of a vector identifier.
pub const LABEL_LEN: usize = 8;

/// Metadata frame tag.
pub const INIT_MSG: u32 = 0x1333_3337;
/// Vector record tag.
pub const VECTOR_MSG: u32 = 0x3313_3337;
/// Codebook row tag.
pub const CODEBOOK_MSG: u32 = 0x3331_3337;
/// End-of-stream tag.
pub const END_MSG: u32 = 0x3133_3337;
/// Error frame tag.
pub const ERR_MSG: u32 = 0x3733_3337;
/// Index header tag.
pub const INDEX_MSG: u32 = 0x3333_1337;

/// Full metadata frame length, tag included.
pub const METADATA_FRAME_LEN: usize = TAG_LEN + metadata::METADATA_FIELDS_LEN;

/// Index header length in bytes.
pub const INDEX_HEADER_LEN: usize = 32;

/// Longest error message carried by an error frame.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Largest accepted vector dimension.
pub const MAX_DIMENSIONS: usize = 2048;

/// Largest accepted number of product-quantization centroids (codes are one
/// byte).
pub const MAX_PQ_CENTROIDS: usize = 256;

/// Largest accepted index body (16 GiB).
pub const MAX_INDEX_BODY_SIZE: u64 = 16 * 1024 * 1024 * 1024;
