//! Reference graph index builder.
//!
//! The indexing server hands every received vector to an [`IndexBuilder`]
//! and streams the serialized result back to the database. The protocol does
//! not care how the index is built; [`GraphIndexBuilder`] is the builder the
//! daemon ships with.
//!
//! # Index Shape
//!
//! [`GraphIndexBuilder`] produces a single-layer proximity graph:
//!
//! - every node links to its `m` exact nearest neighbours
//! - every edge is mirrored, and each node keeps at most `2 * m` links,
//!   nearest first
//! - the best-connected node is the entry point for search
//!
//! Neighbour selection runs in parallel with rayon. Construction is
//! quadratic in the number of vectors, which keeps the graph exact and the
//! result deterministic for a given input.
//!
//! # Storage
//!
//! Stored vectors follow the session metadata:
//!
//! | Session             | Stored as                             |
//! |---------------------|---------------------------------------|
//! | `pq`                | one code byte per subvector           |
//! | `hamming`           | raw 32-bit words                      |
//! | otherwise           | scalar-quantized, see [`quantize`]    |
//!
//! PQ indexes embed their codebook so the blob is self-contained. See
//! [`blob`] for the byte layout and [`validate_index`] for the checks a
//! consumer can run before trusting a blob.

pub mod blob;
pub mod builder;
pub mod distance;
pub mod quantize;
pub mod search;
pub mod validate;

use thiserror::Error;

pub use blob::{GRAPH_FORMAT, GRAPH_FORMAT_VERSION};
pub use builder::GraphIndexBuilder;
pub use search::{Neighbor, SearchError};
pub use validate::{ValidationError, ValidationReport, validate_index};

use crate::protocol::{Codebook, IndexMetadata, MetricKind, VectorRecord};

/// Errors raised while building an index.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// Build parameters are invalid.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Two records share an identifier.
    #[error("duplicate vector id {0}")]
    DuplicateId(u64),

    /// A record payload does not match the metadata.
    #[error("vector {id} has {actual} elements, expected {expected}")]
    DimensionMismatch {
        /// Record identifier.
        id: u64,
        /// Elements received.
        actual: usize,
        /// Elements required.
        expected: usize,
    },

    /// A product-quantized build without a usable codebook.
    #[error("codebook mismatch: {0}")]
    Codebook(String),

    /// A PQ code refers to a centroid that does not exist.
    #[error("vector {id} uses code {code}, but the codebook has {centroids} centroids")]
    CodeOutOfRange {
        /// Record identifier.
        id: u64,
        /// Offending code.
        code: u8,
        /// Number of centroids.
        centroids: u32,
    },

    /// More vectors than node indices can address.
    #[error("too many vectors: {0}")]
    TooManyVectors(usize),

    /// The produced index failed its own validation.
    #[error("built index is inconsistent: {0}")]
    Inconsistent(#[from] ValidationError),
}

/// Everything a builder receives from one session.
#[derive(Debug, Clone)]
pub struct BuildInput {
    /// Build parameters.
    pub metadata: IndexMetadata,
    /// Codebook, present iff `metadata.pq`.
    pub codebook: Option<Codebook>,
    /// Streamed records, in arrival order.
    pub records: Vec<VectorRecord>,
}

impl BuildInput {
    /// Creates an input without records.
    #[must_use]
    pub fn new(metadata: IndexMetadata) -> Self {
        let capacity = usize::try_from(metadata.row_count).unwrap_or(0).min(1 << 20);
        Self {
            metadata,
            codebook: None,
            records: Vec::with_capacity(capacity),
        }
    }

    /// Attaches a codebook.
    #[must_use]
    pub fn with_codebook(mut self, codebook: Codebook) -> Self {
        self.codebook = Some(codebook);
        self
    }

    /// Replaces the records.
    #[must_use]
    pub fn with_records(mut self, records: Vec<VectorRecord>) -> Self {
        self.records = records;
        self
    }
}

/// A serialized index ready for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltIndex {
    /// Format identifier placed in the index header.
    pub format: [u8; 4],
    /// Number of indexed vectors.
    pub num_vectors: u64,
    /// Serialized index.
    pub bytes: Vec<u8>,
}

/// Builds a serialized index from streamed vectors.
///
/// Implementations run on a blocking thread; they may take as long as they
/// need and must not assume a runtime.
pub trait IndexBuilder: Send + Sync {
    /// Builds the index.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the input is inconsistent or the build fails.
    fn build(&self, input: BuildInput) -> Result<BuiltIndex, BuildError>;
}

/// In-memory vectors used for distance computations.
#[derive(Debug, Clone)]
pub(crate) enum Points {
    /// Dequantized float vectors, row-major.
    Dense { dims: usize, values: Vec<f32> },
    /// Bit vectors, row-major.
    Bits { words: usize, values: Vec<u32> },
}

impl Points {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Dense { dims, values } => values.len() / dims,
            Self::Bits { words, values } => values.len() / words,
        }
    }

    pub(crate) fn dense(&self, i: usize) -> &[f32] {
        match self {
            Self::Dense { dims, values } => &values[i * dims..(i + 1) * dims],
            Self::Bits { .. } => &[],
        }
    }

    pub(crate) fn bits(&self, i: usize) -> &[u32] {
        match self {
            Self::Bits { words, values } => &values[i * words..(i + 1) * words],
            Self::Dense { .. } => &[],
        }
    }

    /// Distance between stored points `i` and `j`.
    pub(crate) fn distance(&self, metric: MetricKind, i: usize, j: usize) -> f32 {
        match self {
            Self::Dense { .. } => distance::dense(metric, self.dense(i), self.dense(j)),
            Self::Bits { .. } => distance::hamming(self.bits(i), self.bits(j)),
        }
    }
}

/// A graph index opened from its serialized form.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    metadata: IndexMetadata,
    ids: Vec<u64>,
    storage: Vec<u8>,
    neighbors: Vec<Vec<u32>>,
    entry_point: Option<u32>,
    codebook: Option<Codebook>,
    points: Points,
}

impl GraphIndex {
    /// Build parameters; `row_count` equals the number of vectors.
    #[must_use]
    pub const fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Number of vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if the index holds no vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vector identifiers in node order.
    #[must_use]
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Neighbour node indices of node `node`.
    #[must_use]
    pub fn neighbors(&self, node: usize) -> Option<&[u32]> {
        self.neighbors.get(node).map(Vec::as_slice)
    }

    /// Identifier of the entry point.
    #[must_use]
    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point.map(|n| self.ids[n as usize])
    }

    /// Embedded codebook of a PQ index.
    #[must_use]
    pub const fn codebook(&self) -> Option<&Codebook> {
        self.codebook.as_ref()
    }

    pub(crate) const fn points(&self) -> &Points {
        &self.points
    }
}
