//! Structural validation of serialized indexes.

use std::collections::VecDeque;

use thiserror::Error;

use super::GraphIndex;
use crate::protocol::{MetricKind, Quantization};

/// Reasons a serialized index is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// The blob ends before a field.
    #[error("index truncated at offset {offset} (needed {needed} more bytes)")]
    Truncated {
        /// Offset of the missing field.
        offset: usize,
        /// Bytes required.
        needed: usize,
    },

    /// Unknown format identifier.
    #[error("unknown index format {0:?}")]
    BadFormat([u8; 4]),

    /// Format version this build cannot read.
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u32),

    /// Stored parameters are invalid.
    #[error("invalid index parameters: {0}")]
    Parameters(String),

    /// Two nodes share an identifier.
    #[error("duplicate vector id {0}")]
    DuplicateId(u64),

    /// A node has more links than allowed.
    #[error("node {node} has {degree} neighbors, limit is {limit}")]
    DegreeExceeded {
        /// Node index.
        node: usize,
        /// Stored degree.
        degree: usize,
        /// `2 * m`.
        limit: usize,
    },

    /// A link points past the last node.
    #[error("node {node} links to missing node {neighbor}")]
    NeighborOutOfRange {
        /// Node index.
        node: usize,
        /// Stored link.
        neighbor: u32,
    },

    /// A node lists the same link twice.
    #[error("node {node} links to node {neighbor} more than once")]
    DuplicateNeighbor {
        /// Node index.
        node: usize,
        /// Repeated link.
        neighbor: u32,
    },

    /// A node links to itself.
    #[error("node {0} links to itself")]
    SelfLoop(usize),

    /// The entry point does not name a node.
    #[error("entry point {0} out of range")]
    EntryPointOutOfRange(u64),

    /// A PQ code refers to a missing centroid.
    #[error("node {node} uses code {code}, but the codebook has {centroids} centroids")]
    PqCodeOutOfRange {
        /// Node index.
        node: usize,
        /// Offending code.
        code: u8,
        /// Number of centroids.
        centroids: usize,
    },

    /// Bytes left after the adjacency lists.
    #[error("{0} trailing bytes after index")]
    TrailingBytes(usize),
}

/// Summary of a valid index.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Number of vectors.
    pub num_vectors: u64,
    /// Vector dimension.
    pub dimensions: u32,
    /// Distance metric.
    pub metric: MetricKind,
    /// Storage precision.
    pub quantization: Quantization,
    /// Whether vectors are PQ codes.
    pub pq: bool,
    /// Largest node degree.
    pub max_degree: usize,
    /// Mean node degree.
    pub mean_degree: f64,
    /// Nodes reachable from the entry point.
    pub reachable: usize,
}

impl ValidationReport {
    /// Returns `true` if every node is reachable from the entry point.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.reachable as u64 == self.num_vectors
    }
}

/// Opens a serialized index and summarizes it.
///
/// # Errors
///
/// Returns [`ValidationError`] describing the first inconsistency.
pub fn validate_index(bytes: &[u8]) -> Result<ValidationReport, ValidationError> {
    let index = GraphIndex::open(bytes)?;
    Ok(report(&index))
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn report(index: &GraphIndex) -> ValidationReport {
    let n = index.len();
    let degrees = (0..n).map(|i| index.neighbors(i).map_or(0, <[u32]>::len));
    let max_degree = degrees.clone().max().unwrap_or(0);
    let total: usize = degrees.sum();
    let mean_degree = if n == 0 { 0.0 } else { total as f64 / n as f64 };

    let meta = index.metadata();
    ValidationReport {
        num_vectors: n as u64,
        dimensions: meta.dimensions,
        metric: meta.metric,
        quantization: meta.quantization,
        pq: meta.pq,
        max_degree,
        mean_degree,
        reachable: reachable_from_entry(index),
    }
}

fn reachable_from_entry(index: &GraphIndex) -> usize {
    let Some(entry) = index.entry_point else {
        return 0;
    };
    let mut visited = vec![false; index.len()];
    let mut queue = VecDeque::from([entry]);
    visited[entry as usize] = true;
    let mut count = 1;
    while let Some(node) = queue.pop_front() {
        for &next in &index.neighbors[node as usize] {
            if !visited[next as usize] {
                visited[next as usize] = true;
                count += 1;
                queue.push_back(next);
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildInput, GraphIndexBuilder, IndexBuilder};
    use crate::protocol::{IndexMetadata, VectorRecord};

    #[test]
    fn test_report_for_clustered_input() {
        // Two well separated clusters; mirrored edges keep them linked
        let records = (0..40u64)
            .map(|i| {
                let base = if i < 20 { 0.0 } else { 100.0 };
                VectorRecord::f32(i, vec![base + (i % 20) as f32, 1.0])
            })
            .collect();
        let input = BuildInput::new(IndexMetadata::new(2, MetricKind::L2sq).with_m(4))
            .with_records(records);
        let built = GraphIndexBuilder::new().build(input).unwrap();

        let report = validate_index(&built.bytes).unwrap();
        assert_eq!(report.num_vectors, 40);
        assert_eq!(report.dimensions, 2);
        assert!(report.max_degree <= 8);
        assert!(report.mean_degree >= 4.0);
        assert!(report.reachable >= 20);
    }

    #[test]
    fn test_rejects_self_loop() {
        let records = (0..5u64).map(|i| VectorRecord::f32(i, vec![i as f32])).collect();
        let input = BuildInput::new(IndexMetadata::new(1, MetricKind::L2sq).with_m(2))
            .with_records(records);
        let mut index = GraphIndex::open(&GraphIndexBuilder::new().build(input).unwrap().bytes)
            .unwrap();
        index.neighbors[0] = vec![0];

        assert_eq!(
            validate_index(&index.to_bytes()),
            Err(ValidationError::SelfLoop(0))
        );
    }

    #[test]
    fn test_rejects_dangling_link() {
        let records = (0..5u64).map(|i| VectorRecord::f32(i, vec![i as f32])).collect();
        let input = BuildInput::new(IndexMetadata::new(1, MetricKind::L2sq).with_m(2))
            .with_records(records);
        let mut index = GraphIndex::open(&GraphIndexBuilder::new().build(input).unwrap().bytes)
            .unwrap();
        index.neighbors[1] = vec![9];

        assert!(matches!(
            validate_index(&index.to_bytes()),
            Err(ValidationError::NeighborOutOfRange { node: 1, neighbor: 9 })
        ));
    }
}
