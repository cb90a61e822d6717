//! Exact k-nearest-neighbour graph builder.

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{debug, info};

use super::blob::{GRAPH_FORMAT, points_from_storage, storage_stride};
use super::{BuildError, BuildInput, BuiltIndex, GraphIndex, IndexBuilder, Points, quantize};
use crate::protocol::{Codebook, IndexMetadata, MetricKind, VectorPayload};

/// Builds [`GraphIndex`] blobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphIndexBuilder;

impl GraphIndexBuilder {
    /// Creates a builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds and returns the opened index instead of its bytes.
    ///
    /// # Errors
    ///
    /// Same as [`IndexBuilder::build`].
    pub fn build_index(&self, input: BuildInput) -> Result<GraphIndex, BuildError> {
        let BuildInput {
            mut metadata,
            codebook,
            records,
        } = input;
        metadata
            .validate()
            .map_err(|e| BuildError::InvalidMetadata(e.to_string()))?;
        let codebook = check_codebook(&metadata, codebook)?;

        let n = records.len();
        if u32::try_from(n).is_err() {
            return Err(BuildError::TooManyVectors(n));
        }

        let layout = metadata.payload_layout();
        let stride = storage_stride(&metadata);
        let mut ids = Vec::with_capacity(n);
        let mut seen = HashSet::with_capacity(n);
        let mut storage = Vec::with_capacity(n * stride);

        for record in records {
            if !seen.insert(record.id) {
                return Err(BuildError::DuplicateId(record.id));
            }
            if record.payload.check_layout(layout).is_err() {
                return Err(BuildError::DimensionMismatch {
                    id: record.id,
                    actual: record.payload.len(),
                    expected: layout.elements(),
                });
            }
            match &record.payload {
                VectorPayload::F32(values) => {
                    quantize::encode_into(metadata.quantization, values, &mut storage);
                },
                VectorPayload::Bits(words) => {
                    storage.extend(words.iter().flat_map(|w| w.to_le_bytes()));
                },
                VectorPayload::PqCodes(codes) => {
                    if let Some(code) = codes
                        .iter()
                        .find(|c| u32::from(**c) >= metadata.num_centroids)
                    {
                        return Err(BuildError::CodeOutOfRange {
                            id: record.id,
                            code: *code,
                            centroids: metadata.num_centroids,
                        });
                    }
                    storage.extend_from_slice(codes);
                },
            }
            ids.push(record.id);
        }

        let points = points_from_storage(&metadata, codebook.as_ref(), &storage)?;
        let neighbors = knn_graph(&points, metadata.metric, metadata.m as usize);
        let entry_point = pick_entry_point(&neighbors);

        metadata.row_count = n as u64;
        info!(
            vectors = n,
            dimensions = metadata.dimensions,
            metric = %metadata.metric,
            m = metadata.m,
            "graph index built"
        );

        Ok(GraphIndex::from_parts(
            metadata,
            ids,
            storage,
            neighbors,
            entry_point,
            codebook,
        )?)
    }
}

impl IndexBuilder for GraphIndexBuilder {
    fn build(&self, input: BuildInput) -> Result<BuiltIndex, BuildError> {
        let index = self.build_index(input)?;
        Ok(BuiltIndex {
            format: GRAPH_FORMAT,
            num_vectors: index.len() as u64,
            bytes: index.to_bytes(),
        })
    }
}

fn check_codebook(
    metadata: &IndexMetadata,
    codebook: Option<Codebook>,
) -> Result<Option<Codebook>, BuildError> {
    match (metadata.pq, codebook) {
        (false, None) => Ok(None),
        (false, Some(_)) => Err(BuildError::Codebook(
            "codebook sent for a session without pq".to_string(),
        )),
        (true, None) => Err(BuildError::Codebook("pq session without codebook".to_string())),
        (true, Some(codebook)) => {
            if codebook.dimensions() != metadata.dimensions as usize
                || codebook.num_centroids() != metadata.num_centroids as usize
            {
                return Err(BuildError::Codebook(format!(
                    "expected {} rows of {} values, got {} rows of {}",
                    metadata.num_centroids,
                    metadata.dimensions,
                    codebook.num_centroids(),
                    codebook.dimensions()
                )));
            }
            Ok(Some(codebook))
        },
    }
}

/// Links each node to its `m` nearest nodes, mirrors every edge and keeps
/// the `2 * m` nearest links per node.
#[allow(clippy::cast_possible_truncation)] // node count checked against u32
fn knn_graph(points: &Points, metric: MetricKind, m: usize) -> Vec<Vec<u32>> {
    let n = points.len();
    let forward: Vec<Vec<(f32, u32)>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut candidates: Vec<(f32, u32)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (points.distance(metric, i, j), j as u32))
                .collect();
            if candidates.len() > m {
                candidates.select_nth_unstable_by(m, |a, b| by_distance(*a, *b));
                candidates.truncate(m);
            }
            candidates
        })
        .collect();

    let mut links = forward.clone();
    for (i, list) in forward.iter().enumerate() {
        for &(d, j) in list {
            links[j as usize].push((d, i as u32));
        }
    }

    let limit = m * 2;
    links
        .into_par_iter()
        .map(|mut list| {
            list.sort_by(|a, b| by_distance(*a, *b));
            list.dedup_by_key(|e| e.1);
            list.truncate(limit);
            list.into_iter().map(|(_, j)| j).collect::<Vec<u32>>()
        })
        .collect()
}

fn by_distance(a: (f32, u32), b: (f32, u32)) -> std::cmp::Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// Best-connected node, lowest index on ties.
#[allow(clippy::cast_possible_truncation)]
fn pick_entry_point(neighbors: &[Vec<u32>]) -> Option<u32> {
    let entry = neighbors
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| a.len().cmp(&b.len()).then(j.cmp(i)))
        .map(|(i, _)| i as u32);
    debug!(entry_point = ?entry, "entry point selected");
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Quantization, VectorRecord};

    fn line(n: u64) -> Vec<VectorRecord> {
        (0..n).map(|i| VectorRecord::f32(i, vec![i as f32, 0.0])).collect()
    }

    #[test]
    fn test_neighbors_are_nearest() {
        let input = BuildInput::new(IndexMetadata::new(2, MetricKind::L2sq).with_m(2))
            .with_records(line(10));
        let index = GraphIndexBuilder::new().build_index(input).unwrap();

        // Node 5 sits between 4 and 6
        let mut links = index.neighbors(5).unwrap().to_vec();
        links.sort_unstable();
        assert!(links.contains(&4));
        assert!(links.contains(&6));
        for node in 0..10 {
            let list = index.neighbors(node).unwrap();
            assert!(list.len() >= 2 && list.len() <= 4);
            assert!(!list.contains(&(node as u32)));
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut records = line(3);
        records.push(VectorRecord::f32(1, vec![9.0, 9.0]));
        let input =
            BuildInput::new(IndexMetadata::new(2, MetricKind::L2sq)).with_records(records);

        let err = GraphIndexBuilder::new().build(input).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateId(1)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let input = BuildInput::new(IndexMetadata::new(3, MetricKind::L2sq))
            .with_records(vec![VectorRecord::f32(1, vec![1.0, 2.0])]);
        let err = GraphIndexBuilder::new().build(input).unwrap_err();
        assert_eq!(err.to_string(), "vector 1 has 2 elements, expected 3");
    }

    #[test]
    fn test_pq_requires_matching_codebook() {
        let meta = IndexMetadata::new(4, MetricKind::L2sq).with_pq(2, 2);
        let input = BuildInput::new(meta).with_records(vec![VectorRecord::pq_codes(1, vec![0, 1])]);
        assert!(matches!(
            GraphIndexBuilder::new().build(input.clone()),
            Err(BuildError::Codebook(_))
        ));

        let wrong = Codebook::new(4, vec![0.0; 12]).unwrap();
        assert!(matches!(
            GraphIndexBuilder::new().build(input.clone().with_codebook(wrong)),
            Err(BuildError::Codebook(_))
        ));

        let codebook = Codebook::new(4, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        let index = GraphIndexBuilder::new()
            .build_index(input.with_codebook(codebook))
            .unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.codebook().is_some());
    }

    #[test]
    fn test_pq_code_out_of_range() {
        let meta = IndexMetadata::new(4, MetricKind::L2sq).with_pq(2, 2);
        let input = BuildInput::new(meta)
            .with_codebook(Codebook::new(4, vec![0.0; 8]).unwrap())
            .with_records(vec![VectorRecord::pq_codes(7, vec![0, 2])]);
        let err = GraphIndexBuilder::new().build(input).unwrap_err();
        assert!(matches!(err, BuildError::CodeOutOfRange { id: 7, code: 2, .. }));
    }

    #[test]
    fn test_every_quantization_keeps_all_rows() {
        for quantization in [
            Quantization::F32,
            Quantization::F16,
            Quantization::I8,
            Quantization::B1,
        ] {
            let meta = IndexMetadata::new(2, MetricKind::Cos).with_quantization(quantization);
            let built = GraphIndexBuilder::new()
                .build(BuildInput::new(meta).with_records(line(25)))
                .unwrap();
            assert_eq!(built.num_vectors, 25);
            assert_eq!(built.format, GRAPH_FORMAT);
        }
    }

    #[test]
    fn test_hamming_build() {
        let records = (0..16u64)
            .map(|i| VectorRecord::bits(i, vec![u32::try_from(i).unwrap(), 0]))
            .collect();
        let meta = IndexMetadata::new(2, MetricKind::Hamming).with_m(3);
        let index = GraphIndexBuilder::new()
            .build_index(BuildInput::new(meta).with_records(records))
            .unwrap();
        assert_eq!(index.len(), 16);
        assert!(index.entry_point().is_some());
    }

    #[test]
    fn test_build_is_deterministic() {
        let build = || {
            GraphIndexBuilder::new()
                .build(
                    BuildInput::new(IndexMetadata::new(2, MetricKind::L2sq).with_m(3))
                        .with_records(line(30)),
                )
                .unwrap()
        };
        assert_eq!(build(), build());
    }
}
