//! Approximate and exact nearest-neighbour search over a [`GraphIndex`].
//!
//! Approximate search is a best-first beam search started from the entry
//! point plus a few evenly spaced seed nodes, which keeps disconnected
//! clusters reachable. [`GraphIndex::exact_search`] scans every node and is
//! the ground truth used for recall measurements.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;

use super::{GraphIndex, Points, distance};
use crate::protocol::{MetricKind, VectorPayload};

/// Extra seed nodes besides the entry point.
const EXTRA_SEEDS: usize = 8;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Vector identifier.
    pub id: u64,
    /// Distance to the query.
    pub distance: f32,
}

/// Errors raised by a query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    /// The query has the wrong number of elements.
    #[error("query has {actual} elements, expected {expected}")]
    DimensionMismatch {
        /// Elements in the query.
        actual: usize,
        /// Elements the index expects.
        expected: usize,
    },

    /// The query kind does not fit the index.
    #[error("{kind} query is not supported by a {metric} index")]
    UnsupportedQuery {
        /// Query kind.
        kind: &'static str,
        /// Index metric.
        metric: MetricKind,
    },

    /// A PQ query code refers to a missing centroid.
    #[error("query code {0} out of range")]
    CodeOutOfRange(u8),
}

enum Query {
    Dense(Vec<f32>),
    Bits(Vec<u32>),
}

/// Farthest-first entry.
struct Far(f32, u32);
/// Closest-first entry.
struct Near(f32, u32);

impl PartialEq for Far {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Far {}
impl PartialOrd for Far {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Far {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

impl PartialEq for Near {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Near {}
impl PartialOrd for Near {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Near {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the closest first
        other.0.total_cmp(&self.0).then(other.1.cmp(&self.1))
    }
}

impl GraphIndex {
    /// Returns up to `k` approximate nearest neighbours, closest first.
    ///
    /// `ef` defaults to the index `ef` and is raised to at least `k`.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError`] if the query does not fit the index.
    pub fn search(
        &self,
        query: &VectorPayload,
        k: usize,
        ef: Option<usize>,
    ) -> Result<Vec<Neighbor>, SearchError> {
        let query = self.resolve_query(query)?;
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let ef = ef.unwrap_or(self.metadata.ef as usize).max(k);

        let n = self.len();
        let mut visited = vec![false; n];
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<Far> = BinaryHeap::new();

        let step = (n / (EXTRA_SEEDS + 1)).max(1);
        let seeds = std::iter::once(entry as usize).chain((step..n).step_by(step).take(EXTRA_SEEDS));
        for seed in seeds {
            if visited[seed] {
                continue;
            }
            visited[seed] = true;
            let d = self.distance_to(&query, seed);
            #[allow(clippy::cast_possible_truncation)] // node count fits u32
            let seed = seed as u32;
            candidates.push(Near(d, seed));
            results.push(Far(d, seed));
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(Near(d, node)) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |f| f.0);
            if d > worst && results.len() >= ef {
                break;
            }
            for &next in &self.neighbors[node as usize] {
                let idx = next as usize;
                if visited[idx] {
                    continue;
                }
                visited[idx] = true;
                let d = self.distance_to(&query, idx);
                let worst = results.peek().map_or(f32::INFINITY, |f| f.0);
                if results.len() < ef || d < worst {
                    candidates.push(Near(d, next));
                    results.push(Far(d, next));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut hits: Vec<Neighbor> = results
            .into_sorted_vec()
            .into_iter()
            .map(|Far(distance, node)| Neighbor {
                id: self.ids[node as usize],
                distance,
            })
            .collect();
        hits.truncate(k);
        Ok(hits)
    }

    /// Returns the exact `k` nearest neighbours, closest first.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError`] if the query does not fit the index.
    pub fn exact_search(
        &self,
        query: &VectorPayload,
        k: usize,
    ) -> Result<Vec<Neighbor>, SearchError> {
        let query = self.resolve_query(query)?;
        let mut all: Vec<Neighbor> = (0..self.len())
            .map(|i| Neighbor {
                id: self.ids[i],
                distance: self.distance_to(&query, i),
            })
            .collect();
        all.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        all.truncate(k);
        Ok(all)
    }

    fn distance_to(&self, query: &Query, node: usize) -> f32 {
        match (query, self.points()) {
            (Query::Dense(q), Points::Dense { .. }) => {
                distance::dense(self.metadata.metric, q, self.points().dense(node))
            },
            (Query::Bits(q), Points::Bits { .. }) => distance::hamming(q, self.points().bits(node)),
            // resolve_query only produces the kind matching the points
            _ => f32::INFINITY,
        }
    }

    fn resolve_query(&self, query: &VectorPayload) -> Result<Query, SearchError> {
        let meta = &self.metadata;
        let dims = meta.dimensions as usize;
        let check = |actual: usize, expected: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(SearchError::DimensionMismatch { actual, expected })
            }
        };

        match (query, self.points()) {
            (VectorPayload::F32(values), Points::Dense { .. }) => {
                check(values.len(), dims)?;
                Ok(Query::Dense(values.clone()))
            },
            (VectorPayload::Bits(words), Points::Bits { .. }) => {
                check(words.len(), dims)?;
                Ok(Query::Bits(words.clone()))
            },
            (VectorPayload::PqCodes(codes), Points::Dense { .. }) if meta.pq => {
                check(codes.len(), meta.num_subvectors as usize)?;
                let Some(codebook) = self.codebook() else {
                    return Err(SearchError::UnsupportedQuery {
                        kind: "pq",
                        metric: meta.metric,
                    });
                };
                let sub_dims = dims / codes.len();
                let mut values = Vec::with_capacity(dims);
                for (sub, code) in codes.iter().enumerate() {
                    let row = codebook
                        .row(usize::from(*code))
                        .ok_or(SearchError::CodeOutOfRange(*code))?;
                    values.extend_from_slice(&row[sub * sub_dims..(sub + 1) * sub_dims]);
                }
                Ok(Query::Dense(values))
            },
            (payload, _) => Err(SearchError::UnsupportedQuery {
                kind: match payload {
                    VectorPayload::F32(_) => "f32",
                    VectorPayload::Bits(_) => "bit",
                    VectorPayload::PqCodes(_) => "pq",
                },
                metric: meta.metric,
            }),
        }
    }
}
