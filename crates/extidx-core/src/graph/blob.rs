//! Serialized graph index layout.
//!
//! ```text
//! +--------+---------+--------+------------+----+-----+---+-----+----+-----------+------------+
//! | "EXGR" | version | metric | quant_bits | pq | dim | m | efc | ef | centroids | subvectors |
//! +--------+---------+--------+------------+----+-----+---+-----+----+-----------+------------+
//! | num_vectors u64 | entry_point u64 (u64::MAX if empty)                                      |
//! +-----------------+-------------------------------------------------------------------------+
//! | codebook: centroids x dim f32 (pq only)                                                    |
//! | ids: num_vectors x u64                                                                     |
//! | vectors: num_vectors x stride bytes                                                        |
//! | adjacency: per node, degree u32 then degree x u32 node indices                             |
//! +--------------------------------------------------------------------------------------------+
//! ```
//!
//! All integers are little-endian. `stride` follows from the parameters,
//! see [`storage_stride`].

use std::collections::HashSet;

use super::validate::ValidationError;
use super::{GraphIndex, Points, quantize};
use crate::protocol::{Codebook, IndexMetadata, MetricKind, Quantization};

/// Format identifier of graph index blobs.
pub const GRAPH_FORMAT: [u8; 4] = *b"EXGR";

/// Current blob layout version.
pub const GRAPH_FORMAT_VERSION: u32 = 1;

const NO_ENTRY_POINT: u64 = u64::MAX;

/// Bytes stored per vector.
#[must_use]
pub const fn storage_stride(metadata: &IndexMetadata) -> usize {
    if metadata.pq {
        metadata.num_subvectors as usize
    } else if matches!(metadata.metric, MetricKind::Hamming) {
        metadata.dimensions as usize * 4
    } else {
        quantize::stride(metadata.quantization, metadata.dimensions as usize)
    }
}

/// Rebuilds distance-ready points from stored vectors.
pub(crate) fn points_from_storage(
    metadata: &IndexMetadata,
    codebook: Option<&Codebook>,
    storage: &[u8],
) -> Result<Points, ValidationError> {
    let dims = metadata.dimensions as usize;
    let stride = storage_stride(metadata);

    if metadata.metric == MetricKind::Hamming && !metadata.pq {
        let values = storage
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        return Ok(Points::Bits {
            words: dims,
            values,
        });
    }

    let rows = if stride == 0 { 0 } else { storage.len() / stride };
    let mut values = Vec::with_capacity(rows * dims);

    if metadata.pq {
        let codebook = codebook.ok_or_else(|| {
            ValidationError::Parameters("pq index without codebook".to_string())
        })?;
        let sub_dims = dims / metadata.num_subvectors as usize;
        for (node, codes) in storage.chunks_exact(stride).enumerate() {
            for (sub, code) in codes.iter().enumerate() {
                let row = codebook.row(usize::from(*code)).ok_or(
                    ValidationError::PqCodeOutOfRange {
                        node,
                        code: *code,
                        centroids: codebook.num_centroids(),
                    },
                )?;
                values.extend_from_slice(&row[sub * sub_dims..(sub + 1) * sub_dims]);
            }
        }
    } else {
        for stored in storage.chunks_exact(stride) {
            quantize::decode_into(metadata.quantization, stored, dims, &mut values);
        }
    }

    Ok(Points::Dense { dims, values })
}

impl GraphIndex {
    /// Assembles an index from its parts, rebuilding distance-ready points.
    pub(crate) fn from_parts(
        metadata: IndexMetadata,
        ids: Vec<u64>,
        storage: Vec<u8>,
        neighbors: Vec<Vec<u32>>,
        entry_point: Option<u32>,
        codebook: Option<Codebook>,
    ) -> Result<Self, ValidationError> {
        let points = points_from_storage(&metadata, codebook.as_ref(), &storage)?;
        Ok(Self {
            metadata,
            ids,
            storage,
            neighbors,
            entry_point,
            codebook,
            points,
        })
    }

    /// Serializes the index.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let meta = &self.metadata;
        let edges: usize = self.neighbors.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(
            64 + self.ids.len() * 12 + self.storage.len() + edges * 4 + self.codebook_len() * 4,
        );

        out.extend_from_slice(&GRAPH_FORMAT);
        for field in [
            GRAPH_FORMAT_VERSION,
            meta.metric.wire_id(),
            meta.quantization.bits(),
            u32::from(meta.pq),
            meta.dimensions,
            meta.m,
            meta.ef_construction,
            meta.ef,
            meta.num_centroids,
            meta.num_subvectors,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&(self.ids.len() as u64).to_le_bytes());
        let entry = self.entry_point.map_or(NO_ENTRY_POINT, u64::from);
        out.extend_from_slice(&entry.to_le_bytes());

        if let Some(codebook) = &self.codebook {
            for v in codebook.values() {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        for id in &self.ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&self.storage);
        for list in &self.neighbors {
            #[allow(clippy::cast_possible_truncation)] // degree is capped at 2 * m
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for n in list {
                out.extend_from_slice(&n.to_le_bytes());
            }
        }
        out
    }

    fn codebook_len(&self) -> usize {
        self.codebook.as_ref().map_or(0, |c| c.values().len())
    }

    /// Opens a serialized index, checking its structure.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] describing the first inconsistency.
    pub fn open(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut reader = Reader { bytes, pos: 0 };

        let magic = reader.array4()?;
        if magic != GRAPH_FORMAT {
            return Err(ValidationError::BadFormat(magic));
        }
        let version = reader.u32()?;
        if version != GRAPH_FORMAT_VERSION {
            return Err(ValidationError::UnsupportedVersion(version));
        }

        let params = |e: crate::error::ProtocolError| ValidationError::Parameters(e.to_string());
        let metric = MetricKind::from_wire(reader.u32()?).map_err(params)?;
        let quantization = Quantization::from_bits(reader.u32()?).map_err(params)?;
        let pq = reader.u32()? != 0;
        let metadata = IndexMetadata {
            pq,
            metric,
            quantization,
            dimensions: reader.u32()?,
            m: reader.u32()?,
            ef_construction: reader.u32()?,
            ef: reader.u32()?,
            num_centroids: reader.u32()?,
            num_subvectors: reader.u32()?,
            row_count: 0,
        };
        metadata.validate().map_err(params)?;

        let num_vectors = reader.u64()?;
        let entry = reader.u64()?;

        let codebook = if pq {
            let dims = metadata.dimensions as usize;
            let raw = reader.take(metadata.num_centroids as usize * dims * 4)?;
            let values = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Some(Codebook::new(dims, values).map_err(params)?)
        } else {
            None
        };

        let stride = storage_stride(&metadata);
        let n = usize::try_from(num_vectors)
            .ok()
            .filter(|n| n.checked_mul(8 + stride).is_some_and(|len| len <= reader.remaining()))
            .ok_or(ValidationError::Truncated {
                offset: reader.pos,
                needed: usize::MAX,
            })?;

        let mut ids = Vec::with_capacity(n);
        let mut seen = HashSet::with_capacity(n);
        for _ in 0..n {
            let id = reader.u64()?;
            if !seen.insert(id) {
                return Err(ValidationError::DuplicateId(id));
            }
            ids.push(id);
        }
        let storage = reader.take(n * stride)?.to_vec();

        let limit = metadata.m as usize * 2;
        let mut neighbors = Vec::with_capacity(n);
        for node in 0..n {
            let degree = reader.u32()? as usize;
            if degree > limit {
                return Err(ValidationError::DegreeExceeded {
                    node,
                    degree,
                    limit,
                });
            }
            let mut list = Vec::with_capacity(degree);
            for _ in 0..degree {
                let neighbor = reader.u32()?;
                if neighbor as usize >= n {
                    return Err(ValidationError::NeighborOutOfRange { node, neighbor });
                }
                if neighbor as usize == node {
                    return Err(ValidationError::SelfLoop(node));
                }
                if list.contains(&neighbor) {
                    return Err(ValidationError::DuplicateNeighbor { node, neighbor });
                }
                list.push(neighbor);
            }
            neighbors.push(list);
        }

        if reader.remaining() != 0 {
            return Err(ValidationError::TrailingBytes(reader.remaining()));
        }

        let entry_point = match (entry, n) {
            (NO_ENTRY_POINT, 0) => None,
            (e, n) if e < n as u64 => u32::try_from(e).ok(),
            (e, _) => return Err(ValidationError::EntryPointOutOfRange(e)),
        };
        if entry_point.is_none() && n > 0 {
            return Err(ValidationError::EntryPointOutOfRange(entry));
        }

        let mut metadata = metadata;
        metadata.row_count = num_vectors;
        Self::from_parts(metadata, ids, storage, neighbors, entry_point, codebook)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ValidationError> {
        if n > self.remaining() {
            return Err(ValidationError::Truncated {
                offset: self.pos,
                needed: n,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array4(&mut self) -> Result<[u8; 4], ValidationError> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    fn u32(&mut self) -> Result<u32, ValidationError> {
        self.array4().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, ValidationError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildInput, GraphIndexBuilder, IndexBuilder};
    use crate::protocol::VectorRecord;

    fn small_blob() -> Vec<u8> {
        let records = (0..20u64)
            .map(|i| VectorRecord::f32(i * 3, vec![i as f32, (i % 4) as f32]))
            .collect();
        let input = BuildInput::new(IndexMetadata::new(2, MetricKind::L2sq).with_m(4))
            .with_records(records);
        GraphIndexBuilder::new().build(input).unwrap().bytes
    }

    #[test]
    fn test_reopen_preserves_structure() {
        let bytes = small_blob();
        let index = GraphIndex::open(&bytes).unwrap();
        assert_eq!(index.len(), 20);
        assert_eq!(index.ids()[5], 15);
        assert_eq!(index.metadata().row_count, 20);
        assert_eq!(index.to_bytes(), bytes);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = small_blob();
        bytes[0] = b'Z';
        assert!(matches!(
            GraphIndex::open(&bytes),
            Err(ValidationError::BadFormat(_))
        ));
    }

    #[test]
    fn test_truncated_blob() {
        let bytes = small_blob();
        for cut in [3, 30, 70, bytes.len() - 1] {
            assert!(GraphIndex::open(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = small_blob();
        bytes.push(0);
        assert!(matches!(
            GraphIndex::open(&bytes),
            Err(ValidationError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_empty_index() {
        let input = BuildInput::new(IndexMetadata::new(4, MetricKind::Cos));
        let built = GraphIndexBuilder::new().build(input).unwrap();
        let index = GraphIndex::open(&built.bytes).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.entry_point(), None);
    }
}
