//! Index build parameters and vector records.
//!
//! [`IndexMetadata`] is what travels in the metadata frame. It fixes the
//! payload layout of every [`VectorRecord`] in the session: once the server
//! has decoded it, record sizes are known and never change.

use std::fmt;

use bytes::{Buf, BufMut};

use super::{MAX_DIMENSIONS, MAX_PQ_CENTROIDS};
use crate::error::{ProtocolError, ProtocolResult};

/// Default graph fan-out.
pub const DEFAULT_M: u32 = 16;

/// Default candidate list size during construction.
pub const DEFAULT_EF_CONSTRUCTION: u32 = 128;

/// Default candidate list size during search.
pub const DEFAULT_EF: u32 = 64;

/// Distance metric of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Cosine distance, `1 - cos(a, b)`.
    Cos,
    /// Squared euclidean distance.
    L2sq,
    /// Number of differing bits.
    Hamming,
}

impl MetricKind {
    /// Decodes the wire identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] for unknown identifiers.
    pub fn from_wire(id: u32) -> ProtocolResult<Self> {
        match id {
            1 => Ok(Self::Cos),
            3 => Ok(Self::L2sq),
            8 => Ok(Self::Hamming),
            _ => Err(ProtocolError::InvalidMetadata(format!(
                "invalid metric {id}"
            ))),
        }
    }

    /// Returns the wire identifier.
    #[must_use]
    pub const fn wire_id(self) -> u32 {
        match self {
            Self::Cos => 1,
            Self::L2sq => 3,
            Self::Hamming => 8,
        }
    }

    /// Parses a metric name as used in index options.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] for unknown names.
    pub fn parse(name: &str) -> ProtocolResult<Self> {
        match name {
            "l2sq" => Ok(Self::L2sq),
            "cos" | "cosine" => Ok(Self::Cos),
            "hamming" => Ok(Self::Hamming),
            _ => Err(ProtocolError::InvalidMetadata(format!(
                "invalid metric {name}"
            ))),
        }
    }

    /// Returns the canonical metric name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cos => "cos",
            Self::L2sq => "l2sq",
            Self::Hamming => "hamming",
        }
    }

    /// Returns the distance operator bound to this metric.
    #[must_use]
    pub const fn operator(self) -> &'static str {
        match self {
            Self::Cos => "<=>",
            Self::L2sq => "<->",
            Self::Hamming => "<+>",
        }
    }

    /// Resolves a distance operator back to its metric.
    #[must_use]
    pub fn from_operator(op: &str) -> Option<Self> {
        match op {
            "<=>" => Some(Self::Cos),
            "<->" => Some(Self::L2sq),
            "<+>" => Some(Self::Hamming),
            _ => None,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage precision of vector components in the built index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quantization {
    /// 32-bit floats.
    #[default]
    F32,
    /// 16-bit floats.
    F16,
    /// 8-bit integers scaled to the largest absolute component.
    I8,
    /// One sign bit per component.
    B1,
}

impl Quantization {
    /// Maps a `quant_bits` option to a quantization.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] unless `bits` is 32, 16, 8
    /// or 1.
    pub fn from_bits(bits: u32) -> ProtocolResult<Self> {
        match bits {
            32 => Ok(Self::F32),
            16 => Ok(Self::F16),
            8 => Ok(Self::I8),
            1 => Ok(Self::B1),
            _ => Err(ProtocolError::InvalidMetadata(format!(
                "invalid quant_bits {bits}, expected one of 32, 16, 8, 1"
            ))),
        }
    }

    /// Returns the bit width.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::F32 => 32,
            Self::F16 => 16,
            Self::I8 => 8,
            Self::B1 => 1,
        }
    }
}

/// Byte layout of a vector record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLayout {
    /// `dimensions` little-endian f32 values.
    Float32 {
        /// Number of components.
        dimensions: usize,
    },
    /// `words` little-endian u32 words, read as a bit string.
    Bits {
        /// Number of 32-bit words.
        words: usize,
    },
    /// One product-quantization code byte per subvector.
    PqCodes {
        /// Number of subvectors.
        subvectors: usize,
    },
}

impl PayloadLayout {
    /// Number of payload elements.
    #[must_use]
    pub const fn elements(self) -> usize {
        match self {
            Self::Float32 { dimensions } => dimensions,
            Self::Bits { words } => words,
            Self::PqCodes { subvectors } => subvectors,
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        match self {
            Self::Float32 { dimensions } => dimensions * 4,
            Self::Bits { words } => words * 4,
            Self::PqCodes { subvectors } => subvectors,
        }
    }

    /// Decodes a payload of exactly [`byte_len`](Self::byte_len) bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidVector`] if the length does not match.
    pub fn decode(self, mut bytes: &[u8]) -> ProtocolResult<VectorPayload> {
        if bytes.len() != self.byte_len() {
            return Err(ProtocolError::InvalidVector {
                actual: bytes.len(),
                expected: self.byte_len(),
            });
        }
        let payload = match self {
            Self::Float32 { dimensions } => {
                let mut values = Vec::with_capacity(dimensions);
                while bytes.has_remaining() {
                    values.push(bytes.get_f32_le());
                }
                VectorPayload::F32(values)
            },
            Self::Bits { words } => {
                let mut values = Vec::with_capacity(words);
                while bytes.has_remaining() {
                    values.push(bytes.get_u32_le());
                }
                VectorPayload::Bits(values)
            },
            Self::PqCodes { .. } => VectorPayload::PqCodes(bytes.to_vec()),
        };
        Ok(payload)
    }
}

/// Vector components of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorPayload {
    /// Raw float components.
    F32(Vec<f32>),
    /// Packed bit vector.
    Bits(Vec<u32>),
    /// Product-quantization codes.
    PqCodes(Vec<u8>),
}

impl VectorPayload {
    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::Bits(v) => v.len(),
            Self::PqCodes(v) => v.len(),
        }
    }

    /// Returns `true` if the payload has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that the payload matches a layout.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidVector`] on a kind or length mismatch.
    pub fn check_layout(&self, layout: PayloadLayout) -> ProtocolResult<()> {
        let kind_matches = matches!(
            (self, layout),
            (Self::F32(_), PayloadLayout::Float32 { .. })
                | (Self::Bits(_), PayloadLayout::Bits { .. })
                | (Self::PqCodes(_), PayloadLayout::PqCodes { .. })
        );
        if !kind_matches || self.len() != layout.elements() {
            return Err(ProtocolError::InvalidVector {
                actual: self.len(),
                expected: layout.elements(),
            });
        }
        Ok(())
    }

    /// Appends the little-endian encoding of the payload.
    pub fn put(&self, buf: &mut impl BufMut) {
        match self {
            Self::F32(values) => values.iter().for_each(|v| buf.put_f32_le(*v)),
            Self::Bits(words) => words.iter().for_each(|w| buf.put_u32_le(*w)),
            Self::PqCodes(codes) => buf.put_slice(codes),
        }
    }
}

/// One row streamed from the database: identifier plus vector.
///
/// Identifiers need not be contiguous or sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Row identifier, authoritative over stream position.
    pub id: u64,
    /// Vector components.
    pub payload: VectorPayload,
}

impl VectorRecord {
    /// Creates a float record.
    #[must_use]
    pub const fn f32(id: u64, values: Vec<f32>) -> Self {
        Self {
            id,
            payload: VectorPayload::F32(values),
        }
    }

    /// Creates a bit-vector record.
    #[must_use]
    pub const fn bits(id: u64, words: Vec<u32>) -> Self {
        Self {
            id,
            payload: VectorPayload::Bits(words),
        }
    }

    /// Creates a product-quantized record.
    #[must_use]
    pub const fn pq_codes(id: u64, codes: Vec<u8>) -> Self {
        Self {
            id,
            payload: VectorPayload::PqCodes(codes),
        }
    }
}

/// Product-quantization codebook: `num_centroids` rows of `dimensions` floats.
///
/// Row `c` holds centroid `c` of every subvector, concatenated.
#[derive(Debug, Clone, PartialEq)]
pub struct Codebook {
    dimensions: usize,
    values: Vec<f32>,
}

impl Codebook {
    /// Creates a codebook from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] if `values` is not a whole
    /// number of rows.
    pub fn new(dimensions: usize, values: Vec<f32>) -> ProtocolResult<Self> {
        if dimensions == 0 || values.len() % dimensions != 0 {
            return Err(ProtocolError::InvalidMetadata(format!(
                "codebook of {} values is not a multiple of {dimensions} dimensions",
                values.len()
            )));
        }
        Ok(Self { dimensions, values })
    }

    /// Assembles a codebook from rows received one by one.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] if a row has the wrong width.
    pub fn from_rows(dimensions: usize, rows: Vec<Vec<f32>>) -> ProtocolResult<Self> {
        let mut values = Vec::with_capacity(rows.len() * dimensions);
        for row in rows {
            if row.len() != dimensions {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "codebook row has {} values, expected {dimensions}",
                    row.len()
                )));
            }
            values.extend(row);
        }
        Self::new(dimensions, values)
    }

    /// Number of centroids.
    #[must_use]
    pub fn num_centroids(&self) -> usize {
        self.values.len() / self.dimensions
    }

    /// Row width.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns centroid row `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.values
            .get(index * self.dimensions..(index + 1) * self.dimensions)
    }

    /// Iterates over the rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.dimensions)
    }

    /// All values, row-major.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Parameters of one index build, sent in the metadata frame.
///
/// Dimension and metric are fixed for the lifetime of a session. The
/// quantization width only changes storage precision, never the row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMetadata {
    /// Incoming vectors are product-quantization codes.
    pub pq: bool,
    /// Distance metric.
    pub metric: MetricKind,
    /// Storage precision.
    pub quantization: Quantization,
    /// Vector dimension (32-bit words for hamming).
    pub dimensions: u32,
    /// Graph fan-out.
    pub m: u32,
    /// Candidate list size during construction.
    pub ef_construction: u32,
    /// Candidate list size during search.
    pub ef: u32,
    /// Codebook centroids (PQ only).
    pub num_centroids: u32,
    /// Subvectors per vector (PQ only).
    pub num_subvectors: u32,
    /// Expected number of rows; a capacity hint for the server.
    pub row_count: u64,
}

impl IndexMetadata {
    /// Creates metadata with default graph parameters.
    #[must_use]
    pub const fn new(dimensions: u32, metric: MetricKind) -> Self {
        Self {
            pq: false,
            metric,
            quantization: Quantization::F32,
            dimensions,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef: DEFAULT_EF,
            num_centroids: 0,
            num_subvectors: 0,
            row_count: 0,
        }
    }

    /// Sets the graph fan-out.
    #[must_use]
    pub const fn with_m(mut self, m: u32) -> Self {
        self.m = m;
        self
    }

    /// Sets the construction and search candidate list sizes.
    #[must_use]
    pub const fn with_ef(mut self, ef_construction: u32, ef: u32) -> Self {
        self.ef_construction = ef_construction;
        self.ef = ef;
        self
    }

    /// Sets the storage precision.
    #[must_use]
    pub const fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = quantization;
        self
    }

    /// Enables product quantization.
    #[must_use]
    pub const fn with_pq(mut self, num_centroids: u32, num_subvectors: u32) -> Self {
        self.pq = true;
        self.num_centroids = num_centroids;
        self.num_subvectors = num_subvectors;
        self
    }

    /// Sets the expected row count.
    #[must_use]
    pub const fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = row_count;
        self
    }

    /// Validates the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidMetadata`] describing the first
    /// violated constraint.
    pub fn validate(&self) -> ProtocolResult<()> {
        let invalid = |msg: String| Err(ProtocolError::InvalidMetadata(msg));

        if self.dimensions == 0 || self.dimensions as usize > MAX_DIMENSIONS {
            return invalid(format!(
                "dimensions must be in 1..={MAX_DIMENSIONS}, got {}",
                self.dimensions
            ));
        }
        if !(2..=128).contains(&self.m) {
            return invalid(format!("m must be in 2..=128, got {}", self.m));
        }
        if !(1..=400).contains(&self.ef_construction) {
            return invalid(format!(
                "ef_construction must be in 1..=400, got {}",
                self.ef_construction
            ));
        }
        if !(1..=400).contains(&self.ef) {
            return invalid(format!("ef must be in 1..=400, got {}", self.ef));
        }
        if self.pq {
            if self.metric == MetricKind::Hamming {
                return invalid("pq is not supported for hamming distance".into());
            }
            if self.num_centroids == 0 || self.num_centroids as usize > MAX_PQ_CENTROIDS {
                return invalid(format!(
                    "num_centroids must be in 1..={MAX_PQ_CENTROIDS}, got {}",
                    self.num_centroids
                ));
            }
            if self.num_subvectors == 0
                || self.num_subvectors > self.dimensions
                || self.dimensions % self.num_subvectors != 0
            {
                return invalid(format!(
                    "num_subvectors {} must divide dimensions {}",
                    self.num_subvectors, self.dimensions
                ));
            }
        }
        Ok(())
    }

    /// Returns the payload layout of vector records in this session.
    #[must_use]
    pub const fn payload_layout(&self) -> PayloadLayout {
        if self.pq {
            PayloadLayout::PqCodes {
                subvectors: self.num_subvectors as usize,
            }
        } else if matches!(self.metric, MetricKind::Hamming) {
            PayloadLayout::Bits {
                words: self.dimensions as usize,
            }
        } else {
            PayloadLayout::Float32 {
                dimensions: self.dimensions as usize,
            }
        }
    }

    /// Encodes the metadata fields (without the frame tag).
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(u32::from(self.pq));
        buf.put_u32_le(self.metric.wire_id());
        buf.put_u32_le(self.quantization.bits());
        buf.put_u32_le(self.dimensions);
        buf.put_u32_le(self.m);
        buf.put_u32_le(self.ef_construction);
        buf.put_u32_le(self.ef);
        buf.put_u32_le(self.num_centroids);
        buf.put_u32_le(self.num_subvectors);
        buf.put_u64_le(self.row_count);
    }

    /// Decodes and validates metadata fields (without the frame tag).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidFrame`] if `buf` is too short, or
    /// [`ProtocolError::InvalidMetadata`] if a field is out of range.
    pub fn get(buf: &mut impl Buf) -> ProtocolResult<Self> {
        if buf.remaining() < METADATA_FIELDS_LEN {
            return Err(ProtocolError::InvalidFrame);
        }
        let pq = match buf.get_u32_le() {
            0 => false,
            1 => true,
            other => {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "invalid pq flag {other}"
                )));
            },
        };
        let metric = MetricKind::from_wire(buf.get_u32_le())?;
        let quantization = Quantization::from_bits(buf.get_u32_le())?;
        let metadata = Self {
            pq,
            metric,
            quantization,
            dimensions: buf.get_u32_le(),
            m: buf.get_u32_le(),
            ef_construction: buf.get_u32_le(),
            ef: buf.get_u32_le(),
            num_centroids: buf.get_u32_le(),
            num_subvectors: buf.get_u32_le(),
            row_count: buf.get_u64_le(),
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

/// Encoded size of the metadata fields.
pub const METADATA_FIELDS_LEN: usize = 9 * 4 + 8;

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn test_metric_wire_ids() {
        for metric in [MetricKind::Cos, MetricKind::L2sq, MetricKind::Hamming] {
            assert_eq!(MetricKind::from_wire(metric.wire_id()).unwrap(), metric);
            assert_eq!(MetricKind::parse(metric.as_str()).unwrap(), metric);
            assert_eq!(MetricKind::from_operator(metric.operator()), Some(metric));
        }
        assert_eq!(MetricKind::parse("cosine").unwrap(), MetricKind::Cos);
        assert!(MetricKind::from_wire(2).is_err());
        assert!(MetricKind::parse("dot").is_err());
    }

    #[test]
    fn test_quantization_widths() {
        for bits in [32, 16, 8, 1] {
            assert_eq!(Quantization::from_bits(bits).unwrap().bits(), bits);
        }
        assert!(Quantization::from_bits(4).is_err());
        assert!(Quantization::from_bits(0).is_err());
    }

    #[test]
    fn test_payload_layouts() {
        let meta = IndexMetadata::new(128, MetricKind::L2sq);
        assert_eq!(
            meta.payload_layout(),
            PayloadLayout::Float32 { dimensions: 128 }
        );
        assert_eq!(meta.payload_layout().byte_len(), 512);

        let meta = IndexMetadata::new(4, MetricKind::Hamming);
        assert_eq!(meta.payload_layout(), PayloadLayout::Bits { words: 4 });
        assert_eq!(meta.payload_layout().byte_len(), 16);

        let meta = IndexMetadata::new(128, MetricKind::Cos).with_pq(256, 32);
        assert_eq!(meta.payload_layout(), PayloadLayout::PqCodes { subvectors: 32 });
        assert_eq!(meta.payload_layout().byte_len(), 32);
    }

    #[test]
    fn test_quantization_does_not_change_layout() {
        let base = IndexMetadata::new(64, MetricKind::Cos);
        for quantization in [
            Quantization::F32,
            Quantization::F16,
            Quantization::I8,
            Quantization::B1,
        ] {
            assert_eq!(
                base.with_quantization(quantization).payload_layout(),
                base.payload_layout()
            );
        }
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(IndexMetadata::new(0, MetricKind::L2sq).validate().is_err());
        assert!(IndexMetadata::new(4096, MetricKind::L2sq).validate().is_err());
        assert!(
            IndexMetadata::new(8, MetricKind::L2sq)
                .with_m(1)
                .validate()
                .is_err()
        );
        assert!(
            IndexMetadata::new(8, MetricKind::L2sq)
                .with_ef(0, 10)
                .validate()
                .is_err()
        );
        // Subvectors must divide the dimension
        assert!(
            IndexMetadata::new(10, MetricKind::L2sq)
                .with_pq(16, 3)
                .validate()
                .is_err()
        );
        assert!(
            IndexMetadata::new(8, MetricKind::Hamming)
                .with_pq(16, 2)
                .validate()
                .is_err()
        );
        assert!(
            IndexMetadata::new(8, MetricKind::L2sq)
                .with_pq(300, 2)
                .validate()
                .is_err()
        );
        IndexMetadata::new(8, MetricKind::L2sq)
            .with_pq(16, 2)
            .validate()
            .unwrap();
    }

    #[test]
    fn test_metadata_fields_decode() {
        let meta = IndexMetadata::new(3, MetricKind::Cos)
            .with_m(10)
            .with_quantization(Quantization::I8)
            .with_row_count(1_000);
        let mut buf = BytesMut::new();
        meta.put(&mut buf);
        assert_eq!(buf.len(), METADATA_FIELDS_LEN);

        let decoded = IndexMetadata::get(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_metadata_decode_rejects_unknown_metric() {
        let mut buf = BytesMut::new();
        IndexMetadata::new(3, MetricKind::Cos).put(&mut buf);
        buf[4..8].copy_from_slice(&7u32.to_le_bytes());
        let err = IndexMetadata::get(&mut buf.freeze()).unwrap_err();
        assert_eq!(err.to_string(), "invalid index metadata: invalid metric 7");
    }

    #[test]
    fn test_payload_check_layout() {
        let layout = PayloadLayout::Float32 { dimensions: 3 };
        VectorPayload::F32(vec![1.0, 2.0, 3.0])
            .check_layout(layout)
            .unwrap();

        let err = VectorPayload::F32(vec![1.0, 2.0])
            .check_layout(layout)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Wrong number of dimensions: 2 instead of 3 expected"
        );
        assert!(VectorPayload::Bits(vec![1, 2, 3]).check_layout(layout).is_err());
    }

    #[test]
    fn test_codebook_rows() {
        let codebook =
            Codebook::from_rows(2, vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]).unwrap();
        assert_eq!(codebook.num_centroids(), 3);
        assert_eq!(codebook.row(1), Some(&[2.0, 3.0][..]));
        assert_eq!(codebook.row(3), None);
        assert!(Codebook::from_rows(2, vec![vec![0.0]]).is_err());
    }
}
