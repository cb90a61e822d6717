//! Index header preceding the serialized index body.
//!
//! ```text
//! +-----------+------------+-----------------+---------------+-----------+-------------+
//! | INDEX_MSG | format [4] | num_vectors u64 | body_size u64 | body_crc  | header_crc  |
//! +-----------+------------+-----------------+---------------+-----------+-------------+
//!      4            4               8                 8             4            4
//! ```
//!
//! `header_crc` covers the first 28 bytes. The client validates the header
//! before allocating anything for the body and checks `body_crc` once the
//! last body byte arrived.

use bytes::{Buf, BufMut};

use super::{INDEX_HEADER_LEN, INDEX_MSG, MAX_INDEX_BODY_SIZE};
use crate::error::{ProtocolError, ProtocolResult};

/// Metadata describing a serialized index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    /// Serialization format identifier of the body.
    pub format: [u8; 4],
    /// Number of vectors in the index.
    pub num_vectors: u64,
    /// Exact body length in bytes.
    pub body_size: u64,
    /// CRC-32 of the body.
    pub body_crc32: u32,
}

impl IndexHeader {
    /// Describes `body`.
    #[must_use]
    pub fn for_body(format: [u8; 4], num_vectors: u64, body: &[u8]) -> Self {
        Self {
            format,
            num_vectors,
            body_size: body.len() as u64,
            body_crc32: crc32fast::hash(body),
        }
    }

    /// Appends the 32-byte encoding.
    pub fn put(&self, buf: &mut impl BufMut) {
        let mut out = [0u8; INDEX_HEADER_LEN];
        {
            let mut cursor = &mut out[..];
            cursor.put_u32_le(INDEX_MSG);
            cursor.put_slice(&self.format);
            cursor.put_u64_le(self.num_vectors);
            cursor.put_u64_le(self.body_size);
            cursor.put_u32_le(self.body_crc32);
        }
        let crc = crc32fast::hash(&out[..INDEX_HEADER_LEN - 4]);
        out[INDEX_HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        buf.put_slice(&out);
    }

    /// Returns the 32-byte encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_LEN] {
        let mut out = [0u8; INDEX_HEADER_LEN];
        self.put(&mut &mut out[..]);
        out
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidIndexHeader`] if the buffer is short,
    /// the tag is wrong, the checksum does not match or the declared body is
    /// larger than [`MAX_INDEX_BODY_SIZE`].
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < INDEX_HEADER_LEN {
            return Err(ProtocolError::invalid_header(format!(
                "expected {INDEX_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let bytes = &bytes[..INDEX_HEADER_LEN];
        let mut buf = bytes;

        let tag = buf.get_u32_le();
        if tag != INDEX_MSG {
            return Err(ProtocolError::invalid_header(format!(
                "unexpected tag {tag:#010x}"
            )));
        }
        let mut format = [0u8; 4];
        buf.copy_to_slice(&mut format);
        let num_vectors = buf.get_u64_le();
        let body_size = buf.get_u64_le();
        let body_crc32 = buf.get_u32_le();
        let header_crc32 = buf.get_u32_le();

        let actual = crc32fast::hash(&bytes[..INDEX_HEADER_LEN - 4]);
        if actual != header_crc32 {
            return Err(ProtocolError::invalid_header(format!(
                "header checksum mismatch: expected {header_crc32:#010x}, got {actual:#010x}"
            )));
        }
        if body_size > MAX_INDEX_BODY_SIZE {
            return Err(ProtocolError::invalid_header(format!(
                "body size {body_size} exceeds limit {MAX_INDEX_BODY_SIZE}"
            )));
        }

        Ok(Self {
            format,
            num_vectors,
            body_size,
            body_crc32,
        })
    }

    /// Checks a fully received body against this header.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IndexBodyCorrupted`] if the checksum differs.
    pub fn verify_body(&self, body: &[u8]) -> ProtocolResult<()> {
        let actual = crc32fast::hash(body);
        if body.len() as u64 != self.body_size || actual != self.body_crc32 {
            return Err(ProtocolError::IndexBodyCorrupted {
                expected: self.body_crc32,
                actual,
            });
        }
        Ok(())
    }
}
