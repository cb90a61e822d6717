//! Frame codec for the external index protocol.
//!
//! Frames are self-delimiting by tag, but the length of a vector record or a
//! codebook row depends on the metadata frame. [`FrameCodec`] is therefore
//! stateful: it learns the record layout from the metadata frame it decodes
//! (or encodes) and applies it to every later frame.
//!
//! # Ordering
//!
//! The decoder enforces the client-side order of the stream:
//!
//! ```text
//! Preamble, Metadata, CodebookRow*, Vector*, End
//! ```
//!
//! A vector or codebook row before the metadata frame fails with
//! [`ProtocolError::MissingInit`]; a second metadata frame or an unknown
//! tag fails with [`ProtocolError::UnexpectedMessage`]. A stream that ends in
//! the middle of a frame fails with [`ProtocolError::InvalidFrame`].
//!
//! # Security Considerations
//!
//! - Record sizes come from validated metadata, never from the peer directly
//! - The metadata is validated before any record buffer is reserved
//! - Error messages are capped at [`MAX_ERROR_MESSAGE_LEN`] bytes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::handshake::Preamble;
use super::header::IndexHeader;
use super::metadata::{IndexMetadata, VectorRecord};
use super::{
    CODEBOOK_MSG, END_MSG, ERR_MSG, INIT_MSG, LABEL_LEN, MAX_ERROR_MESSAGE_LEN,
    METADATA_FRAME_LEN, PREAMBLE_LEN, PROTOCOL_MAGIC, TAG_LEN, VECTOR_MSG,
};
use crate::error::{HandshakePhase, ProtocolError, ProtocolResult};

/// Frames sent by the database side.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Handshake preamble.
    Preamble(Preamble),
    /// Build parameters.
    Metadata(IndexMetadata),
    /// One product-quantization codebook row.
    CodebookRow(Vec<f32>),
    /// One vector record.
    Vector(VectorRecord),
    /// End of the vector stream.
    End,
}

/// Frames sent by the indexing server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Handshake preamble.
    Preamble(Preamble),
    /// Failure report; the connection is closed afterwards.
    Error(String),
    /// Header of the built index.
    IndexHeader(IndexHeader),
    /// A chunk of the index body.
    IndexBody(Bytes),
}

/// Stateful codec for [`ClientFrame`]s and [`ServerFrame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec {
    preamble_seen: bool,
    metadata: Option<IndexMetadata>,
}

impl FrameCodec {
    /// Creates a codec expecting a preamble.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata learned from the stream, if any.
    #[must_use]
    pub const fn metadata(&self) -> Option<&IndexMetadata> {
        self.metadata.as_ref()
    }

    /// Returns `false` and reserves room if `src` holds less than `needed`
    /// bytes.
    fn need(src: &mut BytesMut, needed: usize) -> bool {
        if src.len() < needed {
            src.reserve(needed - src.len());
            return false;
        }
        true
    }

    fn decode_preamble(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<ClientFrame>> {
        if src[..TAG_LEN] != PROTOCOL_MAGIC {
            return Err(ProtocolError::handshake_failed(
                HandshakePhase::Preamble,
                "invalid protocol magic",
            ));
        }
        if !Self::need(src, PREAMBLE_LEN) {
            return Ok(None);
        }
        let preamble = Preamble::decode(&src[..PREAMBLE_LEN])?;
        src.advance(PREAMBLE_LEN);
        self.preamble_seen = true;
        Ok(Some(ClientFrame::Preamble(preamble)))
    }

    fn session_metadata(&self) -> ProtocolResult<IndexMetadata> {
        self.metadata.ok_or(ProtocolError::MissingInit)
    }
}

impl Decoder for FrameCodec {
    type Item = ClientFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<ClientFrame>> {
        if !Self::need(src, TAG_LEN) {
            return Ok(None);
        }
        if !self.preamble_seen {
            return self.decode_preamble(src);
        }

        let tag = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        match tag {
            INIT_MSG => {
                if self.metadata.is_some() {
                    return Err(ProtocolError::UnexpectedMessage { tag });
                }
                if !Self::need(src, METADATA_FRAME_LEN) {
                    return Ok(None);
                }
                src.advance(TAG_LEN);
                let mut fields = src.split_to(METADATA_FRAME_LEN - TAG_LEN);
                let metadata = IndexMetadata::get(&mut fields)?;
                self.metadata = Some(metadata);
                Ok(Some(ClientFrame::Metadata(metadata)))
            },
            CODEBOOK_MSG => {
                let metadata = self.session_metadata()?;
                if !metadata.pq {
                    return Err(ProtocolError::UnexpectedMessage { tag });
                }
                let row_len = metadata.dimensions as usize * 4;
                if !Self::need(src, TAG_LEN + row_len) {
                    return Ok(None);
                }
                src.advance(TAG_LEN);
                let mut row = src.split_to(row_len);
                let mut values = Vec::with_capacity(metadata.dimensions as usize);
                while row.has_remaining() {
                    values.push(row.get_f32_le());
                }
                Ok(Some(ClientFrame::CodebookRow(values)))
            },
            VECTOR_MSG => {
                let layout = self.session_metadata()?.payload_layout();
                if !Self::need(src, TAG_LEN + LABEL_LEN + layout.byte_len()) {
                    return Ok(None);
                }
                src.advance(TAG_LEN);
                let id = src.get_u64_le();
                let payload = layout.decode(&src.split_to(layout.byte_len()))?;
                Ok(Some(ClientFrame::Vector(VectorRecord { id, payload })))
            },
            END_MSG => {
                self.session_metadata()?;
                src.advance(TAG_LEN);
                Ok(Some(ClientFrame::End))
            },
            _ => Err(ProtocolError::UnexpectedMessage { tag }),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<ClientFrame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::InvalidFrame),
        }
    }
}

impl Encoder<ClientFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ClientFrame, dst: &mut BytesMut) -> ProtocolResult<()> {
        match frame {
            ClientFrame::Preamble(preamble) => {
                dst.reserve(PREAMBLE_LEN);
                preamble.put(dst);
            },
            ClientFrame::Metadata(metadata) => {
                metadata.validate()?;
                dst.reserve(METADATA_FRAME_LEN);
                dst.put_u32_le(INIT_MSG);
                metadata.put(dst);
                self.metadata = Some(metadata);
            },
            ClientFrame::CodebookRow(row) => {
                let metadata = self.session_metadata()?;
                if row.len() != metadata.dimensions as usize {
                    return Err(ProtocolError::InvalidVector {
                        actual: row.len(),
                        expected: metadata.dimensions as usize,
                    });
                }
                dst.reserve(TAG_LEN + row.len() * 4);
                dst.put_u32_le(CODEBOOK_MSG);
                row.iter().for_each(|v| dst.put_f32_le(*v));
            },
            ClientFrame::Vector(record) => {
                let layout = self.session_metadata()?.payload_layout();
                record.payload.check_layout(layout)?;
                dst.reserve(TAG_LEN + LABEL_LEN + layout.byte_len());
                dst.put_u32_le(VECTOR_MSG);
                dst.put_u64_le(record.id);
                record.payload.put(dst);
            },
            ClientFrame::End => dst.put_u32_le(END_MSG),
        }
        Ok(())
    }
}

impl Encoder<ServerFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: ServerFrame, dst: &mut BytesMut) -> ProtocolResult<()> {
        match frame {
            ServerFrame::Preamble(preamble) => preamble.put(dst),
            ServerFrame::Error(message) => encode_error_frame(&message, dst),
            ServerFrame::IndexHeader(header) => header.put(dst),
            ServerFrame::IndexBody(chunk) => dst.extend_from_slice(&chunk),
        }
        Ok(())
    }
}

/// Appends an error frame, truncating the message to
/// [`MAX_ERROR_MESSAGE_LEN`] bytes on a character boundary.
pub fn encode_error_frame(message: &str, dst: &mut impl BufMut) {
    let mut end = message.len().min(MAX_ERROR_MESSAGE_LEN);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let message = &message[..end];
    dst.put_u32_le(ERR_MSG);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_ERROR_MESSAGE_LEN
    dst.put_u32_le(message.len() as u32);
    dst.put_slice(message.as_bytes());
}

/// Validates the length field of an error frame.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrame`] if the length exceeds
/// [`MAX_ERROR_MESSAGE_LEN`].
pub fn error_message_len(len: u32) -> ProtocolResult<usize> {
    let len = len as usize;
    if len > MAX_ERROR_MESSAGE_LEN {
        return Err(ProtocolError::InvalidFrame);
    }
    Ok(len)
}

/// Decodes the message of an error frame. Invalid UTF-8 is replaced.
#[must_use]
pub fn decode_error_message(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
