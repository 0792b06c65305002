//! Binary and text framing for the training upload and the regression stream

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{ModelType, HEADER_ACK};

/// Size of the (index, total) header in front of every training chunk
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Default payload bytes per training chunk, kept under a typical path MTU
pub const DEFAULT_CHUNK_SIZE: usize = 1400;

/// Number of values in a regression vector
pub const REGRESSION_VALUES: usize = 4;

/// Size of a regression datagram
pub const REGRESSION_DATAGRAM_SIZE: usize = REGRESSION_VALUES * 8;

/// Codec errors
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("Datagram too short: {0} bytes (need at least {1})")]
    TooShort(usize, usize),

    #[error("Expected {expected} values, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Too many chunks: {0}")]
    TooManyChunks(usize),

    #[error("Chunk size must be non-zero")]
    ZeroChunkSize,
}

/// Header announcing a training upload
pub fn encode_training_header(model_type: ModelType, total_chunks: u32) -> String {
    format!(
        "MODEL_TYPE:{}\nTOTAL_CHUNKS:{}",
        model_type.wire_name(),
        total_chunks
    )
}

/// Reply expected for a given chunk index
pub fn chunk_ack(index: u32) -> String {
    format!("ACK:{}", index)
}

/// Check whether a reply acknowledges the header
pub fn is_header_ack(reply: &str) -> bool {
    reply == HEADER_ACK
}

/// Extract the index from an `ACK:<index>` reply
pub fn parse_chunk_ack(reply: &str) -> Option<u32> {
    reply.strip_prefix("ACK:")?.parse().ok()
}

/// Dataset split into fixed-size pieces
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    data: Bytes,
    chunk_size: usize,
    total: u32,
}

impl ChunkPlan {
    pub fn new(data: impl Into<Bytes>, chunk_size: usize) -> Result<Self, CodecError> {
        if chunk_size == 0 {
            return Err(CodecError::ZeroChunkSize);
        }
        let data = data.into();
        let count = data.len().div_ceil(chunk_size);
        let total = u32::try_from(count).map_err(|_| CodecError::TooManyChunks(count))?;
        Ok(Self {
            data,
            chunk_size,
            total,
        })
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    /// Payload of chunk `index` (zero-copy slice of the dataset)
    pub fn chunk(&self, index: u32) -> Bytes {
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        self.data.slice(start.min(end)..end)
    }

    /// Header plus payload, ready to send
    pub fn datagram(&self, index: u32) -> Bytes {
        encode_chunk_datagram(index, self.total, &self.chunk(index))
    }
}

/// Prepend the big-endian (index, total) header to a chunk payload
pub fn encode_chunk_datagram(index: u32, total: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    buf.put_u32(index);
    buf.put_u32(total);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a chunk datagram into (index, total, payload)
pub fn decode_chunk_datagram(datagram: &[u8]) -> Result<(u32, u32, &[u8]), CodecError> {
    if datagram.len() < CHUNK_HEADER_SIZE {
        return Err(CodecError::TooShort(datagram.len(), CHUNK_HEADER_SIZE));
    }
    let mut header = &datagram[..CHUNK_HEADER_SIZE];
    let index = header.get_u32();
    let total = header.get_u32();
    Ok((index, total, &datagram[CHUNK_HEADER_SIZE..]))
}

/// Four little-endian f64 values
pub fn encode_regression(values: &[f64; REGRESSION_VALUES]) -> [u8; REGRESSION_DATAGRAM_SIZE] {
    let mut out = [0u8; REGRESSION_DATAGRAM_SIZE];
    let mut buf = &mut out[..];
    for value in values {
        buf.put_f64_le(*value);
    }
    out
}

pub fn decode_regression(datagram: &[u8]) -> Result<[f64; REGRESSION_VALUES], CodecError> {
    if datagram.len() != REGRESSION_DATAGRAM_SIZE {
        return Err(CodecError::WrongLength {
            expected: REGRESSION_DATAGRAM_SIZE,
            actual: datagram.len(),
        });
    }
    let mut buf = datagram;
    let mut values = [0.0; REGRESSION_VALUES];
    for value in values.iter_mut() {
        *value = buf.get_f64_le();
    }
    Ok(values)
}
