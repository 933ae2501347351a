//! Chunked responses: split an encoded response into frames, collect them against a declared
//! total, reassemble.
//!
//! The sender puts the total in the stream header under [`CHUNK_HEADER`] as a decimal string.
//! The receiver builds a [`ChunkCollector`] from that header, pushes chunks in arrival order
//! and calls [`ChunkCollector::finish`] at end-of-stream.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::Metadata;

/// Header key carrying the total chunk count.
pub const CHUNK_HEADER: &str = "totalChunks";

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Split `bytes` into chunks of at most `chunk_size`. Always yields at least one chunk so the
/// receiver has something to decode, even for an empty response.
pub fn split_into_chunks(bytes: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes.chunks(size).map(<[u8]>::to_vec).collect()
}

/// Encode `response` and split it.
pub fn split_response<T: Serialize>(
    response: &T,
    chunk_size: usize,
) -> Result<Vec<Vec<u8>>, ChunkError> {
    let bytes = bincode::serialize(response).map_err(ChunkError::Encode)?;
    Ok(split_into_chunks(&bytes, chunk_size))
}

/// Stream header announcing `total` chunks.
pub fn chunk_header(total: usize) -> Metadata {
    let mut md = Metadata::new();
    md.insert(CHUNK_HEADER.to_string(), total.to_string());
    md
}

/// Receive side of one chunked stream.
#[derive(Debug)]
pub struct ChunkCollector {
    total: usize,
    chunks: Vec<Vec<u8>>,
}

impl ChunkCollector {
    /// Read the declared total from the stream header.
    pub fn from_header(header: &Metadata) -> Result<Self, ChunkError> {
        let raw = header
            .get(CHUNK_HEADER)
            .ok_or(ChunkError::NoStreamingHeader)?;
        let total = raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ChunkError::InvalidHeader(raw.clone()))?;
        Ok(Self::with_total(total))
    }

    pub fn with_total(total: usize) -> Self {
        Self {
            total,
            chunks: Vec::with_capacity(total.min(1024)),
        }
    }

    /// Accept the next chunk. Anything past the declared total is rejected.
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<(), ChunkError> {
        if self.chunks.len() >= self.total {
            return Err(ChunkError::Overflow { total: self.total });
        }
        self.chunks.push(chunk);
        Ok(())
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.total
    }

    /// End-of-stream reached. Fails unless every declared chunk arrived.
    pub fn finish(self) -> Result<Vec<Vec<u8>>, ChunkError> {
        if !self.is_complete() {
            return Err(ChunkError::Incomplete {
                received: self.chunks.len(),
                total: self.total,
            });
        }
        Ok(self.chunks)
    }
}

/// Default reassembly: concatenate in order and decode as one message.
pub fn assemble_chunks_into_response<T: DeserializeOwned>(
    chunks: Vec<Vec<u8>>,
) -> Result<T, ChunkError> {
    let bytes = chunks.concat();
    bincode::deserialize(&bytes).map_err(ChunkError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("no streaming header: stream header lacks totalChunks")]
    NoStreamingHeader,
    #[error("invalid totalChunks header value {0:?}")]
    InvalidHeader(String),
    #[error("received more chunks than the declared {total}")]
    Overflow { total: usize },
    #[error("stream ended after {received} of {total} chunks")]
    Incomplete { received: usize, total: usize },
    #[error("chunk encode error: {0}")]
    Encode(bincode::Error),
    #[error("chunk reassembly decode error: {0}")]
    Decode(bincode::Error),
}
