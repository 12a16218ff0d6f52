//! Chunk management module
//!
//! Splits a file's byte range into fixed-size chunks. Chunks are the unit of
//! both fingerprinting and transfer; their index is the sole ordering key.

mod source;

pub use source::{ChunkSource, FileSource};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Default chunk size (5 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// A contiguous byte range of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this chunk in file order
    pub index: usize,
    /// Byte offset of the first byte
    pub offset: u64,
    /// Number of bytes in the chunk
    pub size: u64,
}

impl Chunk {
    /// Byte range `[offset, offset + size)`
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Number of chunks needed to cover `file_size` bytes
pub fn chunk_count(file_size: u64, chunk_size: u64) -> Result<usize> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    Ok(file_size.div_ceil(chunk_size) as usize)
}

/// Split `[0, file_size)` into ordered chunks of `chunk_size` bytes.
///
/// The final chunk may be shorter. An empty file yields no chunks.
pub fn split(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    let count = chunk_count(file_size, chunk_size)?;
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0u64;

    for index in 0..count {
        let size = chunk_size.min(file_size - offset);
        chunks.push(Chunk {
            index,
            offset,
            size,
        });
        offset += size;
    }

    Ok(chunks)
}

/// Chunks hashed for the quick signature: the first and last `chunk_size` bytes.
///
/// Files no larger than one chunk produce a single chunk covering the whole
/// file. The two jobs may overlap when the file is shorter than two chunks.
pub fn quick_signature_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    if file_size == 0 {
        return Ok(Vec::new());
    }
    if file_size <= chunk_size {
        return Ok(vec![Chunk {
            index: 0,
            offset: 0,
            size: file_size,
        }]);
    }

    Ok(vec![
        Chunk {
            index: 0,
            offset: 0,
            size: chunk_size,
        },
        Chunk {
            index: 1,
            offset: file_size - chunk_size,
            size: chunk_size,
        },
    ])
}
