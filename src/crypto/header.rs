//! On-disk header of the chunked container.
//!
//! ```text
//! i32 LE  chunk_count
//! chunk_count × { i64 LE encrypted_len, i64 LE decrypted_len }
//! ```
//!
//! The ciphertext of each chunk follows the header back-to-back, in order.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Size of the leading chunk count.
pub const COUNT_SIZE: u64 = 4;

/// Size of one `(encrypted_len, decrypted_len)` entry.
pub const ENTRY_SIZE: u64 = 16;

/// Upper bound on entries pre-allocated from an untrusted count.
const MAX_PREALLOC: usize = 4096;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Header I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Negative chunk count: {0}")]
    NegativeCount(i32),
    #[error("Chunk {index} has a negative length")]
    NegativeLength { index: usize },
    #[error("Too many chunks for header: {0}")]
    TooManyChunks(usize),
    #[error("Container truncated: header describes {expected} bytes, file has {actual}")]
    Truncated { expected: u64, actual: u64 },
}

/// Lengths of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLengths {
    /// Ciphertext bytes on disk, padding included.
    pub encrypted: u64,
    /// Plaintext bytes the chunk decrypts to.
    pub decrypted: u64,
}

/// Chunk table at the start of a chunked container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    /// One entry per chunk, in file order.
    pub chunks: Vec<ChunkLengths>,
}

impl FileHeader {
    /// Encoded size of a header describing `chunk_count` chunks.
    pub fn encoded_len(chunk_count: usize) -> u64 {
        COUNT_SIZE + ENTRY_SIZE * chunk_count as u64
    }

    /// Total plaintext length described by the header.
    pub fn decrypted_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.decrypted).sum()
    }

    /// Total ciphertext length following the header.
    pub fn encrypted_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.encrypted).sum()
    }

    /// Write a zero-filled header of the right size, to be overwritten once
    /// the chunk lengths are known.
    pub fn write_placeholder<W: Write>(w: &mut W, chunk_count: usize) -> Result<(), HeaderError> {
        let count = i32::try_from(chunk_count).map_err(|_| HeaderError::TooManyChunks(chunk_count))?;
        w.write_i32::<LittleEndian>(count)?;
        for _ in 0..chunk_count {
            w.write_i64::<LittleEndian>(0)?;
            w.write_i64::<LittleEndian>(0)?;
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), HeaderError> {
        let count = i32::try_from(self.chunks.len())
            .map_err(|_| HeaderError::TooManyChunks(self.chunks.len()))?;
        w.write_i32::<LittleEndian>(count)?;
        for (index, chunk) in self.chunks.iter().enumerate() {
            let encrypted = i64::try_from(chunk.encrypted)
                .map_err(|_| HeaderError::NegativeLength { index })?;
            let decrypted = i64::try_from(chunk.decrypted)
                .map_err(|_| HeaderError::NegativeLength { index })?;
            w.write_i64::<LittleEndian>(encrypted)?;
            w.write_i64::<LittleEndian>(decrypted)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, HeaderError> {
        let count = r.read_i32::<LittleEndian>()?;
        if count < 0 {
            return Err(HeaderError::NegativeCount(count));
        }
        let count = count as usize;

        let mut chunks = Vec::with_capacity(count.min(MAX_PREALLOC));
        for index in 0..count {
            let encrypted = r.read_i64::<LittleEndian>()?;
            let decrypted = r.read_i64::<LittleEndian>()?;
            if encrypted < 0 || decrypted < 0 {
                return Err(HeaderError::NegativeLength { index });
            }
            chunks.push(ChunkLengths {
                encrypted: encrypted as u64,
                decrypted: decrypted as u64,
            });
        }

        Ok(Self { chunks })
    }
}
