//! Media encryption formats.
//!
//! Two on-disk formats are supported for encrypted media:
//! - CTR: the file is one AES-256-CTR keystream over the plaintext, same size
//! - Chunked: a header plus independently AES-256-CBC encrypted chunks
//!
//! Both are keyed by a PBKDF2-derived key/IV pair (see [`kdf`]).

pub mod chunked;
pub mod ctr_stream;
pub mod header;
pub mod kdf;
pub mod utils;

pub use chunked::{
    encrypt_file_in_background, CachePolicy, ChunkError, ChunkedStream, EncryptJob,
    DEFAULT_CHUNK_SIZE,
};
pub use ctr_stream::{CounterStream, CtrError};
pub use header::{FileHeader, HeaderError};
pub use kdf::{derive_key, DerivedKey, KdfError, DEFAULT_ITERATIONS, FALLBACK_PASSWORD};
pub use utils::{generate_random_bytes, generate_token};
