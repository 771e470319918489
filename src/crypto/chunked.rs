//! Chunked AES-256-CBC container with a windowed plaintext cache.
//!
//! The container splits a plaintext into fixed-size chunks, encrypts each one
//! independently with AES-256-CBC/PKCS7 (same derived key and IV for every
//! chunk), and prefixes the ciphertexts with a [`FileHeader`] recording both
//! lengths per chunk. A reader can therefore jump to any plaintext offset by
//! decrypting exactly one chunk.
//!
//! - [`encode`] / [`encrypt_file`] / [`encrypt_file_in_background`] write containers
//! - [`ChunkedStream`] reads them as a seekable, read-only byte stream
//!
//! Decrypted chunks stay cached. Whenever a chunk has to be decrypted, cached
//! chunks outside the window `[i - keep_behind, i + keep_ahead]` that have
//! been idle longer than the policy's threshold are dropped and zeroized.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;
use zeroize::Zeroize;

use super::header::{ChunkLengths, FileHeader, HeaderError};
use super::kdf::{derive_key, DerivedKey, KdfError};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Default plaintext bytes per chunk (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid container header: {0}")]
    Header(#[from] HeaderError),
    #[error("Key derivation failed: {0}")]
    Kdf(#[from] KdfError),
    #[error("Chunk {index} failed to decrypt")]
    DecryptFailed { index: usize },
    #[error("Chunk {index} decrypted to {actual} bytes, header says {expected}")]
    LengthMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("Chunked streams are read-only")]
    ReadOnly,
    #[error("Encryption job panicked")]
    JobPanicked,
}

impl From<ChunkError> for io::Error {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Io(e) => e,
            ChunkError::ReadOnly => io::Error::new(io::ErrorKind::Unsupported, err),
            ChunkError::ZeroChunkSize => io::Error::new(io::ErrorKind::InvalidInput, err),
            ChunkError::Header(HeaderError::Io(e)) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

// ── Chunk cipher ──────────────────────────────────────────────────────────────

/// Encrypt one chunk (PKCS7-padded CBC).
pub fn seal_chunk(plaintext: &[u8], key: &DerivedKey) -> Vec<u8> {
    Aes256CbcEnc::new((&key.key).into(), (&key.iv).into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt one chunk. `index` is only used for error reporting.
pub fn open_chunk(ciphertext: &[u8], key: &DerivedKey, index: usize) -> Result<Vec<u8>, ChunkError> {
    Aes256CbcDec::new((&key.key).into(), (&key.iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| ChunkError::DecryptFailed { index })
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Encode `input_len` bytes of `input` as a chunked container into `output`.
///
/// The header is written as a placeholder first and rewritten in place once
/// every chunk is sealed; `output` is left positioned at the end of the
/// container. `on_progress` receives the completed fraction after each chunk.
pub fn encode<R, W, F>(
    mut input: R,
    input_len: u64,
    mut output: W,
    key: &DerivedKey,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<FileHeader, ChunkError>
where
    R: Read,
    W: Write + Seek,
    F: FnMut(f64),
{
    if chunk_size == 0 {
        return Err(ChunkError::ZeroChunkSize);
    }

    let chunk_count = input_len.div_ceil(chunk_size as u64) as usize;
    let start = output.stream_position()?;
    FileHeader::write_placeholder(&mut output, chunk_count)?;

    let mut header = FileHeader {
        chunks: Vec::with_capacity(chunk_count),
    };
    let mut block = vec![0u8; chunk_size.min(input_len as usize)];
    let mut remaining = input_len;

    for index in 0..chunk_count {
        let take = remaining.min(chunk_size as u64) as usize;
        input.read_exact(&mut block[..take])?;
        let sealed = seal_chunk(&block[..take], key);
        output.write_all(&sealed)?;

        header.chunks.push(ChunkLengths {
            encrypted: sealed.len() as u64,
            decrypted: take as u64,
        });
        remaining -= take as u64;
        on_progress((index + 1) as f64 / chunk_count as f64);
    }
    block.zeroize();

    let end = output.stream_position()?;
    output.seek(SeekFrom::Start(start))?;
    header.write_to(&mut output)?;
    output.seek(SeekFrom::Start(end))?;
    output.flush()?;

    if chunk_count == 0 {
        on_progress(1.0);
    }
    Ok(header)
}

/// Encrypt a file into a chunked container at `output` (created or truncated).
pub fn encrypt_file<F: FnMut(f64)>(
    input: &Path,
    output: &Path,
    key: &DerivedKey,
    chunk_size: usize,
    on_progress: F,
) -> Result<FileHeader, ChunkError> {
    let source = File::open(input)?;
    let input_len = source.metadata()?.len();
    let sink = BufWriter::new(File::create(output)?);

    let header = encode(
        BufReader::new(source),
        input_len,
        sink,
        key,
        chunk_size,
        on_progress,
    )?;

    log::info!(
        "Chunk-encrypted {} ({} bytes, {} chunks) -> {}",
        input.display(),
        input_len,
        header.chunks.len(),
        output.display()
    );
    Ok(header)
}

/// Progress shared between a background encryption job and its observers.
#[derive(Debug, Default)]
struct JobProgress {
    fraction_bits: AtomicU64,
    completed: AtomicBool,
}

impl JobProgress {
    fn set_fraction(&self, fraction: f64) {
        self.fraction_bits.store(fraction.to_bits(), Ordering::Release);
    }

    fn fraction(&self) -> f64 {
        f64::from_bits(self.fraction_bits.load(Ordering::Acquire))
    }
}

/// Handle to a chunked encryption running on its own thread.
pub struct EncryptJob {
    progress: Arc<JobProgress>,
    handle: JoinHandle<Result<FileHeader, ChunkError>>,
}

impl EncryptJob {
    /// Completed fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress.fraction()
    }

    pub fn is_completed(&self) -> bool {
        self.progress.completed.load(Ordering::Acquire)
    }

    /// Block until the job finishes and return its result.
    pub fn wait(self) -> Result<FileHeader, ChunkError> {
        self.handle.join().map_err(|_| ChunkError::JobPanicked)?
    }
}

/// Start encrypting `input` into `output` on a background thread.
///
/// The password is stretched on the worker thread. `on_complete` runs
/// exactly once on that thread, after the output file is closed.
pub fn encrypt_file_in_background<F>(
    input: PathBuf,
    output: PathBuf,
    password: String,
    iterations: u32,
    chunk_size: usize,
    on_complete: F,
) -> Result<EncryptJob, ChunkError>
where
    F: FnOnce(&Result<FileHeader, ChunkError>) + Send + 'static,
{
    let progress = Arc::new(JobProgress::default());
    let job_progress = Arc::clone(&progress);

    let handle = std::thread::Builder::new()
        .name("chunk-encrypt".to_string())
        .spawn(move || {
            let result = derive_key(&password, iterations)
                .map_err(ChunkError::from)
                .and_then(|key| {
                    encrypt_file(&input, &output, &key, chunk_size, |f| {
                        job_progress.set_fraction(f)
                    })
                });
            if let Err(e) = &result {
                log::error!("Background encryption of {} failed: {}", input.display(), e);
            }
            job_progress.completed.store(true, Ordering::Release);
            on_complete(&result);
            result
        })?;

    Ok(EncryptJob { progress, handle })
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// When cached plaintext may be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Chunks before the faulting one that are always kept.
    pub keep_behind: usize,
    /// Chunks after the faulting one that are always kept.
    pub keep_ahead: usize,
    /// Chunks outside the window idle for longer than this are dropped.
    pub idle: Duration,
}

impl CachePolicy {
    /// True once a chunk untouched for `idle_for` may be evicted.
    pub fn is_expired(&self, idle_for: Duration) -> bool {
        idle_for > self.idle
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            keep_behind: 2,
            keep_ahead: 4,
            idle: Duration::from_secs(4),
        }
    }
}

/// Decrypted chunk contents. Zeroized on drop.
struct CachedPlaintext {
    data: Vec<u8>,
}

impl Drop for CachedPlaintext {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

struct ChunkDescriptor {
    encrypted_len: u64,
    decrypted_len: u64,
    encrypted_offset: u64,
    decrypted_offset: u64,
    plaintext: Option<CachedPlaintext>,
    last_touched: Instant,
}

impl ChunkDescriptor {
    fn decrypted_end(&self) -> u64 {
        self.decrypted_offset + self.decrypted_len
    }
}

struct ChunkState<R> {
    base: R,
    key: DerivedKey,
    chunks: Vec<ChunkDescriptor>,
    length: u64,
    position: u64,
    policy: CachePolicy,
    decrypts: u64,
}

/// Read the header and lay out chunk offsets, validating against the file size.
fn read_chunk_table<R: Read + Seek>(base: &mut R) -> Result<Vec<ChunkDescriptor>, ChunkError> {
    base.seek(SeekFrom::Start(0))?;
    let header = FileHeader::read_from(base)?;
    let file_len = base.seek(SeekFrom::End(0))?;

    let now = Instant::now();
    let mut encrypted_offset = FileHeader::encoded_len(header.chunks.len());
    let mut decrypted_offset = 0u64;
    let mut chunks = Vec::with_capacity(header.chunks.len());

    for lengths in &header.chunks {
        chunks.push(ChunkDescriptor {
            encrypted_len: lengths.encrypted,
            decrypted_len: lengths.decrypted,
            encrypted_offset,
            decrypted_offset,
            plaintext: None,
            last_touched: now,
        });
        encrypted_offset = encrypted_offset.saturating_add(lengths.encrypted);
        decrypted_offset = decrypted_offset.saturating_add(lengths.decrypted);
    }

    if encrypted_offset > file_len {
        return Err(HeaderError::Truncated {
            expected: encrypted_offset,
            actual: file_len,
        }
        .into());
    }
    Ok(chunks)
}

impl<R: Read + Seek> ChunkState<R> {
    /// Index of the chunk containing `position`. Requires `position < length`.
    fn locate(&self, position: u64) -> usize {
        self.chunks
            .partition_point(|chunk| chunk.decrypted_end() <= position)
    }

    fn load(&mut self, index: usize) -> Result<(), ChunkError> {
        if self.chunks[index].plaintext.is_some() {
            return Ok(());
        }

        let (offset, encrypted_len, expected) = {
            let chunk = &self.chunks[index];
            (chunk.encrypted_offset, chunk.encrypted_len, chunk.decrypted_len)
        };

        self.base.seek(SeekFrom::Start(offset))?;
        let mut ciphertext = vec![0u8; encrypted_len as usize];
        self.base.read_exact(&mut ciphertext)?;

        let data = open_chunk(&ciphertext, &self.key, index)?;
        if data.len() as u64 != expected {
            return Err(ChunkError::LengthMismatch {
                index,
                expected,
                actual: data.len() as u64,
            });
        }
        self.decrypts += 1;

        let now = Instant::now();
        let chunk = &mut self.chunks[index];
        chunk.plaintext = Some(CachedPlaintext { data });
        chunk.last_touched = now;

        self.evict_around(index, now);
        Ok(())
    }

    fn evict_around(&mut self, index: usize, now: Instant) {
        let low = index.saturating_sub(self.policy.keep_behind);
        let high = index.saturating_add(self.policy.keep_ahead);
        let policy = self.policy;

        let mut evicted = 0usize;
        for (i, chunk) in self.chunks.iter_mut().enumerate() {
            if (i < low || i > high)
                && chunk.plaintext.is_some()
                && policy.is_expired(now.duration_since(chunk.last_touched))
            {
                chunk.plaintext = None;
                evicted += 1;
            }
        }
        if evicted > 0 {
            log::debug!("Evicted {} cached chunks around chunk {}", evicted, index);
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChunkError> {
        let mut filled = 0;
        while filled < buf.len() && self.position < self.length {
            let index = self.locate(self.position);
            self.load(index)?;

            let chunk = &mut self.chunks[index];
            chunk.last_touched = Instant::now();
            let Some(cached) = chunk.plaintext.as_ref() else {
                break;
            };

            let offset = (self.position - chunk.decrypted_offset) as usize;
            let n = (cached.data.len() - offset).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&cached.data[offset..offset + n]);
            filled += n;
            self.position += n as u64;
        }
        Ok(filled)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.position.checked_add_signed(d),
            SeekFrom::End(d) => self.length.checked_add_signed(d),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ));
        };
        self.position = target;
        Ok(target)
    }
}

/// Read-only, seekable view of a chunked container.
///
/// All state sits behind one lock, so `&ChunkedStream` is itself a reader
/// and can be shared between threads.
pub struct ChunkedStream<R> {
    state: Mutex<ChunkState<R>>,
}

impl<R: Read + Seek> ChunkedStream<R> {
    /// Open a container. Fails if the header is malformed or the file is
    /// shorter than the header claims.
    pub fn open(mut base: R, key: DerivedKey) -> Result<Self, ChunkError> {
        let chunks = read_chunk_table(&mut base)?;
        Ok(Self::from_parts(base, key, chunks))
    }

    /// Open a container, treating an unreadable header as an empty stream.
    pub fn open_lenient(mut base: R, key: DerivedKey) -> Self {
        let chunks = match read_chunk_table(&mut base) {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("Unreadable chunked container, serving as empty: {}", e);
                Vec::new()
            }
        };
        Self::from_parts(base, key, chunks)
    }

    fn from_parts(base: R, key: DerivedKey, chunks: Vec<ChunkDescriptor>) -> Self {
        let length = chunks.last().map(|c| c.decrypted_end()).unwrap_or(0);
        Self {
            state: Mutex::new(ChunkState {
                base,
                key,
                chunks,
                length,
                position: 0,
                policy: CachePolicy::default(),
                decrypts: 0,
            }),
        }
    }

    pub fn with_cache_policy(self, policy: CachePolicy) -> Self {
        self.lock().policy = policy;
        self
    }
}

impl<R> ChunkedStream<R> {
    fn lock(&self) -> MutexGuard<'_, ChunkState<R>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total plaintext length.
    pub fn len(&self) -> u64 {
        self.lock().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn position(&self) -> u64 {
        self.lock().position
    }

    /// Number of chunk decryptions performed so far.
    pub fn decrypt_count(&self) -> u64 {
        self.lock().decrypts
    }

    /// Indices of chunks whose plaintext is currently cached.
    pub fn cached_chunks(&self) -> Vec<usize> {
        self.lock()
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.plaintext.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

impl<R: Read + Seek> Read for &ChunkedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock().read(buf).map_err(io::Error::from)
    }
}

impl<R: Read + Seek> Seek for &ChunkedStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.lock().seek(pos)
    }
}

impl<R: Read + Seek> Read for ChunkedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl<R: Read + Seek> Seek for ChunkedStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (&*self).seek(pos)
    }
}

impl<R> Write for ChunkedStream<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(ChunkError::ReadOnly.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
