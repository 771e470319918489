//! AES-256-CTR as a seekable byte stream.
//!
//! `CounterStream` wraps any byte stream and XORs everything that passes
//! through it with the AES-CTR keystream, so the same type both encrypts
//! (write side) and decrypts (read side). Because CTR never depends on
//! preceding ciphertext, the stream can seek anywhere in O(1): the counter
//! for byte offset `n` is the initial counter block advanced by `n / 16`.
//!
//! The whole 16-byte IV is the counter block and is incremented as one
//! big-endian 128-bit integer with wraparound (`Ctr128BE` semantics). Files
//! written here must decrypt identically after any seek, so the increment
//! and the advance-by-N used on seek are both explicit byte-level carries.
//!
//! SECURITY NOTE: CTR provides no authentication. A tampered ciphertext
//! decrypts to garbage at the same offsets, never to an error.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use thiserror::Error;

use super::kdf::{derive_key, DerivedKey, KdfError, IV_SIZE, KEY_SIZE};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Scratch space used when encrypting on the write path.
const WRITE_SCRATCH: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum CtrError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Key derivation failed: {0}")]
    Kdf(#[from] KdfError),
}

// ── Counter arithmetic ────────────────────────────────────────────────────────

/// Add one to a big-endian 128-bit counter, wrapping to zero after all-ones.
pub fn increment_counter(counter: &mut [u8; BLOCK_SIZE]) {
    for byte in counter.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Add `blocks` to a big-endian 128-bit counter, wrapping on overflow.
///
/// Equivalent to calling [`increment_counter`] `blocks` times.
pub fn advance_counter(counter: &mut [u8; BLOCK_SIZE], blocks: u64) {
    let mut carry = blocks;
    for byte in counter.iter_mut().rev() {
        if carry == 0 {
            break;
        }
        let sum = u64::from(*byte) + (carry & 0xff);
        *byte = sum as u8;
        carry = (carry >> 8) + (sum >> 8);
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// Seekable AES-256-CTR transform over an inner stream.
///
/// The inner stream is assumed to start at offset 0; the keystream position
/// tracks the inner stream's position from then on.
pub struct CounterStream<S> {
    inner: S,
    cipher: Aes256,
    iv: [u8; IV_SIZE],
    counter: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    /// Next unused byte of `keystream`; `BLOCK_SIZE` means exhausted.
    cursor: usize,
    position: u64,
}

impl<S> CounterStream<S> {
    pub fn new(inner: S, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner,
            cipher: Aes256::new(key.into()),
            iv: *iv,
            counter: *iv,
            keystream: [0u8; BLOCK_SIZE],
            cursor: BLOCK_SIZE,
            position: 0,
        }
    }

    pub fn with_key(inner: S, derived: &DerivedKey) -> Self {
        Self::new(inner, &derived.key, &derived.iv)
    }

    /// Current plaintext/ciphertext offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn refill_keystream(&mut self) {
        let mut block = Block::from(self.counter);
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
        increment_counter(&mut self.counter);
        self.cursor = 0;
    }

    fn apply_keystream(&mut self, data: &mut [u8]) {
        let mut done = 0;
        while done < data.len() {
            if self.cursor == BLOCK_SIZE {
                self.refill_keystream();
            }
            let n = (BLOCK_SIZE - self.cursor).min(data.len() - done);
            let keystream = &self.keystream[self.cursor..self.cursor + n];
            for (byte, k) in data[done..done + n].iter_mut().zip(keystream) {
                *byte ^= k;
            }
            self.cursor += n;
            done += n;
        }
        self.position += data.len() as u64;
    }

    /// Re-derive the keystream for an absolute offset.
    fn reposition(&mut self, target: u64) {
        self.counter = self.iv;
        advance_counter(&mut self.counter, target / BLOCK_SIZE as u64);
        self.refill_keystream();
        self.cursor = (target % BLOCK_SIZE as u64) as usize;
        self.position = target;
    }
}

impl<S: Read> Read for CounterStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

impl<S: Write> Write for CounterStream<S> {
    /// Encrypts and writes the whole buffer. A failed inner write leaves the
    /// keystream ahead of the inner stream; seek before writing again.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut scratch = [0u8; WRITE_SCRATCH];
        for piece in buf.chunks(WRITE_SCRATCH) {
            let out = &mut scratch[..piece.len()];
            out.copy_from_slice(piece);
            self.apply_keystream(out);
            self.inner.write_all(out)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: Seek> Seek for CounterStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = self.inner.seek(pos)?;
        self.reposition(target);
        Ok(target)
    }
}

// ── File encryption ───────────────────────────────────────────────────────────

/// Encrypt `input` into `output` with the password-derived CTR key.
///
/// `output` is created or truncated. Returns the number of bytes written.
pub fn encrypt_file(
    input: &Path,
    output: &Path,
    password: &str,
    iterations: u32,
) -> Result<u64, CtrError> {
    let derived = derive_key(password, iterations)?;
    let mut reader = BufReader::new(File::open(input)?);
    let writer = BufWriter::new(File::create(output)?);

    let mut stream = CounterStream::with_key(writer, &derived);
    let written = io::copy(&mut reader, &mut stream)?;
    stream.flush()?;

    log::info!(
        "CTR-encrypted {} ({} bytes) -> {}",
        input.display(),
        written,
        output.display()
    );
    Ok(written)
}
