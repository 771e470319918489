//! Serves a file, or a byte range of it, decrypting on the fly.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::http::ResponseHead;
use super::range::parse_range_header;
use super::ServeError;
use crate::config::{CipherKind, ServerConfig};
use crate::crypto::chunked::ChunkedStream;
use crate::crypto::ctr_stream::CounterStream;
use crate::crypto::kdf::derive_key;
use crate::mime::MediaType;

/// Copy buffer size for response bodies.
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;

/// A seekable byte source with a known total length.
pub trait MediaSource: Read + Seek + Send {
    fn byte_len(&self) -> io::Result<u64>;
}

impl MediaSource for File {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

impl<S: MediaSource> MediaSource for CounterStream<S> {
    fn byte_len(&self) -> io::Result<u64> {
        self.get_ref().byte_len()
    }
}

impl<R: Read + Seek + Send> MediaSource for ChunkedStream<R> {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.len())
    }
}

/// What to serve for one streaming request.
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest<'a> {
    pub path: &'a Path,
    pub media: &'a MediaType,
    /// Password from the URL, if any.
    pub key: Option<&'a str>,
    /// Raw `Range` header value, if any.
    pub range: Option<&'a str>,
    pub head_only: bool,
}

pub struct RangeFileStreamer {
    cipher: CipherKind,
    kdf_iterations: u32,
    fallback_key: String,
}

impl RangeFileStreamer {
    pub fn new(cipher: CipherKind, kdf_iterations: u32, fallback_key: impl Into<String>) -> Self {
        Self {
            cipher,
            kdf_iterations,
            fallback_key: fallback_key.into(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.cipher, config.kdf_iterations, config.fallback_key.clone())
    }

    /// Open `path` read-only, wrapped in the configured cipher if `encrypted`.
    pub fn open_source(
        &self,
        path: &Path,
        encrypted: bool,
        key: Option<&str>,
    ) -> Result<Box<dyn MediaSource>, ServeError> {
        let file = File::open(path)?;
        if !encrypted {
            return Ok(Box::new(file));
        }

        let password = key.unwrap_or(&self.fallback_key);
        let derived = derive_key(password, self.kdf_iterations)
            .map_err(|e| ServeError::Internal(e.to_string()))?;
        Ok(match self.cipher {
            CipherKind::Ctr => Box::new(CounterStream::with_key(file, &derived)),
            CipherKind::Chunked => Box::new(ChunkedStream::open_lenient(file, derived)),
        })
    }

    /// Write the response for `request` to `out`, returning the status sent.
    ///
    /// An `Err` means nothing has been written yet and the caller should send
    /// an error response. Once the head is out, body failures are logged and
    /// the status already sent is returned.
    pub fn stream<W: Write>(&self, out: &mut W, request: StreamRequest<'_>) -> Result<u16, ServeError> {
        if !request.path.is_file() {
            return Err(ServeError::NotFound(format!("{}", request.path.display())));
        }

        let mut source = self.open_source(request.path, request.media.encrypted, request.key)?;
        let total = source.byte_len()?;

        let (status, span) = match request.range {
            None => (200, None),
            Some(header) => {
                let range = parse_range_header(header)
                    .and_then(|spec| spec.resolve(total))
                    .map_err(|e| ServeError::BadRequest(format!("{} ({:?})", e, header)))?;
                (206, Some(range))
            }
        };
        let (start, content_length) = match span {
            Some(range) => (range.start, range.len()),
            None => (0, total),
        };

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut prefetched = 0;
        if !request.head_only && content_length > 0 {
            source.seek(SeekFrom::Start(start))?;
            let want = (content_length as usize).min(COPY_BUFFER_SIZE);
            prefetched = fill(&mut *source, &mut buffer[..want])?;
        }

        let mut head = ResponseHead::media(status, &request.media.mime, content_length);
        if let Some(range) = span {
            head = head.header("Content-Range", range.content_range(total));
        }
        if let Err(e) = head.write_to(out) {
            log::debug!("Client went away before response head: {}", e);
            return Ok(status);
        }
        if request.head_only {
            return Ok(status);
        }

        if let Err(e) = copy_body(&mut *source, out, &mut buffer, prefetched, content_length) {
            log::warn!(
                "Streaming {} aborted after head was sent: {}",
                request.path.display(),
                e
            );
        }
        Ok(status)
    }
}

/// Read until `buf` is full or EOF.
fn fill<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Send the `prefetched` bytes already in `buffer`, then the rest of the span.
fn copy_body<R, W>(
    source: &mut R,
    out: &mut W,
    buffer: &mut [u8],
    prefetched: usize,
    content_length: u64,
) -> io::Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut remaining = content_length;
    let mut pending = prefetched;
    loop {
        if pending == 0 {
            break;
        }
        out.write_all(&buffer[..pending])?;
        remaining -= pending as u64;
        if remaining == 0 {
            break;
        }
        let want = (remaining as usize).min(buffer.len());
        pending = fill(source, &mut buffer[..want])?;
    }
    if remaining > 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended {} bytes early", remaining),
        ));
    }
    out.flush()
}
