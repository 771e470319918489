//! `Range: bytes=...` parsing and resolution.
//!
//! Only a single range is served. Anything this server cannot satisfy
//! exactly (other units, several ranges, bad numbers, a start at or past the
//! end) is rejected and answered with 400.

use thiserror::Error;

/// An inclusive byte range (`start..=end`) within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(self) -> bool {
        self.start > self.end
    }

    /// `Content-Range` value for a resource of `total` bytes.
    pub fn content_range(self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// A parsed range specifier, not yet applied to a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-end` or `start-`.
    FromTo { start: u64, end: Option<u64> },
    /// `-suffix_len`: the last `suffix_len` bytes.
    Suffix { suffix_len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("range unit must be bytes")]
    Unit,
    #[error("invalid Range header")]
    Malformed,
    #[error("multiple ranges are not supported")]
    MultipleRanges,
    #[error("range not satisfiable")]
    Unsatisfiable,
}

pub fn parse_range_header(value: &str) -> Result<RangeSpec, RangeError> {
    let (unit, rest) = value.trim().split_once('=').ok_or(RangeError::Malformed)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(RangeError::Unit);
    }
    if rest.contains(',') {
        return Err(RangeError::MultipleRanges);
    }

    let part = rest.trim();
    if let Some(suffix) = part.strip_prefix('-') {
        return Ok(RangeSpec::Suffix {
            suffix_len: parse_u64(suffix)?,
        });
    }

    let (start, end) = part.split_once('-').ok_or(RangeError::Malformed)?;
    let start = parse_u64(start)?;
    let end = if end.trim().is_empty() {
        None
    } else {
        Some(parse_u64(end)?)
    };
    if matches!(end, Some(end) if start > end) {
        return Err(RangeError::Malformed);
    }

    Ok(RangeSpec::FromTo { start, end })
}

fn parse_u64(s: &str) -> Result<u64, RangeError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    s.parse::<u64>().map_err(|_| RangeError::Malformed)
}

impl RangeSpec {
    /// Apply to a resource of `len` bytes, clamping the end to `len - 1`.
    pub fn resolve(self, len: u64) -> Result<ByteRange, RangeError> {
        match self {
            RangeSpec::FromTo { start, end } => {
                if start >= len {
                    return Err(RangeError::Unsatisfiable);
                }
                let end = end.map_or(len - 1, |e| e.min(len - 1));
                Ok(ByteRange { start, end })
            }
            RangeSpec::Suffix { suffix_len } => {
                if suffix_len == 0 || len == 0 {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(ByteRange {
                    start: len.saturating_sub(suffix_len),
                    end: len - 1,
                })
            }
        }
    }
}
