//! Single-range `Range: bytes=...` parsing.

use crate::error::{Result, VcServeError};

/// A byte range as written by the client, before the file size is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`
    Bounded { start: u64, end: u64 },
    /// `bytes=a-`
    From { start: u64 },
    /// `bytes=-n`
    Suffix { len: u64 },
}

/// Inclusive byte range resolved against a concrete file size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered. Never zero.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a file of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

impl RangeSpec {
    /// Parse a `Range` header value.
    ///
    /// Returns `None` for anything other than a single well-formed `bytes`
    /// range; callers then serve the full body.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => None,
            (true, false) => Some(RangeSpec::Suffix {
                len: end.parse().ok()?,
            }),
            (false, true) => Some(RangeSpec::From {
                start: start.parse().ok()?,
            }),
            (false, false) => {
                let start = start.parse().ok()?;
                let end = end.parse().ok()?;
                (start <= end).then_some(RangeSpec::Bounded { start, end })
            }
        }
    }

    /// Resolve against a file of `size` bytes.
    ///
    /// The end is clamped to the last byte. A start past the end of the file,
    /// a zero-length suffix, or an empty file is unsatisfiable.
    pub fn resolve(&self, size: u64) -> Result<ByteRange> {
        let unsatisfiable = || VcServeError::RangeNotSatisfiable { size };
        if size == 0 {
            return Err(unsatisfiable());
        }
        let last = size - 1;

        let range = match *self {
            RangeSpec::Bounded { start, end } => ByteRange {
                start,
                end: end.min(last),
            },
            RangeSpec::From { start } => ByteRange { start, end: last },
            RangeSpec::Suffix { len } => {
                if len == 0 {
                    return Err(unsatisfiable());
                }
                ByteRange {
                    start: size.saturating_sub(len),
                    end: last,
                }
            }
        };

        if range.start > last {
            return Err(unsatisfiable());
        }
        Ok(range)
    }
}
