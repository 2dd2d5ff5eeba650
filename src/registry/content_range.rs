//! Byte range headers used by chunked uploads and ranged blob reads.

use axum::http::{HeaderName, HeaderValue, header};
use headers::{Error, Header};

/// `Content-Range: <first>-<last>` on an upload chunk. Registry clients send
/// the bare form; a leading `bytes ` unit is tolerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub first_byte: u64,
    pub last_byte: u64,
}

impl Header for ContentRange {
    fn name() -> &'static HeaderName {
        &header::CONTENT_RANGE
    }

    fn decode<'i, I: Iterator<Item = &'i HeaderValue>>(values: &mut I) -> Result<Self, Error> {
        values
            .next()
            .and_then(|v| v.to_str().ok())
            .and_then(|range| {
                let range = range.trim();
                let range = range.strip_prefix("bytes ").unwrap_or(range);
                let range = range.split_once('/').map_or(range, |(range, _)| range);

                let (first_byte, last_byte) = range.split_once('-')?;
                let first_byte = first_byte.trim().parse().ok()?;
                let last_byte = last_byte.trim().parse().ok()?;
                if last_byte < first_byte {
                    return None;
                }

                Some(ContentRange {
                    first_byte,
                    last_byte,
                })
            })
            .ok_or_else(Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = format!("{}-{}", self.first_byte, self.last_byte);
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(header_value));
        }
    }
}

/// A single-range `Range: bytes=...` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ByteRange {
    /// `bytes=a-b`
    Bounded(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last n bytes
    Suffix(u64),
}

impl ByteRange {
    /// The inclusive span this range covers in a blob of `size` bytes, or
    /// `None` if it can't be satisfied.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }

        let last = size - 1;
        match self {
            ByteRange::Bounded(first, end) if first <= end && first <= last => {
                Some((first, end.min(last)))
            }
            ByteRange::From(first) if first <= last => Some((first, last)),
            ByteRange::Suffix(n) if n > 0 => Some((size.saturating_sub(n), last)),
            _ => None,
        }
    }
}

impl Header for ByteRange {
    fn name() -> &'static HeaderName {
        &header::RANGE
    }

    fn decode<'i, I: Iterator<Item = &'i HeaderValue>>(values: &mut I) -> Result<Self, Error> {
        values
            .next()
            .and_then(|v| v.to_str().ok())
            .and_then(|range| {
                let ranges = range.trim().strip_prefix("bytes=")?;
                if ranges.contains(',') {
                    return None;
                }

                match ranges.split_once('-')? {
                    ("", n) => Some(ByteRange::Suffix(n.trim().parse().ok()?)),
                    (first, "") => Some(ByteRange::From(first.trim().parse().ok()?)),
                    (first, last) => Some(ByteRange::Bounded(
                        first.trim().parse().ok()?,
                        last.trim().parse().ok()?,
                    )),
                }
            })
            .ok_or_else(Error::invalid)
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = match self {
            ByteRange::Bounded(first, last) => format!("bytes={first}-{last}"),
            ByteRange::From(first) => format!("bytes={first}-"),
            ByteRange::Suffix(n) => format!("bytes=-{n}"),
        };
        if let Ok(header_value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(header_value));
        }
    }
}
