use serde::{Deserialize, Serialize};

/// Inclusive byte range describing the slice `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawByteRange")]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Deserialize)]
struct RawByteRange {
    start: u64,
    end: u64,
}

impl TryFrom<RawByteRange> for ByteRange {
    type Error = RangeError;

    fn try_from(raw: RawByteRange) -> Result<Self, Self::Error> {
        ByteRange::new(raw.start, raw.end).ok_or(RangeError::Invalid)
    }
}

impl ByteRange {
    /// Build a range, returning `None` when `start > end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The whole of a resource of `len` bytes; `None` for an empty resource.
    pub fn full(len: u64) -> Option<Self> {
        len.checked_sub(1).map(|end| Self { start: 0, end })
    }

    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges always hold at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The first `count` bytes of this range, or `None` when `count` is zero.
    pub fn prefix(&self, count: u64) -> Option<Self> {
        if count == 0 {
            return None;
        }
        let end = self.start.saturating_add(count - 1).min(self.end);
        Some(Self {
            start: self.start,
            end,
        })
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Outcome of resolving an optional `Range` header against a resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRange {
    /// No range requested; serve every byte with `200 OK`.
    Full(ByteRange),
    /// A single satisfiable range; serve with `206 Partial Content`.
    Partial(ByteRange),
}

impl ResolvedRange {
    pub fn range(&self) -> ByteRange {
        match self {
            ResolvedRange::Full(r) | ResolvedRange::Partial(r) => *r,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, ResolvedRange::Partial(_))
    }
}

/// Error emitted when a `Range` header cannot be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("malformed range header")]
    Invalid,
    #[error("range not satisfiable for resource length")]
    Unsatisfiable,
    #[error("resource is empty")]
    EmptyResource,
}

/// Resolve an optional raw `Range` header against a resource of `len` bytes.
///
/// A missing or blank header selects the full resource. Only the first range
/// of a comma-separated list is honoured; multipart responses are not produced.
pub fn resolve_range(header: Option<&str>, len: u64) -> Result<ResolvedRange, RangeError> {
    let full = ByteRange::full(len).ok_or(RangeError::EmptyResource)?;
    match header.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(ResolvedRange::Full(full)),
        Some(value) => parse_single_byte_range(value, len).map(ResolvedRange::Partial),
    }
}

/// Parse a `bytes=` range header into an inclusive [`ByteRange`].
pub fn parse_single_byte_range(value: &str, len: u64) -> Result<ByteRange, RangeError> {
    if len == 0 {
        return Err(RangeError::EmptyResource);
    }

    let trimmed = value.trim();
    let ranges = match trimmed.strip_prefix("bytes=") {
        Some(rest) => rest,
        None => return Err(RangeError::Invalid),
    };

    let first = ranges.split(',').next().unwrap_or_default().trim();
    if first.is_empty() {
        return Err(RangeError::Invalid);
    }

    let (start_token, end_token) = match first.split_once('-') {
        Some(pair) => pair,
        None => return Err(RangeError::Invalid),
    };

    let start_token = start_token.trim();
    let end_token = end_token.trim();

    if start_token.is_empty() {
        let suffix: u64 = end_token.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        let length = suffix.min(len);
        return Ok(ByteRange {
            start: len - length,
            end: len - 1,
        });
    }

    let start: u64 = start_token.parse().map_err(|_| RangeError::Invalid)?;
    if start >= len {
        return Err(RangeError::Unsatisfiable);
    }

    if end_token.is_empty() {
        return Ok(ByteRange {
            start,
            end: len - 1,
        });
    }

    let end: u64 = end_token.parse().map_err(|_| RangeError::Invalid)?;
    if start > end {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(ByteRange {
        start,
        end: end.min(len - 1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_range_fails_to_deserialize() {
        let ok: ByteRange = serde_json::from_str(r#"{"start":3,"end":3}"#).unwrap();
        assert_eq!(ok.len(), 1);
        let err = serde_json::from_str::<ByteRange>(r#"{"start":9,"end":2}"#).unwrap_err();
        assert!(err.to_string().contains("malformed range"));
    }

    #[test]
    fn missing_header_selects_full_resource() {
        assert_eq!(
            resolve_range(None, 1000),
            Ok(ResolvedRange::Full(ByteRange { start: 0, end: 999 }))
        );
        assert_eq!(
            resolve_range(Some("   "), 10),
            Ok(ResolvedRange::Full(ByteRange { start: 0, end: 9 }))
        );
    }

    #[test]
    fn explicit_range_is_partial() {
        let resolved = resolve_range(Some("bytes=0-499"), 1000).unwrap();
        assert!(resolved.is_partial());
        assert_eq!(resolved.range(), ByteRange { start: 0, end: 499 });
    }

    #[test]
    fn end_is_clamped_to_resource() {
        assert_eq!(
            parse_single_byte_range("bytes=900-5000", 1000),
            Ok(ByteRange {
                start: 900,
                end: 999
            })
        );
    }

    #[test]
    fn open_ended_range_runs_to_last_byte() {
        assert_eq!(
            parse_single_byte_range("bytes=500-", 1000),
            Ok(ByteRange {
                start: 500,
                end: 999
            })
        );
    }

    #[test]
    fn suffix_range_takes_trailing_bytes() {
        assert_eq!(
            parse_single_byte_range("bytes=-10", 100),
            Ok(ByteRange { start: 90, end: 99 })
        );
        assert_eq!(
            parse_single_byte_range("bytes=-500", 100),
            Ok(ByteRange { start: 0, end: 99 })
        );
    }

    #[test]
    fn only_first_of_multiple_ranges_is_used() {
        assert_eq!(
            parse_single_byte_range("bytes=0-9, 20-29", 100),
            Ok(ByteRange { start: 0, end: 9 })
        );
    }

    #[test]
    fn start_past_end_of_resource_is_unsatisfiable() {
        assert_eq!(
            parse_single_byte_range("bytes=2000-3000", 1000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(
            parse_single_byte_range("bytes=1000-", 1000),
            Err(RangeError::Unsatisfiable)
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert_eq!(
            parse_single_byte_range("bytes=20-10", 100),
            Err(RangeError::Unsatisfiable)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        for raw in ["items=0-10", "bytes=", "bytes=abc-def", "bytes=5", "bytes=-", "bytes=-0"] {
            assert!(
                parse_single_byte_range(raw, 100).is_err(),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn empty_resource_cannot_be_resolved() {
        assert_eq!(resolve_range(None, 0), Err(RangeError::EmptyResource));
    }

    #[test]
    fn prefix_truncates_to_delivered_bytes() {
        let requested = ByteRange { start: 0, end: 499 };
        assert_eq!(requested.prefix(200), Some(ByteRange { start: 0, end: 199 }));
        assert_eq!(requested.prefix(0), None);
        assert_eq!(requested.prefix(10_000), Some(requested));
    }
}
