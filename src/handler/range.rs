//! Single byte-range requests.

use crate::error::ServeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b` or `bytes=a-`
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`, the last n bytes
    Suffix(u64),
}

/// Parses a `Range` header. Returns `None` for anything that should be ignored:
/// other units, multiple ranges, or syntax errors. The full entity is sent then.
pub fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (first, last) = spec.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        return last.parse().ok().map(RangeSpec::Suffix);
    }
    let start = first.parse().ok()?;
    let end = if last.is_empty() {
        None
    } else {
        Some(last.parse().ok()?)
    };
    Some(RangeSpec::From { start, end })
}

/// Turns a range into inclusive byte offsets within a resource of `size` bytes.
pub fn resolve_range(spec: RangeSpec, size: u64) -> Result<(u64, u64), ServeError> {
    let unsatisfiable = ServeError::RangeNotSatisfiable { size };
    if size == 0 {
        return Err(unsatisfiable);
    }
    match spec {
        RangeSpec::From { start, end } => {
            if start >= size {
                return Err(unsatisfiable);
            }
            let end = end.unwrap_or(size - 1);
            if end < start {
                return Err(unsatisfiable);
            }
            Ok((start, end.min(size - 1)))
        }
        RangeSpec::Suffix(0) => Err(unsatisfiable),
        RangeSpec::Suffix(n) => Ok((size.saturating_sub(n), size - 1)),
    }
}
