use crate::error::{Budget, ServeError};
use crate::http::request::{split_uri, Headers, Method, Request};

/// Upper bound on the header section, request line included.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Upper bound on the number of header lines.
pub const MAX_HEADER_LINES: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidHeader,
    InvalidContentLength,
    DuplicateHeader,
    UnsupportedTransferEncoding,
    HeadersTooLarge,
    BodyTooLarge,
    Incomplete,
}

impl From<ParseError> for ServeError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidRequest => ServeError::MalformedRequest("bad request line"),
            ParseError::InvalidHeader => ServeError::MalformedRequest("bad header line"),
            ParseError::InvalidContentLength => ServeError::MalformedRequest("bad Content-Length"),
            ParseError::DuplicateHeader => ServeError::MalformedRequest("duplicate header"),
            ParseError::UnsupportedTransferEncoding => {
                ServeError::NotImplemented("Transfer-Encoding")
            }
            ParseError::HeadersTooLarge => ServeError::ResourceExceeded(Budget::HeaderTooLarge),
            ParseError::BodyTooLarge => ServeError::ResourceExceeded(Budget::BodyTooLarge),
            ParseError::Incomplete => ServeError::MalformedRequest("truncated request"),
        }
    }
}

/// Parses the request line and headers from `buf`.
///
/// Returns the request (with an empty body) and the number of bytes consumed,
/// up to and including the blank line. The declared `Content-Length` is checked
/// against `max_content_length` here, so an oversized body is refused before a
/// single byte of it is read.
pub fn parse_request_head(
    buf: &[u8],
    max_content_length: u64,
) -> Result<(Request, usize), ParseError> {
    let (headers_end, sep_len) = match find_headers_end(buf) {
        Some(found) => found,
        None if buf.len() > MAX_HEADER_BYTES => return Err(ParseError::HeadersTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    if headers_end > MAX_HEADER_BYTES {
        return Err(ParseError::HeadersTooLarge);
    }

    let mut lines = buf[..headers_end]
        .split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line
        .split(|b| b.is_ascii_whitespace())
        .filter(|p| !p.is_empty());

    let method_bytes = parts.next().ok_or(ParseError::InvalidRequest)?;
    let uri_bytes = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version_bytes = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || !version_bytes.starts_with(b"HTTP/") {
        return Err(ParseError::InvalidRequest);
    }
    if !method_bytes.iter().all(|&b| is_token_byte(b)) {
        return Err(ParseError::InvalidRequest);
    }
    if !version_bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(ParseError::InvalidRequest);
    }
    if uri_bytes.iter().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidRequest);
    }

    // Token bytes are ASCII, so these conversions are lossless.
    let method_str = String::from_utf8_lossy(method_bytes);
    let version = String::from_utf8_lossy(version_bytes).into_owned();
    let uri = uri_text(uri_bytes);

    let method = Method::from_str(&method_str)
        .unwrap_or_else(|| Method::Other(method_str.into_owned()));

    // Headers
    let mut headers = Headers::new();
    let mut count = 0;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // obsolete line folding
            return Err(ParseError::InvalidHeader);
        }

        count += 1;
        if count > MAX_HEADER_LINES {
            return Err(ParseError::HeadersTooLarge);
        }

        let colon = line.iter().position(|&b| b == b':').ok_or(ParseError::InvalidHeader)?;
        let (key, value) = (&line[..colon], &line[colon + 1..]);
        if key.is_empty() || !key.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::InvalidHeader);
        }
        let value = value.trim_ascii();
        if value.iter().any(|&b| b.is_ascii_control() && b != b'\t') {
            return Err(ParseError::InvalidHeader);
        }
        let key = String::from_utf8_lossy(key);
        // Legacy Latin-1 values (Referer, User-Agent) are kept, not refused.
        let value = String::from_utf8_lossy(value);

        let single_valued =
            key.eq_ignore_ascii_case("Host") || key.eq_ignore_ascii_case("Content-Length");
        if single_valued && headers.contains(&key) {
            return Err(ParseError::DuplicateHeader);
        }

        headers.insert(key.into_owned(), value.into_owned());
    }

    if headers.contains("Transfer-Encoding") {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    if let Some(v) = headers.get("Content-Length") {
        if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let length: u64 = v.parse().map_err(|_| ParseError::BodyTooLarge)?;
        if length > max_content_length {
            return Err(ParseError::BodyTooLarge);
        }
    }

    let (path, query) = split_uri(&uri);
    let request = Request {
        method,
        uri,
        path,
        query,
        version,
        headers,
        body: Vec::new(),
    };

    Ok((request, headers_end + sep_len))
}

/// Finds the blank line that ends the header section.
///
/// Returns its offset and the length of the separator (`\r\n\r\n` or a bare `\n\n`).
fn find_headers_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Request target as text. Bytes outside ASCII become `_`, the same
/// substitution the path sanitizer makes, so a raw byte and its replacement
/// name the same file.
fn uri_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '_' })
        .collect()
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
