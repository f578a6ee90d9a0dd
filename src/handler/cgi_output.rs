//! Reading the response head written by a CGI program or SCGI backend.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ServeError;
use crate::http::response::{Body, Response, ResponseBuilder, StatusCode};

/// Upper bound on a program's header section.
pub const MAX_CGI_HEADER_BYTES: usize = 16 * 1024;

/// Headers that describe the hop to the program, not the response.
const HOP_BY_HOP: &[&str] = &["Connection", "Keep-Alive", "Proxy-Connection", "Transfer-Encoding", "Upgrade"];

#[derive(Debug)]
pub enum HeadError {
    /// Output ended before the blank line
    Eof,
    TooLarge,
    Malformed(String),
    Io(std::io::Error),
}

impl From<HeadError> for ServeError {
    fn from(err: HeadError) -> Self {
        match err {
            HeadError::Eof => ServeError::ExecutionFailure("program output ended before headers".into()),
            HeadError::TooLarge => ServeError::ExecutionFailure("program headers too large".into()),
            HeadError::Malformed(line) => ServeError::ExecutionFailure(format!("bad program header: {line}")),
            HeadError::Io(e) => ServeError::ExecutionFailure(e.to_string()),
        }
    }
}

/// Status and headers of a program's response, plus any body bytes that were
/// read along with them.
#[derive(Debug)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub leftover: Vec<u8>,
}

pub async fn read_cgi_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<CgiHead, HeadError> {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        if let Some((end, sep)) = find_head_end(&buffer) {
            let head = buffer.split_to(end + sep);
            let (status, headers) = parse_cgi_head(&head[..end])?;
            return Ok(CgiHead {
                status,
                headers,
                leftover: buffer.to_vec(),
            });
        }
        if buffer.len() > MAX_CGI_HEADER_BYTES {
            return Err(HeadError::TooLarge);
        }
        let n = reader.read_buf(&mut buffer).await.map_err(HeadError::Io)?;
        if n == 0 {
            return Err(HeadError::Eof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, 2)),
        (Some(c), _) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

fn parse_cgi_head(head: &[u8]) -> Result<(StatusCode, Vec<(String, String)>), HeadError> {
    let text = String::from_utf8_lossy(head);
    let mut status = None;
    let mut headers = Vec::new();
    let mut has_location = false;

    for (i, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if i == 0 && line.starts_with("HTTP/") {
            // Full status line, as written by nph-style programs and most SCGI backends
            let code = line.split_whitespace().nth(1).unwrap_or("");
            status = Some(parse_status_code(code).ok_or_else(|| HeadError::Malformed(line.to_string()))?);
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(line.to_string()))?;
        let key = key.trim();
        let value = value.trim();

        if key.eq_ignore_ascii_case("Status") {
            let code = value.split_whitespace().next().unwrap_or("");
            status = Some(parse_status_code(code).ok_or_else(|| HeadError::Malformed(line.to_string()))?);
            continue;
        }
        if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(key)) {
            continue;
        }
        if key.eq_ignore_ascii_case("Location") {
            has_location = true;
        }
        headers.push((key.to_string(), value.to_string()));
    }

    let status = status.unwrap_or(if has_location { StatusCode::Found } else { StatusCode::Ok });
    Ok((status, headers))
}

fn parse_status_code(code: &str) -> Option<StatusCode> {
    let code: u16 = code.parse().ok()?;
    (100..=999).contains(&code).then(|| StatusCode::from_u16(code))
}

/// Builds the client response from a program's head and the rest of its output.
pub fn into_response(head: CgiHead, body: Body) -> Response {
    head.headers
        .into_iter()
        .fold(ResponseBuilder::new(head.status), |builder, (k, v)| {
            builder.append_header(k, v)
        })
        .stream(body)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_and_location() {
        let mut out: &[u8] = b"Location: /elsewhere\r\nX-A: 1\r\n\r\nbody";
        let head = read_cgi_head(&mut out).await.unwrap();
        assert_eq!(head.status, StatusCode::Found);
        assert_eq!(head.leftover, b"body");

        let mut out: &[u8] = b"Status: 404 Nope\nContent-Type: text/plain\n\n";
        let head = read_cgi_head(&mut out).await.unwrap();
        assert_eq!(head.status, StatusCode::NotFound);
        assert_eq!(head.headers, vec![("Content-Type".to_string(), "text/plain".to_string())]);
    }

    #[tokio::test]
    async fn status_line_and_hop_by_hop() {
        let mut out: &[u8] = b"HTTP/1.1 201 Created\r\nConnection: keep-alive\r\nX-B: 2\r\n\r\n";
        let head = read_cgi_head(&mut out).await.unwrap();
        assert_eq!(head.status, StatusCode::Created);
        assert_eq!(head.headers.len(), 1);
    }

    #[tokio::test]
    async fn truncated_output() {
        let mut out: &[u8] = b"Content-Type: text/plain\r\n";
        assert!(matches!(read_cgi_head(&mut out).await, Err(HeadError::Eof)));
    }
}
