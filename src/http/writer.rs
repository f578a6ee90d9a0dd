use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::SERVER_SOFTWARE;
use crate::error::{Budget, ServeError};
use crate::http::date::format_http_date;
use crate::http::response::{Body, Response};
use crate::server::limits;

const HTTP_VERSION: &str = "HTTP/1.1";
const COPY_BUFFER: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The client went away or the socket failed.
    #[error("client write failed: {0}")]
    Client(#[from] std::io::Error),
    /// The program producing the body failed after headers were sent.
    #[error(transparent)]
    Program(ServeError),
}

/// Bytes sent so far. Kept outside the writer so a caller that times the write
/// out still knows whether headers reached the client.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteProgress {
    pub bytes: u64,
}

impl WriteProgress {
    pub fn headers_sent(&self) -> bool {
        self.bytes > 0
    }
}

/// True when the body length cannot be told to the client, so the end of the
/// body has to be signalled by closing the connection.
pub fn is_close_delimited(resp: &Response) -> bool {
    !resp.status.is_bodyless()
        && resp.header("Content-Length").is_none()
        && resp.body.known_len().is_none()
}

pub fn serialize_head(resp: &Response, keep_alive: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let date = format_http_date(SystemTime::now());
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let fixed = [("Date", date.as_str()), ("Server", SERVER_SOFTWARE), ("Connection", connection)];

    // Headers
    for (k, v) in fixed.iter().copied().chain(resp.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))) {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
    buf
}

pub struct ResponseWriter {
    head: Vec<u8>,
    head_only: bool,
}

impl ResponseWriter {
    /// `head_only` suppresses the body, as for HEAD requests and bodyless statuses.
    pub fn new(response: &Response, keep_alive: bool, head_only: bool) -> Self {
        Self {
            head: serialize_head(response, keep_alive),
            head_only: head_only || response.status.is_bodyless(),
        }
    }

    pub async fn write_to_stream<S: AsyncWrite + Unpin>(
        self,
        stream: &mut S,
        body: Body,
        progress: &mut WriteProgress,
    ) -> Result<(), WriteError> {
        stream.write_all(&self.head).await?;
        progress.bytes += self.head.len() as u64;

        match body {
            Body::Empty => {}
            Body::Bytes(bytes) => {
                if !self.head_only {
                    stream.write_all(&bytes).await?;
                    progress.bytes += bytes.len() as u64;
                }
            }
            Body::File { file, len } => {
                if !self.head_only {
                    copy_counted(&mut file.take(len), stream, progress).await?;
                }
            }
            Body::Stream(mut reader) => {
                if !self.head_only {
                    copy_counted(&mut reader, stream, progress).await?;
                }
            }
            Body::Process { mut stdout, mut child } => {
                if !self.head_only {
                    copy_counted(&mut stdout, stream, progress).await?;
                }
                drop(stdout);
                let status = child.wait().await?;
                if limits::cpu_exhausted(&status) {
                    stream.flush().await?;
                    return Err(WriteError::Program(ServeError::ResourceExceeded(Budget::Cpu)));
                }
                if !status.success() {
                    tracing::warn!(status = %status, "CGI program exited unsuccessfully");
                }
            }
        }

        stream.flush().await?;
        Ok(())
    }
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, progress: &mut WriteProgress) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        progress.bytes += n as u64;
    }
}
