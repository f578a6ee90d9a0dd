use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncSeekExt;

use crate::context::RequestContext;
use crate::error::ServeError;
use crate::handler::range::{parse_range, resolve_range};
use crate::http::date::{format_http_date, parse_http_date};
use crate::http::mime;
use crate::http::request::Request;
use crate::http::response::{Body, Response, ResponseBuilder, StatusCode};

/// Precompressed siblings, in order of preference.
const PRECOMPRESSED: &[(&str, &str)] = &[("br", "br"), ("gzip", "gz")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    MaxAge(u64),
    NoCache,
}

impl CachePolicy {
    fn header_value(self) -> String {
        match self {
            CachePolicy::MaxAge(secs) => format!("max-age={secs}"),
            CachePolicy::NoCache => "no-cache".to_string(),
        }
    }
}

/// The representation chosen for a request: the file itself or a precompressed sibling.
struct Representation {
    path: PathBuf,
    encoding: Option<&'static str>,
    size: u64,
    modified: SystemTime,
}

/// Serves `path` with conditional, range and precompression handling.
///
/// Every check that can fail runs before the body is opened for streaming.
pub async fn serve_file(
    ctx: &RequestContext<'_>,
    path: &Path,
    cache: CachePolicy,
) -> Result<Response, ServeError> {
    let request = &ctx.request;
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(ServeError::NotFound);
    }

    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let wants_range = request.range().is_some();

    let mut has_siblings = false;
    let mut chosen = None;
    for (coding, suffix) in PRECOMPRESSED {
        let sibling = sibling_path(path, suffix);
        let Ok(sibling_meta) = tokio::fs::metadata(&sibling).await else {
            continue;
        };
        if !sibling_meta.is_file() {
            continue;
        }
        has_siblings = true;
        if chosen.is_none() && !wants_range && request.accepts_encoding(coding) {
            chosen = Some(Representation {
                path: sibling,
                encoding: Some(*coding),
                size: sibling_meta.len(),
                modified: sibling_meta.modified()?,
            });
        }
    }
    let rep = match chosen {
        Some(rep) => rep,
        None => Representation {
            path: path.to_path_buf(),
            encoding: None,
            size: meta.len(),
            modified: meta.modified()?,
        },
    };

    let etag = entity_tag(rep.modified, rep.size, rep.encoding);
    let last_modified = format_http_date(rep.modified);

    let mut builder = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", mime::content_type(name))
        .header("ETag", etag.clone())
        .header("Last-Modified", last_modified)
        .header("Cache-Control", cache.header_value())
        .header("Accept-Ranges", "bytes");
    if has_siblings {
        builder = builder.header("Vary", "Accept-Encoding");
    }
    if let Some(coding) = rep.encoding {
        builder = builder.header("Content-Encoding", coding);
    }

    if is_not_modified(request, &etag, rep.modified) {
        return Ok(builder.status(StatusCode::NotModified).build());
    }

    let mut range = None;
    if rep.encoding.is_none() {
        let if_range_ok = request
            .header("If-Range")
            .map(|tag| tag.trim() == etag)
            .unwrap_or(true);
        if let Some(spec) = request.range().and_then(parse_range).filter(|_| if_range_ok) {
            range = Some(resolve_range(spec, rep.size)?);
        }
    }

    let mut file = tokio::fs::File::open(&rep.path).await?;
    match range {
        Some((start, end)) => {
            file.seek(SeekFrom::Start(start)).await?;
            Ok(builder
                .status(StatusCode::PartialContent)
                .header("Content-Range", format!("bytes {}-{}/{}", start, end, rep.size))
                .stream(Body::File { file, len: end - start + 1 })
                .build())
        }
        None => Ok(builder
            .stream(Body::File { file, len: rep.size })
            .build()),
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Strong validator built from modification time and size.
pub fn entity_tag(modified: SystemTime, size: u64, encoding: Option<&str>) -> String {
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    match encoding {
        Some(coding) => format!("\"m{:x}s{:x}-{}\"", secs, size, coding),
        None => format!("\"m{:x}s{:x}\"", secs, size),
    }
}

/// `If-None-Match` wins over `If-Modified-Since` when both are present.
fn is_not_modified(request: &Request, etag: &str, modified: SystemTime) -> bool {
    if let Some(value) = request.if_none_match() {
        return value.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.strip_prefix("W/").unwrap_or(tag) == etag
        });
    }
    if let Some(since) = request.if_modified_since().and_then(parse_http_date) {
        let modified = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        return modified <= since.timestamp();
    }
    false
}
