//! SCGI backend descriptors
//!
//! A file ending in `.scgi` inside a site names the backend that serves it:
//!
//! ```text
//! SCGI 127.0.0.1 9000
//! fallback: offline.html
//! relight: /usr/local/bin/start-app --daemon
//! ```
//!
//! The descriptor is read again on every request; nothing is cached.

use std::path::{Path, PathBuf};

use url::Host;

use crate::error::ServeError;
use crate::site::path::{check_components, sanitize};

/// Backend named by a `.scgi` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScgiBackendSpec {
    pub host: String,
    pub port: u16,
    /// File served when the backend cannot be reached
    pub fallback: Option<PathBuf>,
    /// Shell command that (re)starts the backend
    pub relight: Option<String>,
}

fn misformatted(detail: impl Into<String>) -> ServeError {
    ServeError::ExecutionFailure(format!("misformatted SCGI descriptor: {}", detail.into()))
}

impl ScgiBackendSpec {
    /// Parses descriptor text. Relative `fallback:` paths are resolved against `dir`.
    pub fn parse(text: &str, dir: &Path) -> Result<Self, ServeError> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        let first = lines.next().ok_or_else(|| misformatted("empty"))?;
        let mut words = first.split_whitespace();
        if words.next() != Some("SCGI") {
            return Err(misformatted(first));
        }
        let host = words.next().ok_or_else(|| misformatted("missing host"))?;
        let port = words
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| misformatted("missing or bad port"))?;
        if words.next().is_some() {
            return Err(misformatted(first));
        }
        let host = match Host::parse(host).map_err(|_| misformatted(format!("bad host {host}")))? {
            Host::Domain(d) => d,
            Host::Ipv4(a) => a.to_string(),
            Host::Ipv6(a) => a.to_string(),
        };

        let mut spec = ScgiBackendSpec {
            host,
            port,
            fallback: None,
            relight: None,
        };

        for line in lines {
            if let Some(path) = line.strip_prefix("fallback:") {
                spec.fallback = Some(fallback_path(path.trim(), dir)?);
            } else if let Some(command) = line.strip_prefix("relight:") {
                let command = command.trim();
                if command.is_empty() {
                    return Err(misformatted("empty relight command"));
                }
                spec.relight = Some(command.to_string());
            } else {
                return Err(misformatted(line));
            }
        }

        Ok(spec)
    }

    pub fn load(path: &Path) -> Result<Self, ServeError> {
        let text = std::fs::read_to_string(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        Self::parse(&text, dir)
    }

    /// `host:port` for logging and connecting.
    pub fn display_name(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Fallback files obey the same component rules as request paths.
fn fallback_path(path: &str, dir: &Path) -> Result<PathBuf, ServeError> {
    if path.is_empty() || path.starts_with('/') {
        return Err(misformatted(format!("fallback must be a relative path: {path:?}")));
    }
    let rooted = format!("/{path}");
    if sanitize(rooted.as_bytes()) != rooted || check_components(&rooted).is_err() {
        return Err(misformatted(format!("unsafe fallback path {path:?}")));
    }
    Ok(dir.join(path))
}
