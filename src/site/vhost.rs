//! Virtual host selection.

use std::path::PathBuf;

use url::Host;

use crate::config::ServerConfig;
use crate::error::ServeError;

const DEFAULT_SITE: &str = "default";
const SITE_SUFFIX: &str = ".website";

/// The directory a request will be served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub dir: PathBuf,
    /// Host name as sent by the client, without port (for `SERVER_NAME`)
    pub server_name: String,
}

/// Turns a `Host` header value into the name used for `NAME.website`.
///
/// Returns `Ok(None)` for hosts that can only ever map to the default site
/// (IPv6 literals), and `UnknownHost` for anything that is not a plain host name.
pub fn site_name(host_header: &str) -> Result<Option<String>, ServeError> {
    let unknown = || ServeError::UnknownHost(host_header.to_string());
    let host_header = host_header.trim();
    if host_header.is_empty() || host_header.len() > 255 {
        return Err(unknown());
    }

    let host = if host_header.starts_with('[') {
        let end = host_header.find(']').ok_or_else(unknown)?;
        let rest = &host_header[end + 1..];
        if !rest.is_empty() && !is_port_suffix(rest) {
            return Err(unknown());
        }
        &host_header[..=end]
    } else {
        match host_header.rsplit_once(':') {
            Some((name, port)) if is_port_suffix(&format!(":{port}")) => name,
            Some(_) => return Err(unknown()),
            None => host_header,
        }
    };

    let name = match Host::parse(host).map_err(|_| unknown())? {
        Host::Ipv6(_) => return Ok(None),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Domain(domain) => domain.to_ascii_lowercase(),
    };

    let safe = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_');
    if !safe || name.starts_with('.') || name.starts_with('-') || name.contains("..") {
        return Err(unknown());
    }
    Ok(Some(name))
}

fn is_port_suffix(s: &str) -> bool {
    s.strip_prefix(':')
        .map(|p| !p.is_empty() && p.len() <= 5 && p.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Picks the site directory for a request.
///
/// Lookup order is `{root}/{host}.website`, then `{root}/default.website`, then
/// in standalone mode the root directory itself (the working directory once
/// startup has changed into it).
pub fn select_site(config: &ServerConfig, host_header: Option<&str>) -> Result<Site, ServeError> {
    let (name, server_name) = match host_header {
        Some(h) => {
            let name = site_name(h)?;
            let server_name = h.rsplit_once(':')
                .filter(|(_, port)| port.bytes().all(|b| b.is_ascii_digit()))
                .map(|(n, _)| n)
                .unwrap_or(h)
                .to_string();
            (name, server_name)
        }
        None => (None, String::new()),
    };

    if let Some(name) = &name {
        let dir = config.root.join(format!("{name}{SITE_SUFFIX}"));
        if dir.is_dir() {
            return Ok(Site { dir, server_name });
        }
    }

    let dir = config.root.join(format!("{DEFAULT_SITE}{SITE_SUFFIX}"));
    if dir.is_dir() {
        return Ok(Site { dir, server_name });
    }

    if config.standalone() && config.root.is_dir() {
        return Ok(Site {
            dir: config.root.clone(),
            server_name,
        });
    }

    tracing::debug!(host = ?host_header, "no site directory for host");
    Err(ServeError::NotFound)
}
