//! Path & host validation.
//!
//! Everything in here runs before the first filesystem access made on behalf
//! of a request:
//!
//! 1. [`path`] sanitizes the URI path and refuses hidden or option-like components.
//! 2. [`vhost`] picks the site directory from the `Host` header.
//! 3. [`target`] walks the path inside the site and classifies the file.
//! 4. [`auth`] applies any `-auth` descriptor next to the target.

pub mod auth;
pub mod path;
pub mod target;
pub mod vhost;

use crate::config::ServerConfig;
use crate::error::ServeError;
use crate::http::request::Request;

pub use target::{Resolution, TargetKind, ValidatedTarget};
pub use vhost::Site;

/// Validates `request` and resolves it to a target in its site.
pub fn validate(config: &ServerConfig, request: &Request) -> Result<(Site, Resolution), ServeError> {
    let clean = path::normalize(&request.path)?;
    let site = vhost::select_site(config, request.host())?;
    let resolution = target::resolve(&site.dir, &clean)?;
    Ok((site, resolution))
}
