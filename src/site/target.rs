//! Mapping a normalized path onto a file in the site directory.

use std::fs::Metadata;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::ServeError;

/// Files tried, in order, when a directory is requested.
const INDEX_FILES: &[&str] = &["index.html", "index.cgi", "home", "index"];

/// Suffix of SCGI backend descriptor files.
pub const SCGI_SUFFIX: &str = ".scgi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Static,
    Cgi,
    Scgi,
}

/// A request path resolved to a file that may be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTarget {
    /// Canonical site directory
    pub site_dir: PathBuf,
    /// Canonical path of the file, always inside `site_dir`
    pub file: PathBuf,
    /// URI prefix that names the file (`SCRIPT_NAME`)
    pub script_name: String,
    /// Remaining URI components after the file (`PATH_INFO`), empty or starting with `/`
    pub path_info: String,
    pub kind: TargetKind,
}

impl ValidatedTarget {
    /// Directory holding the target file.
    pub fn dir(&self) -> &Path {
        self.file.parent().unwrap_or(&self.site_dir)
    }

    pub fn file_name(&self) -> &str {
        self.file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }
}

/// Outcome of resolving a path.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    Target(ValidatedTarget),
    /// A directory was requested without its trailing slash
    AddSlash(String),
}

/// Walks `path` (already normalized) from `site_dir`.
///
/// Directories are descended; the first regular file ends the walk and the
/// rest of the path becomes path-info.
pub fn resolve(site_dir: &Path, path: &str) -> Result<Resolution, ServeError> {
    let site_dir = site_dir.canonicalize().map_err(|_| ServeError::NotFound)?;
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

    let mut current = site_dir.clone();
    let mut script_name = String::new();

    for (i, component) in components.iter().enumerate() {
        current.push(component);
        script_name.push('/');
        script_name.push_str(component);

        let meta = std::fs::metadata(&current).map_err(|_| ServeError::NotFound)?;
        if meta.is_dir() {
            continue;
        }
        if !meta.is_file() {
            return Err(ServeError::NotFound);
        }

        let path_info = components[i + 1..]
            .iter()
            .fold(String::new(), |mut acc, c| {
                acc.push('/');
                acc.push_str(c);
                acc
            });
        // "/file/" keeps its trailing slash as path-info
        let path_info = if path_info.is_empty() && i + 1 == components.len() && path.ends_with('/') {
            "/".to_string()
        } else if !path_info.is_empty() && path.ends_with('/') {
            format!("{path_info}/")
        } else {
            path_info
        };

        return classify(&site_dir, current, &meta, script_name, path_info).map(Resolution::Target);
    }

    // The whole path named a directory.
    if !path.ends_with('/') {
        return Ok(Resolution::AddSlash(format!("{path}/")));
    }
    for index in INDEX_FILES {
        let candidate = current.join(index);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() {
                let script_name = format!("{script_name}/{index}");
                return classify(&site_dir, candidate, &meta, script_name, String::new())
                    .map(Resolution::Target);
            }
        }
    }
    Err(ServeError::NotFound)
}

fn classify(
    site_dir: &Path,
    file: PathBuf,
    meta: &Metadata,
    script_name: String,
    path_info: String,
) -> Result<ValidatedTarget, ServeError> {
    let file = file.canonicalize().map_err(|_| ServeError::NotFound)?;
    if !file.starts_with(site_dir) {
        tracing::warn!(file = %file.display(), "symlink leads outside the site directory");
        return Err(ServeError::Forbidden("outside site directory"));
    }

    let mode = meta.permissions().mode();
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let kind = if name.ends_with(SCGI_SUFFIX) {
        TargetKind::Scgi
    } else if mode & 0o111 != 0 {
        if mode & 0o002 != 0 {
            return Err(ServeError::Forbidden("world-writable program"));
        }
        TargetKind::Cgi
    } else {
        if !path_info.is_empty() {
            return Err(ServeError::NotFound);
        }
        TargetKind::Static
    };

    Ok(ValidatedTarget {
        site_dir: site_dir.to_path_buf(),
        file,
        script_name,
        path_info,
        kind,
    })
}
