//! URI path sanitizing and component rules.
//!
//! These checks run on the raw request path before anything touches the
//! filesystem. They keep requests inside the site directory and keep control
//! characters out of the CGI environment.

use crate::error::ServeError;

const WELL_KNOWN: &str = "/.well-known/";

/// Bytes allowed to appear verbatim in a request path.
const fn safe_table() -> [bool; 256] {
    let mut table = [false; 256];
    let mut b = 0;
    while b < 256 {
        let c = b as u8;
        table[b] = c.is_ascii_alphanumeric()
            || c == b','
            || c == b'-'
            || c == b'.'
            || c == b'/'
            || c == b':'
            || c == b'_'
            || c == b'~';
        b += 1;
    }
    table
}

static SAFE_BYTES: [bool; 256] = safe_table();

pub fn is_safe_byte(b: u8) -> bool {
    SAFE_BYTES[b as usize]
}

/// Replaces every byte outside the safe set, and not part of a `%HH` escape,
/// with `_`. Escapes are kept as-is and never decoded.
///
/// Idempotent: sanitizing an already sanitized path returns it unchanged.
pub fn sanitize(path: &[u8]) -> String {
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < path.len() {
        let b = path[i];
        if is_safe_byte(b) {
            out.push(b as char);
        } else if b == b'%'
            && i + 2 < path.len()
            && path[i + 1].is_ascii_hexdigit()
            && path[i + 2].is_ascii_hexdigit()
        {
            out.push('%');
            out.push(path[i + 1] as char);
            out.push(path[i + 2] as char);
            i += 2;
        } else {
            out.push('_');
        }
        i += 1;
    }
    out
}

/// Checks the component rules on a sanitized path.
///
/// Any non-empty component starting with `.` or `-` is refused. Under the
/// `/.well-known/` prefix, components may start with `.` or `-` but never `..`.
pub fn check_components(path: &str) -> Result<(), ServeError> {
    if !path.starts_with('/') {
        return Err(ServeError::NotFound);
    }
    let well_known = path.starts_with(WELL_KNOWN);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component.starts_with("..") {
            return Err(ServeError::NotFound);
        }
        if !well_known && (component.starts_with('.') || component.starts_with('-')) {
            return Err(ServeError::NotFound);
        }
    }
    Ok(())
}

/// Sanitizes and checks a request path in one step.
pub fn normalize(path: &str) -> Result<String, ServeError> {
    if !path.starts_with('/') {
        return Err(ServeError::NotFound);
    }
    let clean = sanitize(path.as_bytes());
    check_components(&clean)?;
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_at_end_of_input() {
        assert_eq!(sanitize(b"/a%4"), "/a_4");
        assert_eq!(sanitize(b"/a%41"), "/a%41");
        assert_eq!(sanitize(b"/a%"), "/a_");
    }
}
