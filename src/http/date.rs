//! RFC 1123 dates for `Date`, `Last-Modified` and `If-Modified-Since`.

use std::time::SystemTime;

use chrono::{DateTime, Utc};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn format_http_date(when: SystemTime) -> String {
    let when: DateTime<Utc> = when.into();
    when.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP date. Only the preferred RFC 1123 form is accepted, which is
/// what every client sends back in conditional requests.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
