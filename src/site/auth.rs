//! `-auth` access descriptors.
//!
//! A file named `-auth` next to a target restricts access to everything in that
//! directory. Its name begins with `-`, so it can never be fetched by URL.
//!
//! ```text
//! # comment
//! http-redirect            plain-HTTP requests are redirected to https://
//! https-only               plain-HTTP requests get 404
//! realm Members Area       realm shown in the Basic-Auth challenge
//! user alice alice:s3cret  NAME LOGIN:PASSWORD; NAME becomes REMOTE_USER
//! anyone                   no credentials required
//! ```

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::ServeError;
use crate::http::request::Request;

pub const AUTH_FILE: &str = "-auth";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credential {
    name: String,
    login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthPolicy {
    pub http_redirect: bool,
    pub https_only: bool,
    pub anyone: bool,
    pub realm: String,
    users: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow { remote_user: Option<String> },
    /// Send the client to this https:// URL
    Redirect(String),
    /// Answer 401 with a Basic challenge for this realm
    Challenge(String),
}

impl AuthPolicy {
    pub fn parse(text: &str) -> Result<Self, ServeError> {
        let mut policy = AuthPolicy {
            realm: "unknown realm".to_string(),
            ..Default::default()
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = line
                .split_once(char::is_whitespace)
                .map(|(k, r)| (k, r.trim()))
                .unwrap_or((line, ""));
            match keyword {
                "http-redirect" => policy.http_redirect = true,
                "https-only" => policy.https_only = true,
                "anyone" => policy.anyone = true,
                "realm" if !rest.is_empty() => policy.realm = rest.replace('"', ""),
                "user" => {
                    let (name, login) = rest
                        .split_once(char::is_whitespace)
                        .map(|(n, l)| (n, l.trim()))
                        .filter(|(_, l)| l.contains(':'))
                        .ok_or_else(|| {
                            ServeError::ExecutionFailure(format!("bad -auth line: {line}"))
                        })?;
                    policy.users.push(Credential {
                        name: name.to_string(),
                        login: login.to_string(),
                    });
                }
                _ => {
                    return Err(ServeError::ExecutionFailure(format!(
                        "unknown -auth keyword: {keyword}"
                    )));
                }
            }
        }
        Ok(policy)
    }

    /// Reads the `-auth` file of `dir`, if there is one.
    pub fn load(dir: &Path) -> Result<Option<Self>, ServeError> {
        match std::fs::read_to_string(dir.join(AUTH_FILE)) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServeError::ExecutionFailure(format!("cannot read -auth: {e}"))),
        }
    }

    /// Decides whether `request` may proceed.
    ///
    /// `https` says whether the request arrived over TLS; `host` and the request
    /// URI are used to build the redirect target.
    pub fn check(&self, request: &Request, https: bool, host: &str) -> Result<AuthOutcome, ServeError> {
        if !https {
            if self.http_redirect {
                return Ok(AuthOutcome::Redirect(format!("https://{}{}", host, request.uri)));
            }
            if self.https_only {
                return Err(ServeError::NotFound);
            }
        }

        if let Some(login) = basic_credentials(request) {
            if let Some(user) = self
                .users
                .iter()
                .find(|u| constant_time_eq(u.login.as_bytes(), login.as_bytes()))
            {
                return Ok(AuthOutcome::Allow {
                    remote_user: Some(user.name.clone()),
                });
            }
        }

        if self.anyone {
            return Ok(AuthOutcome::Allow { remote_user: None });
        }
        Ok(AuthOutcome::Challenge(self.realm.clone()))
    }
}

/// Decoded `LOGIN:PASSWORD` from an `Authorization: Basic` header.
fn basic_credentials(request: &Request) -> Option<String> {
    let value = request.authorization()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
