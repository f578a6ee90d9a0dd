//! Upstream connection and request forwarding
//!
//! This module connects to the SCGI backend named by a descriptor, forwards
//! the request in the SCGI envelope and relays the backend's response.

use std::io::Cursor;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

use crate::context::RequestContext;
use crate::error::ServeError;
use crate::handler::cgi::{CgiEnv, cgi_environment};
use crate::handler::cgi_output;
use crate::handler::static_file::{CachePolicy, serve_file};
use crate::http::response::{Body, Response};
use crate::proxy::descriptor::ScgiBackendSpec;
use crate::site::{Site, ValidatedTarget};

/// Time allowed for a TCP connect to the backend.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between launching a relight command and the single retry.
const RELIGHT_DELAY: Duration = Duration::from_secs(1);

/// Forwards requests to SCGI backends.
#[derive(Debug, Clone)]
pub struct ScgiProxy {
    /// Connection timeout duration
    connection_timeout: Duration,

    /// Wait after relighting before retrying
    relight_delay: Duration,
}

impl Default for ScgiProxy {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT, RELIGHT_DELAY)
    }
}

impl ScgiProxy {
    pub fn new(connection_timeout: Duration, relight_delay: Duration) -> Self {
        Self {
            connection_timeout,
            relight_delay,
        }
    }

    /// Serves an SCGI target.
    ///
    /// On connection failure the relight command (if any) is launched, and the
    /// connection is retried exactly once. After that the fallback file is
    /// served, or the request fails with `BackendUnavailable`.
    pub async fn forward(
        &self,
        ctx: &RequestContext<'_>,
        site: &Site,
        target: &ValidatedTarget,
    ) -> Result<Response, ServeError> {
        let spec = ScgiBackendSpec::load(&target.file)?;

        let stream = match self.connect(&spec).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::warn!(backend = %spec.display_name(), error = %e, "SCGI backend unreachable");
                match &spec.relight {
                    Some(command) => {
                        self.relight(command, target.dir());
                        tokio::time::sleep(self.relight_delay).await;
                        match self.connect(&spec).await {
                            Ok(stream) => Some(stream),
                            Err(e) => {
                                tracing::warn!(
                                    backend = %spec.display_name(),
                                    error = %e,
                                    "SCGI backend still unreachable after relight"
                                );
                                None
                            }
                        }
                    }
                    None => None,
                }
            }
        };

        let Some(stream) = stream else {
            if let Some(fallback) = &spec.fallback {
                tracing::info!(backend = %spec.display_name(), fallback = %fallback.display(), "serving SCGI fallback");
                return serve_file(ctx, fallback, CachePolicy::NoCache).await;
            }
            return Err(ServeError::BackendUnavailable(spec.display_name()));
        };

        tracing::trace!(backend = %spec.display_name(), "connected to SCGI backend");
        let env = cgi_environment(ctx, site, target);
        self.send_request_and_receive_response(stream, &env, &ctx.request.body, &spec)
            .await
    }

    async fn connect(&self, spec: &ScgiBackendSpec) -> std::io::Result<TcpStream> {
        timeout(
            self.connection_timeout,
            TcpStream::connect((spec.host.as_str(), spec.port)),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))?
    }

    /// Launches the relight command detached: own session, no stdio, never awaited.
    fn relight(&self, command: &str, dir: &Path) {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
        }
        match cmd.spawn() {
            Ok(child) => tracing::info!(command, pid = ?child.id(), "relight command launched"),
            Err(e) => tracing::error!(command, error = %e, "relight command failed to start"),
        }
    }

    /// Send request to backend and receive response
    async fn send_request_and_receive_response(
        &self,
        mut stream: TcpStream,
        env: &CgiEnv,
        body: &[u8],
        spec: &ScgiBackendSpec,
    ) -> Result<Response, ServeError> {
        let request_bytes = build_scgi_request(env, body);
        let unavailable = |e: std::io::Error| {
            tracing::warn!(backend = %spec.display_name(), error = %e, "SCGI exchange failed");
            ServeError::BackendUnavailable(spec.display_name())
        };
        stream.write_all(&request_bytes).await.map_err(unavailable)?;
        stream.flush().await.map_err(unavailable)?;

        tracing::trace!("request sent to SCGI backend");

        let mut head = cgi_output::read_cgi_head(&mut stream).await.map_err(|e| {
            tracing::warn!(backend = %spec.display_name(), error = ?e, "bad SCGI response");
            ServeError::BackendUnavailable(spec.display_name())
        })?;

        let leftover = Cursor::new(std::mem::take(&mut head.leftover));
        let body = Body::Stream(Box::new(leftover.chain(stream)));
        Ok(cgi_output::into_response(head, body))
    }
}

/// Encodes a request in the SCGI envelope: a netstring of NUL-separated
/// header pairs, `CONTENT_LENGTH` first and `SCGI=1` second, followed by the body.
pub fn build_scgi_request(env: &CgiEnv, body: &[u8]) -> Vec<u8> {
    let mut headers = Vec::new();
    let mut push = |name: &str, value: &str| {
        headers.extend_from_slice(name.as_bytes());
        headers.push(0);
        headers.extend_from_slice(value.as_bytes());
        headers.push(0);
    };

    push("CONTENT_LENGTH", &body.len().to_string());
    push("SCGI", "1");
    for (name, value) in env.iter() {
        if name != "CONTENT_LENGTH" && name != "SCGI" {
            push(name, value);
        }
    }

    let mut buffer = format!("{}:", headers.len()).into_bytes();
    buffer.extend_from_slice(&headers);
    buffer.push(b',');
    buffer.extend_from_slice(body);
    buffer
}
