use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

use crate::access_log::{AccessLog, InFlight, LogEntry};
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::error::{Budget, ServeError};
use crate::handler;
use crate::http::parser::{ParseError, parse_request_head};
use crate::http::request::Request;
use crate::http::response::StatusCode;
use crate::http::writer::{ResponseWriter, WriteError, WriteProgress, is_close_delimited};
use crate::server::limits::{self, BODY_TIMEOUT, HEADER_TIMEOUT, ServerStats};

/// Requests served on one connection before it is closed.
pub const MAX_REQUESTS_PER_CONNECTION: usize = 100;

/// Resource usage of the request in flight.
#[derive(Debug, Clone, Copy)]
pub struct Meter {
    started: Instant,
    cpu_start: Duration,
    bytes_in: u64,
}

impl Meter {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            cpu_start: limits::cpu_time(),
            bytes_in: 0,
        }
    }
}

/// Per-request pipeline state.
pub enum ConnectionState {
    Reading,
    Processing(Request, Meter),
    /// The request could not be read; answer (unless timed out) and close
    Rejecting(ServeError, Meter, Option<Request>),
    Logging(LogEntry, bool), // bool = keep_alive?
    Closed,
}

enum ReadOutcome {
    Request(Request, Meter),
    Closed,
    Failed(ServeError, Meter, Option<Request>),
}

/// One client connection, served request by request.
///
/// Generic over the transport so the same pipeline runs on an accepted TCP
/// socket, an inherited stdin/stdout pair, or an in-memory duplex in tests.
pub struct Connection<S> {
    stream: S,
    buffer: Vec<u8>,
    state: ConnectionState,
    config: Arc<ServerConfig>,
    peer: Option<SocketAddr>,
    local_port: Option<u16>,
    access_log: AccessLog,
    stats: Arc<ServerStats>,
    in_flight: Option<InFlight>,
    served: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        stream: S,
        config: Arc<ServerConfig>,
        peer: Option<SocketAddr>,
        local_port: Option<u16>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let access_log = AccessLog::from_config(&config);
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            config,
            peer,
            local_port,
            access_log,
            stats,
            in_flight: None,
            served: 0,
        }
    }

    /// Publishes each request to `slot` while it is being processed.
    pub fn track_in_flight(mut self, slot: InFlight) -> Self {
        self.in_flight = Some(slot);
        self
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await {
                        ReadOutcome::Request(req, meter) => ConnectionState::Processing(req, meter),
                        ReadOutcome::Closed => ConnectionState::Closed,
                        ReadOutcome::Failed(err, meter, req) => {
                            ConnectionState::Rejecting(err, meter, req)
                        }
                    };
                }

                ConnectionState::Processing(req, meter) => {
                    let (entry, keep_alive) = self.process(req, meter).await;
                    self.state = ConnectionState::Logging(entry, keep_alive);
                }

                ConnectionState::Rejecting(err, meter, req) => {
                    let entry = self.reject(err, meter, req).await;
                    self.state = ConnectionState::Logging(entry, false);
                }

                ConnectionState::Logging(entry, keep_alive) => {
                    if let Some(slot) = &self.in_flight {
                        slot.finish();
                    }
                    self.served += 1;
                    self.stats
                        .record_request(entry.bytes_in, entry.bytes_out, entry.outcome != "ok");
                    self.access_log.write(&entry).await;

                    if keep_alive && self.served < MAX_REQUESTS_PER_CONNECTION {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        let _ = self.stream.shutdown().await;
        Ok(())
    }

    /// Reads one request head and its body.
    async fn read_request(&mut self) -> ReadOutcome {
        let header_deadline = Instant::now() + HEADER_TIMEOUT;
        let mut meter = (!self.buffer.is_empty()).then(Meter::start);

        let (mut request, consumed) = loop {
            // Try parsing whatever we already have
            match parse_request_head(&self.buffer, self.config.max_content_length) {
                Ok(parsed) => break parsed,
                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }
                Err(e) => {
                    tracing::debug!(peer = ?self.peer, error = ?e, "rejecting malformed request");
                    let meter = meter.unwrap_or_else(Meter::start);
                    let meter = Meter { bytes_in: self.buffer.len() as u64, ..meter };
                    return ReadOutcome::Failed(e.into(), meter, None);
                }
            }

            // Read more data
            let mut temp = [0u8; 4096];
            let n = match self.read_with_deadline(&mut temp, header_deadline).await {
                Ok(Some(n)) => n,
                Ok(None) if self.buffer.is_empty() => return ReadOutcome::Closed,
                Ok(None) => {
                    let meter = meter.unwrap_or_else(Meter::start);
                    let meter = Meter { bytes_in: self.buffer.len() as u64, ..meter };
                    return ReadOutcome::Failed(ServeError::ResourceExceeded(Budget::InputTimeout), meter, None);
                }
                Err(e) => {
                    tracing::debug!(peer = ?self.peer, error = %e, "read failed");
                    return ReadOutcome::Closed;
                }
            };

            if n == 0 {
                // Client closed connection
                if self.buffer.is_empty() {
                    return ReadOutcome::Closed;
                }
                let meter = meter.unwrap_or_else(Meter::start);
                let meter = Meter { bytes_in: self.buffer.len() as u64, ..meter };
                return ReadOutcome::Failed(ServeError::MalformedRequest("truncated request"), meter, None);
            }

            if meter.is_none() {
                meter = Some(Meter::start());
            }
            self.buffer.extend_from_slice(&temp[..n]);
        };

        self.buffer.drain(..consumed);
        let mut meter = meter.unwrap_or_else(Meter::start);
        meter.bytes_in = consumed as u64;

        let length = request.content_length() as usize;
        if length > 0 {
            if self.buffer.len() < length && is_expect_continue(&request) {
                if let Err(e) = self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await {
                    tracing::debug!(error = %e, "failed to send 100 Continue");
                    return ReadOutcome::Closed;
                }
            }

            let body_deadline = Instant::now() + BODY_TIMEOUT;
            while self.buffer.len() < length {
                let mut temp = [0u8; 8192];
                match self.read_with_deadline(&mut temp, body_deadline).await {
                    Ok(Some(0)) => {
                        meter.bytes_in += self.buffer.len() as u64;
                        return ReadOutcome::Failed(
                            ServeError::MalformedRequest("truncated body"),
                            meter,
                            Some(request),
                        );
                    }
                    Ok(Some(n)) => self.buffer.extend_from_slice(&temp[..n]),
                    Ok(None) => {
                        meter.bytes_in += self.buffer.len() as u64;
                        return ReadOutcome::Failed(
                            ServeError::ResourceExceeded(Budget::InputTimeout),
                            meter,
                            Some(request),
                        );
                    }
                    Err(e) => {
                        tracing::debug!(peer = ?self.peer, error = %e, "read failed");
                        return ReadOutcome::Closed;
                    }
                }
            }
            request.body = self.buffer.drain(..length).collect();
            meter.bytes_in += length as u64;
        }

        ReadOutcome::Request(request, meter)
    }

    /// Reads with the input timeout; `Ok(None)` means the deadline passed.
    async fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> std::io::Result<Option<usize>> {
        if self.config.debug {
            return self.stream.read(buf).await.map(Some);
        }
        match timeout_at(deadline, self.stream.read(buf)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Routes a request, writes the response, and describes the result for the log.
    async fn process(&mut self, request: Request, meter: Meter) -> (LogEntry, bool) {
        if let Some(slot) = &self.in_flight {
            let exceeded = ServeError::ResourceExceeded(Budget::Cpu);
            slot.begin(self.log_entry(Some(&request), None, exceeded.status().as_u16(), &meter, 0, exceeded.kind()));
        }
        let config = Arc::clone(&self.config);
        let mut keep_alive = request.keep_alive();
        let head_only = request.is_head();
        let mut ctx = RequestContext::new(&config, request, self.peer, self.local_port);

        let deadline = Instant::now() + config.response_timeout;
        let (response, failure) = match timeout_at(deadline, handler::route(&mut ctx)).await {
            Ok(Ok(response)) => (response, None),
            Ok(Err(err)) => (err.to_response(), Some(err)),
            Err(_) => {
                let err = ServeError::ResourceExceeded(Budget::WallClock);
                (err.to_response(), Some(err))
            }
        };

        if let Some(err) = &failure {
            if err.status().as_u16() >= 500 {
                tracing::warn!(uri = %ctx.request.uri, error = %err, "request failed");
                keep_alive = false;
            } else {
                tracing::debug!(uri = %ctx.request.uri, error = %err, "request refused");
            }
        }
        if is_close_delimited(&response) {
            keep_alive = false;
        }
        keep_alive = keep_alive && self.served + 1 < MAX_REQUESTS_PER_CONNECTION;

        let mut status = response.status;
        let writer = ResponseWriter::new(&response, keep_alive, head_only);
        let mut progress = WriteProgress::default();
        let written = timeout_at(
            deadline,
            writer.write_to_stream(&mut self.stream, response.body, &mut progress),
        )
        .await;

        let outcome = match (written, &failure) {
            (Ok(Ok(())), None) => "ok",
            (Ok(Ok(())), Some(err)) => err.kind(),
            (Ok(Err(WriteError::Program(err))), _) => {
                tracing::warn!(uri = %ctx.request.uri, error = %err, "response aborted");
                keep_alive = false;
                if let ServeError::ResourceExceeded(_) = err {
                    status = err.status();
                }
                err.kind()
            }
            (Ok(Err(WriteError::Client(e))), _) => {
                tracing::debug!(uri = %ctx.request.uri, error = %e, "client went away");
                keep_alive = false;
                "ClientAborted"
            }
            (Err(_), _) => {
                tracing::warn!(uri = %ctx.request.uri, "response deadline passed while writing");
                keep_alive = false;
                status = StatusCode::GatewayTimeout;
                ServeError::ResourceExceeded(Budget::WallClock).kind()
            }
        };

        let entry = self.log_entry(
            Some(&ctx.request),
            ctx.remote_user.clone(),
            status.as_u16(),
            &meter,
            progress.bytes,
            outcome,
        );
        (entry, keep_alive)
    }

    /// Handles a request that could not be read completely.
    async fn reject(&mut self, err: ServeError, meter: Meter, request: Option<Request>) -> LogEntry {
        let mut bytes_out = 0;
        if err.status() != StatusCode::RequestTimeout {
            // An input timeout aborts without a response.
            let response = err.to_response();
            let writer = ResponseWriter::new(&response, false, false);
            let mut progress = WriteProgress::default();
            let write = writer.write_to_stream(&mut self.stream, response.body, &mut progress);
            if let Err(e) = tokio::time::timeout(BODY_TIMEOUT, write).await.unwrap_or(Ok(())) {
                tracing::debug!(error = %e, "failed to send error response");
            }
            bytes_out = progress.bytes;
        } else {
            tracing::info!(peer = ?self.peer, "input timeout");
        }
        self.log_entry(request.as_ref(), None, err.status().as_u16(), &meter, bytes_out, err.kind())
    }

    fn log_entry(
        &self,
        request: Option<&Request>,
        remote_user: Option<String>,
        status: u16,
        meter: &Meter,
        bytes_out: u64,
        outcome: &str,
    ) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            client: self
                .peer
                .map(|p| p.ip().to_canonical().to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            method: request.map(|r| r.method.as_str().to_string()).unwrap_or_else(|| "-".into()),
            url: request.map(|r| r.uri.clone()).unwrap_or_else(|| "-".into()),
            protocol: request.map(|r| r.version.clone()).unwrap_or_else(|| "-".into()),
            host: request.and_then(|r| r.host()).map(str::to_string),
            referer: request.and_then(|r| r.referer()).map(str::to_string),
            user_agent: request.and_then(|r| r.user_agent()).map(str::to_string),
            remote_user,
            status,
            bytes_in: meter.bytes_in,
            bytes_out,
            cpu_ms: limits::cpu_time().saturating_sub(meter.cpu_start).as_millis() as u64,
            wall_us: meter.started.elapsed().as_micros() as u64,
            outcome: outcome.to_string(),
        }
    }
}

fn is_expect_continue(request: &Request) -> bool {
    request.version != "HTTP/1.0"
        && request
            .header("Expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
}
