use std::io;
use std::mem::ManuallyDrop;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::FromRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use anyhow::Context as _;
use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, Stdin, Stdout};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::access_log::{AccessLog, InFlight};
use crate::config::ServerConfig;
use crate::http::connection::Connection;
use crate::server::limits::{self, ServerStats};

/// Binds the standalone listening socket. Runs before privileges are dropped
/// and before the runtime exists.
pub fn bind(addr: SocketAddr) -> anyhow::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr).with_context(|| format!("cannot bind {addr}"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accepts connections until Ctrl-C, serving each on its own task.
pub async fn run(listener: std::net::TcpListener, config: Arc<ServerConfig>) -> anyhow::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    info!(addr = %listener.local_addr()?, root = %config.root.display(), "listening");

    let stats = Arc::new(ServerStats::default());
    let permits = Arc::new(Semaphore::new(config.max_connections));

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => permit?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        };

        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        };
        debug!(%peer, "accepted connection");
        stats.connections.fetch_add(1, Ordering::Relaxed);

        let local_port = socket.local_addr().ok().map(|a| a.port());
        let config = Arc::clone(&config);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, config, Some(peer), local_port, stats);
            if let Err(e) = conn.run().await {
                error!(%peer, error = %e, "connection error");
            }
            drop(permit);
        });
    }

    stats.report();
    Ok(())
}

/// Serves the single connection this process was started for, on fd 0 or on
/// the stdin/stdout pair.
pub async fn serve_inherited(config: Arc<ServerConfig>) -> anyhow::Result<()> {
    let stats = Arc::new(ServerStats::default());
    stats.connections.fetch_add(1, Ordering::Relaxed);

    let in_flight = InFlight::default();
    if config.max_cpu > 0 {
        limits::limit_cpu(config.max_cpu).context("cannot set CPU limit")?;
        let mut xcpu = signal(SignalKind::from_raw(Signal::SIGXCPU as i32))?;
        let in_flight = in_flight.clone();
        let access_log = AccessLog::from_config(&config);
        tokio::spawn(async move {
            if xcpu.recv().await.is_some() {
                error!(outcome = "ResourceExceeded", "CPU budget exhausted, exiting");
                if let Some(entry) = in_flight.take(limits::cpu_time().as_millis() as u64) {
                    access_log.write(&entry).await;
                }
                std::process::exit(1);
            }
        });
    }

    match adopt_socket()? {
        Some(socket) => {
            let peer = socket.peer_addr().ok();
            let local_port = socket.local_addr().ok().map(|a| a.port());
            let mut conn = Connection::new(socket, config, peer, local_port, stats).track_in_flight(in_flight);
            conn.run().await
        }
        None => {
            let peer = env_peer();
            let stream = StdioStream { stdin: tokio::io::stdin(), stdout: tokio::io::stdout() };
            let mut conn = Connection::new(stream, config, peer, None, stats).track_in_flight(in_flight);
            conn.run().await
        }
    }
}

/// Takes fd 0 as a TCP stream when it is a connected socket.
fn adopt_socket() -> anyhow::Result<Option<TcpStream>> {
    // SAFETY: fd 0 stays open for the whole process; the probe never closes it.
    let probe = ManuallyDrop::new(unsafe { std::net::TcpStream::from_raw_fd(0) });
    if probe.peer_addr().is_err() {
        return Ok(None);
    }
    // SAFETY: fd 0 is a connected socket and nothing else owns it from here on.
    let socket = unsafe { std::net::TcpStream::from_raw_fd(0) };
    socket.set_nonblocking(true)?;
    Ok(Some(TcpStream::from_std(socket)?))
}

/// Client address handed down by a launcher that kept the socket to itself.
fn env_peer() -> Option<SocketAddr> {
    let ip: IpAddr = std::env::var("REMOTE_ADDR").ok()?.parse().ok()?;
    let port = std::env::var("REMOTE_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(SocketAddr::new(ip, port))
}

/// stdin and stdout as one duplex stream.
pub struct StdioStream {
    stdin: Stdin,
    stdout: Stdout,
}

impl AsyncRead for StdioStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}
