//! CPU budgets, resource usage, and process-wide statistics.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::resource::{Resource, UsageWho, getrusage, setrlimit};
use nix::sys::signal::Signal;
use nix::sys::time::TimeVal;

/// Time allowed to receive a complete header section.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allowed to receive the request body.
pub const BODY_TIMEOUT: Duration = Duration::from_secs(30);

/// Applies a CPU budget to the calling process: `SIGXCPU` at `secs`, `SIGKILL`
/// one second later. Also used from `pre_exec` in CGI children.
pub fn limit_cpu(secs: u64) -> nix::Result<()> {
    setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)
}

/// True when a child was terminated by its CPU limit.
pub fn cpu_exhausted(status: &ExitStatus) -> bool {
    matches!(
        status.signal(),
        Some(sig) if sig == Signal::SIGXCPU as i32 || sig == Signal::SIGKILL as i32
    )
}

fn timeval_duration(tv: TimeVal) -> Duration {
    Duration::from_secs(tv.tv_sec().max(0) as u64) + Duration::from_micros(tv.tv_usec().max(0) as u64)
}

/// User plus system CPU time consumed so far by this process and its reaped
/// children. Request CPU time is the difference between two readings.
pub fn cpu_time() -> Duration {
    [UsageWho::RUSAGE_SELF, UsageWho::RUSAGE_CHILDREN]
        .into_iter()
        .filter_map(|who| getrusage(who).ok())
        .map(|usage| timeval_duration(usage.user_time()) + timeval_duration(usage.system_time()))
        .sum()
}

/// Counters kept for the lifetime of the process, reported at shutdown.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicU64,
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl ServerStats {
    pub fn record_request(&self, bytes_in: u64, bytes_out: u64, failed: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn report(&self) {
        tracing::info!(
            connections = self.connections.load(Ordering::Relaxed),
            requests = self.requests.load(Ordering::Relaxed),
            failures = self.failures.load(Ordering::Relaxed),
            bytes_in = self.bytes_in.load(Ordering::Relaxed),
            bytes_out = self.bytes_out.load(Ordering::Relaxed),
            cpu_ms = cpu_time().as_millis() as u64,
            "server statistics"
        );
    }
}
