//! Access log.
//!
//! One entry per request, written after the response has been sent. The log
//! path may contain strftime placeholders (`/var/log/site-%Y%m%d.log`), which
//! are expanded for every entry so that files rotate by name. Without a log
//! path, entries are emitted as `tracing` events with target `access`.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::config::{LogFormat, ServerConfig};

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client: String,
    pub method: String,
    pub url: String,
    pub protocol: String,
    pub host: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub remote_user: Option<String>,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cpu_ms: u64,
    pub wall_us: u64,
    /// `ok`, or the kind of failure
    pub outcome: String,
}

impl LogEntry {
    /// JSON object on a single line.
    pub fn to_structured(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"error\":\"unserializable log entry: {}\"}}", e)
        })
    }

    /// NCSA combined log format.
    pub fn to_combined(&self) -> String {
        format!(
            "{} - {} [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.client,
            self.remote_user.as_deref().unwrap_or("-"),
            self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.url,
            self.protocol,
            self.status,
            if self.bytes_out == 0 { "-".to_string() } else { self.bytes_out.to_string() },
            combined_field(self.referer.as_deref()),
            combined_field(self.user_agent.as_deref()),
        )
    }

    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Structured => self.to_structured(),
            LogFormat::Combined => self.to_combined(),
        }
    }
}

fn combined_field(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.replace('\\', "\\\\").replace('"', "\\\""),
        _ => "-".to_string(),
    }
}

/// Expands strftime placeholders in a log path for the given instant.
///
/// Paths were validated at startup; should formatting fail anyway, the
/// template is used verbatim.
pub fn expand_path(template: &str, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    match write!(out, "{}", now.format(template)) {
        Ok(()) => out,
        Err(_) => template.to_string(),
    }
}

/// Destination and shape of the access log.
#[derive(Debug, Clone)]
pub struct AccessLog {
    path: Option<String>,
    format: LogFormat,
}

impl AccessLog {
    pub fn new(path: Option<String>, format: LogFormat) -> Self {
        Self { path, format }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.log_file.clone(), config.log_format)
    }

    /// Appends one entry. Failures are reported through tracing and otherwise ignored.
    pub async fn write(&self, entry: &LogEntry) {
        let line = entry.render(self.format);
        let Some(template) = &self.path else {
            tracing::info!(target: "access", "{}", line);
            return;
        };

        let path = expand_path(template, entry.timestamp);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(format!("{line}\n").as_bytes()).await?;
            // tokio's File completes the write on the blocking pool; wait for it.
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(path = %path, error = %e, "failed to write access log entry");
        }
    }
}

/// The request currently being served, kept where a process-level CPU limit
/// handler can still log it after the connection task stops making progress.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<Mutex<Option<(LogEntry, Instant)>>>);

impl InFlight {
    /// Records the entry to log should the process be stopped mid-request.
    pub fn begin(&self, entry: LogEntry) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some((entry, Instant::now()));
        }
    }

    pub fn finish(&self) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = None;
        }
    }

    /// Takes the pending entry, stamped with the current time and the given
    /// CPU usage. `None` when no request is in flight.
    pub fn take(&self, cpu_ms: u64) -> Option<LogEntry> {
        let (mut entry, started) = self.0.lock().ok()?.take()?;
        entry.timestamp = Utc::now();
        entry.cpu_ms = cpu_ms;
        entry.wall_us = entry.wall_us.saturating_add(started.elapsed().as_micros() as u64);
        Some(entry)
    }
}
