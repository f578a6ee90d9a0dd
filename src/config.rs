use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::format::{Item, StrftimeItems};
use clap::{Parser, ValueEnum};

pub const SERVER_SOFTWARE: &str = concat!("citadel/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
    /// Dual-stack wildcard where the OS supports it
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per request
    Structured,
    /// NCSA combined log format
    Combined,
}

/// Command line of the server. There is no configuration file.
#[derive(Debug, Parser)]
#[command(name = "citadel", version, about = "Small static/CGI/SCGI web server")]
pub struct Cli {
    /// Directory holding the *.website virtual host directories
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Listen on this port; without it a single connection is served on stdin/stdout
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long, value_enum, default_value_t = AddressFamily::Any)]
    pub family: AddressFamily,

    /// Run as this user (default: owner of the root directory)
    #[arg(long)]
    pub user: Option<String>,

    /// Access log path; strftime placeholders are expanded per entry
    #[arg(long)]
    pub logfile: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Structured)]
    pub log_format: LogFormat,

    /// TLS is terminated by an upstream proxy
    #[arg(long)]
    pub https: bool,

    /// Confine the process to the root directory when started as root
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub jail: bool,

    /// Cache-Control max-age for static content, in seconds
    #[arg(long, default_value_t = 120)]
    pub max_age: u64,

    /// CPU seconds allowed per CGI program (0 disables the limit)
    #[arg(long, default_value_t = 30)]
    pub max_cpu: u64,

    /// Wall-clock seconds allowed to produce and send one response
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    #[arg(long, default_value_t = 250_000_000)]
    pub max_content_length: u64,

    /// Concurrent connections in standalone mode
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Disable input timeouts and log at debug level
    #[arg(long)]
    pub debug: bool,
}

/// Process-wide settings, fixed once startup completes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub port: Option<u16>,
    pub family: AddressFamily,
    pub user: Option<String>,
    pub log_file: Option<String>,
    pub log_format: LogFormat,
    pub https: bool,
    pub jail: bool,
    pub max_age: u64,
    pub max_cpu: u64,
    pub response_timeout: Duration,
    pub max_content_length: u64,
    pub max_connections: usize,
    pub debug: bool,
}

impl ServerConfig {
    /// Defaults for serving `root`, as if started with no other options.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            port: None,
            family: AddressFamily::Any,
            user: None,
            log_file: None,
            log_format: LogFormat::Structured,
            https: false,
            jail: true,
            max_age: 120,
            max_cpu: 30,
            response_timeout: Duration::from_secs(60),
            max_content_length: 250_000_000,
            max_connections: 1000,
            debug: false,
        }
    }

    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if let Some(path) = &cli.logfile {
            validate_log_path(path)?;
        }
        if cli.max_connections == 0 {
            bail!("--max-connections must be at least 1");
        }
        if cli.timeout == 0 {
            bail!("--timeout must be at least 1 second");
        }
        let root = cli
            .root
            .canonicalize()
            .with_context(|| format!("cannot resolve root directory {}", cli.root.display()))?;
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }

        Ok(Self {
            root,
            port: cli.port,
            family: cli.family,
            user: cli.user,
            log_file: cli.logfile,
            log_format: cli.log_format,
            https: cli.https,
            jail: cli.jail,
            max_age: cli.max_age,
            max_cpu: cli.max_cpu,
            response_timeout: Duration::from_secs(cli.timeout),
            max_content_length: cli.max_content_length,
            max_connections: cli.max_connections,
            debug: cli.debug,
        })
    }

    /// Standalone mode listens on a port; otherwise one inherited connection is served.
    pub fn standalone(&self) -> bool {
        self.port.is_some()
    }

    pub fn bind_addr(&self) -> Option<SocketAddr> {
        let port = self.port?;
        let ip = match self.family {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 | AddressFamily::Any => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Some(SocketAddr::new(ip, port))
    }

    /// Replaces the root once confinement has changed what it looks like.
    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }
}

/// Rejects log paths containing strftime placeholders chrono does not know,
/// which would otherwise fail at every write.
pub fn validate_log_path(path: &str) -> anyhow::Result<()> {
    if path.is_empty() {
        bail!("--logfile must not be empty");
    }
    if StrftimeItems::new(path).any(|item| matches!(item, Item::Error)) {
        bail!("--logfile {:?} contains an invalid time placeholder", path);
    }
    Ok(())
}
