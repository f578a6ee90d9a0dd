use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use citadel::config::{Cli, ServerConfig};
use citadel::server::{listener, privilege};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };

    // stdout may be the client connection, so diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    match start(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn start(cli: Cli) -> anyhow::Result<()> {
    let config = ServerConfig::from_cli(cli)?;

    // Bind while still privileged, then confine before the runtime spawns threads.
    let socket = config.bind_addr().map(listener::bind).transpose()?;
    let config = Arc::new(privilege::confine(config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    match socket {
        Some(socket) => runtime.block_on(listener::run(socket, config))?,
        None => {
            runtime.block_on(listener::serve_inherited(config))?;
            // Blocking stdin reads cannot be cancelled; do not wait for them.
            runtime.shutdown_timeout(Duration::from_millis(100));
        }
    }
    Ok(())
}
