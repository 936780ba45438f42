//! advlock: advisory lock server
//!
//! Features:
//! - Named locks held for the lifetime of a TCP connection
//! - Immediate rejection of contended locks, no queueing
//! - Configuration via CLI arguments or TOML file
//! - Clean shutdown on SIGINT/SIGTERM

use advlock::{Config, Server, ServerHandle};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs::OpenOptions;
use std::sync::Mutex;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config)?;

    info!(
        address = %config.address,
        port = config.port,
        backlog = config.backlog,
        "Starting advlock server"
    );

    let mut server = Server::bind(&config).map_err(|e| {
        error!(error = %e, "Failed to start");
        e
    })?;

    spawn_signal_handler(server.handle())?;

    server.serve().map_err(|e| {
        error!(error = %e, "Server failed");
        e
    })?;

    Ok(())
}

fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

/// Stop the server on the first SIGINT or SIGTERM.
fn spawn_signal_handler(handle: ServerHandle) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Received signal, shutting down");
                handle.stop();
            }
        })?;

    Ok(())
}
