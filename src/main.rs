//! respgate - TCP Front-End for a RESP Key-Value Server
//!
//! This is the main entry point. It loads configuration, sets up logging,
//! picks the connection handler and serves until a termination signal.

use anyhow::Context;
use respgate::config::{Config, HandlerKind, LoggingConfig};
use respgate::connection::{EchoHandler, Handler, HandlerOptions, Reflect, RespHandler};
use respgate::server::Server;
use std::fs::{self, OpenOptions};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: stdout, plus a dated log file when a log
/// directory is configured. `RUST_LOG` overrides the configured level.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.file_path(chrono::Local::now().date_naive()) {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;

            builder
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .try_init()
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        None => builder.try_init().map_err(|e| anyhow::anyhow!(e))?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_logging(&config.logging)?;

    info!(
        version = respgate::VERSION,
        address = %config.server.address,
        handler = ?config.server.handler,
        max_connections = config.server.max_connections,
        idle_timeout_secs = config.server.idle_timeout.as_secs(),
        drain_timeout_secs = config.server.drain_timeout.as_secs(),
        "Starting respgate"
    );

    let options = HandlerOptions::from(&config.server);
    let handler: Arc<dyn Handler> = match config.server.handler {
        HandlerKind::Echo => Arc::new(EchoHandler::new(options)),
        HandlerKind::Resp => Arc::new(RespHandler::new(Reflect, options)),
    };

    Server::new(config.server, handler)
        .run_with_signal()
        .await
        .context("server failed")?;

    info!("Server shutdown complete");
    Ok(())
}
