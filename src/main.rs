//! asyncer: TCP session server
//!
//! Accepts connections on the configured address and decodes
//! length-prefixed text messages from each of them, logging every message.
//!
//! Type `/q` on stdin (or press Ctrl-C) to stop the listener and exit.

use asyncer::protocols::length_prefixed::LengthPrefixedHandler;
use asyncer::{Config, Listener, PacketHandler};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const QUIT_COMMAND: &str = "/q";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        buffer_size = config.buffer_size,
        liveness_timeout_ms = config.liveness_timeout.as_millis() as u64,
        "Starting asyncer server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let handler: Arc<dyn PacketHandler> = Arc::new(LengthPrefixedHandler::logging());
    let listener = Listener::new(config.session());

    let task = listener.start(config.listen, move |session| {
        info!(session = session.id(), peer = %session.peer_addr(), "Session connected");

        if let Err(e) = session.start(Arc::clone(&handler)) {
            error!(session = session.id(), error = %e, "Failed to start session");
        }
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(cmd) if cmd.trim() == QUIT_COMMAND => break,
                Some(_) => {}
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    listener.stop();
    task.join().await;
    info!("Server stopped");

    Ok(())
}
