//! line-relay: a text broadcast relay
//!
//! Every line a connected client sends is forwarded to every other
//! connected client as `<label>: <text>`. Sending `quit` disconnects.
//!
//! Features:
//! - Newline-delimited UTF-8 framing with partial-read reassembly
//! - Per-peer write failure isolation during fan-out
//! - Three dispatchers: thread per connection, mio readiness loop, tokio tasks
//! - Configuration via CLI arguments or TOML file

mod broadcast;
mod config;
mod endpoint;
mod error;
mod framer;
mod registry;
mod runtime;
mod session;

#[cfg(test)]
mod testing;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

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
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        max_line_length = config.max_line_length,
        "Starting line-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
