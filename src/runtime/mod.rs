//! Event dispatchers.
//!
//! Three interchangeable strategies drive the same session contract:
//! - `threaded`: one blocking worker thread per connection
//! - `mio_impl`: one thread multiplexing every connection (epoll/kqueue)
//! - `tasks`: one tokio task per connection
//!
//! All of them share:
//! - `Inbound`/`Session`: framing, sentinel handling, lifecycle
//! - `Registry`/`SharedRegistry`: who is online
//! - `broadcast`: fan-out with per-peer failure isolation

mod mio_impl;
mod stats;
mod tasks;
mod threaded;

pub use stats::RelayStats;

use crate::config::{Config, RuntimeType};
use crate::endpoint::bind_listener;
use crate::error::RelayError;
use std::io;
use std::sync::Arc;
use tracing::info;

/// Bind the configured listener and run the configured dispatcher.
///
/// Only returns on a listener failure.
pub fn run(config: Config) -> Result<(), RelayError> {
    let stats = Arc::new(RelayStats::default());
    let result = dispatch(&config, Arc::clone(&stats));

    info!(
        online = stats.online(),
        accepted = stats.accepted(),
        rejected = stats.rejected(),
        messages = stats.messages(),
        evicted = stats.evicted(),
        "Relay stopped"
    );
    result
}

fn dispatch(config: &Config, stats: Arc<RelayStats>) -> Result<(), RelayError> {
    match config.runtime {
        RuntimeType::Threaded => {
            let listener = bind_listener(config.listen, config.backlog, false)?;
            threaded::serve(listener, config, stats)
        }
        RuntimeType::Mio => {
            let listener = bind_listener(config.listen, config.backlog, true)?;
            mio_impl::EventLoop::new(listener, config, stats)?.run()
        }
        RuntimeType::Tokio => {
            let listener = bind_listener(config.listen, config.backlog, true)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("relay-worker")
                .build()
                .map_err(RelayError::Listener)?;
            runtime.block_on(tasks::serve(listener, config.clone(), stats))
        }
    }
}

/// Accept failures that concern one pending connection, not the listener.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
    )
}
