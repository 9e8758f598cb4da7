use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

/// Central error type for the ember engine.
///
/// Only setup and dispatch-loop failures surface here. Per-connection I/O and
/// protocol errors are absorbed by the connection layer and end in a close.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Underlying I/O error from the OS.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server configuration was rejected before startup.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be created, bound or registered.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The readiness multiplexer failed in a way that stops the dispatch loop.
    #[error("multiplexer failure: {0}")]
    Poll(#[source] io::Error),
}

pub type EmberResult<T> = Result<T, EmberError>;
