// src/lib.rs
//! ember: a static-file HTTP/1.1 server built directly on epoll.
//!
//! One dispatch thread owns the multiplexer, the connection table and the
//! idle timer; a fixed worker pool performs all connection I/O, request
//! parsing and response construction.

#[cfg(not(target_os = "linux"))]
compile_error!("ember-core requires Linux (epoll, accept4, pipe2)");

pub mod auth;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod epoll;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod timer;
pub mod worker;

// Re-exports for users
pub use auth::{CredentialBackend, MemoryBackend, PooledVerifier, UserVerifier};
pub use config::{ConfigError, ServerConfig, TriggerMode};
pub use conn::ServerContext;
pub use error::{EmberError, EmberResult};
pub use logging::{init_logging, init_logging_with_level};
pub use metrics::{ServerStats, StatsSnapshot};
pub use server::{Server, ShutdownHandle};
