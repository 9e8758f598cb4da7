use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ember_core::{Server, ServerConfig, init_logging_with_level};
use tracing::info;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Static-file HTTP/1.1 server on an epoll reactor")]
#[command(version)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<IpAddr>,
    /// Listening port (1024-65535)
    #[arg(short, long)]
    port: Option<u16>,
    /// 0: LT+LT, 1: conn ET, 2: listen ET, 3: ET+ET
    #[arg(short = 'm', long)]
    trigger_mode: Option<u8>,
    /// Idle timeout in milliseconds, 0 disables eviction
    #[arg(short, long, allow_negative_numbers = true)]
    timeout_ms: Option<i64>,
    /// Enable SO_LINGER on the listening socket
    #[arg(long)]
    linger: bool,
    /// Worker thread count
    #[arg(short, long)]
    workers: Option<usize>,
    /// Connection ceiling before new clients are turned away
    #[arg(long)]
    max_connections: Option<usize>,
    /// Directory served as the document root
    #[arg(short, long)]
    resources: Option<PathBuf>,
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overlay(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(mode) = self.trigger_mode {
            config.trigger_mode = mode;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = ms;
        }
        if self.linger {
            config.linger = true;
        }
        if let Some(n) = self.workers {
            config.worker_threads = n;
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if let Some(dir) = self.resources {
            config.resource_dir = dir;
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(&cli.log_level);

    let config = cli.overlay(ServerConfig::from_env());
    let server = Server::bind(&config).context("failed to start ember")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Received SIGINT, shutting down");
        handle.shutdown();
    })
    .context("installing Ctrl-C handler")?;

    info!("Serving {} on http://{}", config.resource_dir.display(), server.local_addr());
    server.start()?;
    Ok(())
}
