// src/config.rs
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::epoll::{EPOLLET, EPOLLONESHOT, EPOLLRDHUP};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {0} is outside 1024..=65535")]
    PortOutOfRange(u16),
    #[error("unknown trigger mode {0}, expected 0..=3")]
    UnknownTriggerMode(u8),
    #[error("worker pool needs at least one thread")]
    ZeroWorkers,
    #[error("connection capacity must be at least one")]
    ZeroCapacity,
    #[error("resource directory {0} does not exist")]
    MissingResourceDir(PathBuf),
}

/// Which sockets are registered edge-triggered.
///
/// | mode | listener | connections |
/// |------|----------|-------------|
/// | 0    | level    | level       |
/// | 1    | level    | edge        |
/// | 2    | edge     | level       |
/// | 3    | edge     | edge        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    pub fn from_selector(mode: u8) -> Result<Self, ConfigError> {
        let (listen_edge, conn_edge) = match mode {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            3 => (true, true),
            other => return Err(ConfigError::UnknownTriggerMode(other)),
        };
        Ok(Self {
            listen_edge,
            conn_edge,
        })
    }

    pub fn listen_events(&self) -> u32 {
        let mut ev = EPOLLRDHUP;
        if self.listen_edge {
            ev |= EPOLLET;
        }
        ev
    }

    /// Base mask for connection sockets; callers add `EPOLLIN` or `EPOLLOUT`.
    pub fn conn_events(&self) -> u32 {
        let mut ev = EPOLLONESHOT | EPOLLRDHUP;
        if self.conn_edge {
            ev |= EPOLLET;
        }
        ev
    }
}

/// Server configuration, loaded from `EMBER_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// 0..=3, see [`TriggerMode`].
    pub trigger_mode: u8,
    /// Idle timeout in milliseconds; zero or negative disables eviction.
    pub timeout_ms: i64,
    /// Graceful close with SO_LINGER.
    pub linger: bool,
    pub worker_threads: usize,
    pub max_connections: usize,
    pub resource_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            worker_threads: num_cpus::get(),
            max_connections: 65_536,
            resource_dir: PathBuf::from("./resources"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Missing or
    /// unparsable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            host: parse(&lookup, "EMBER_HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "EMBER_PORT").unwrap_or(defaults.port),
            trigger_mode: parse(&lookup, "EMBER_TRIGGER_MODE").unwrap_or(defaults.trigger_mode),
            timeout_ms: parse(&lookup, "EMBER_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            linger: lookup("EMBER_LINGER")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.linger),
            worker_threads: parse(&lookup, "EMBER_WORKERS").unwrap_or(defaults.worker_threads),
            max_connections: parse(&lookup, "EMBER_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            resource_dir: lookup("EMBER_RESOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.resource_dir),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        TriggerMode::from_selector(self.trigger_mode)?;
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if !self.resource_dir.is_dir() {
            return Err(ConfigError::MissingResourceDir(self.resource_dir.clone()));
        }
        Ok(())
    }

    pub fn trigger(&self) -> Result<TriggerMode, ConfigError> {
        TriggerMode::from_selector(self.trigger_mode)
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let cfg = ServerConfig::from_lookup(|_| None);
        assert_eq!(cfg.port, 1316);
        assert_eq!(cfg.trigger_mode, 3);
        assert_eq!(cfg.timeout_ms, 60_000);
        assert!(!cfg.linger);
        assert_eq!(cfg.max_connections, 65_536);
        assert!(cfg.worker_threads >= 1);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("EMBER_HOST", "127.0.0.1"),
            ("EMBER_PORT", "8080"),
            ("EMBER_TRIGGER_MODE", "1"),
            ("EMBER_TIMEOUT_MS", "-1"),
            ("EMBER_LINGER", "yes"),
            ("EMBER_WORKERS", "not-a-number"),
            ("EMBER_RESOURCE_DIR", "/srv/www"),
        ]));
        assert_eq!(cfg.server_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.trigger_mode, 1);
        assert_eq!(cfg.timeout_ms, -1);
        assert!(cfg.linger);
        assert_eq!(cfg.worker_threads, num_cpus::get());
        assert_eq!(cfg.resource_dir, PathBuf::from("/srv/www"));
    }

    #[test]
    fn test_validate_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let good = ServerConfig {
            resource_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        assert_eq!(good.validate(), Ok(()));

        let low_port = ServerConfig { port: 80, ..good.clone() };
        assert_eq!(low_port.validate(), Err(ConfigError::PortOutOfRange(80)));

        let bad_mode = ServerConfig { trigger_mode: 4, ..good.clone() };
        assert_eq!(bad_mode.validate(), Err(ConfigError::UnknownTriggerMode(4)));

        let no_workers = ServerConfig { worker_threads: 0, ..good.clone() };
        assert_eq!(no_workers.validate(), Err(ConfigError::ZeroWorkers));

        let no_room = ServerConfig { max_connections: 0, ..good.clone() };
        assert_eq!(no_room.validate(), Err(ConfigError::ZeroCapacity));

        let missing = ServerConfig {
            resource_dir: dir.path().join("nope"),
            ..good
        };
        assert!(matches!(missing.validate(), Err(ConfigError::MissingResourceDir(_))));
    }

    #[test]
    fn test_trigger_masks() {
        let lt = TriggerMode::from_selector(0).unwrap();
        assert_eq!(lt.listen_events(), EPOLLRDHUP);
        assert_eq!(lt.conn_events(), EPOLLONESHOT | EPOLLRDHUP);

        let conn_only = TriggerMode::from_selector(1).unwrap();
        assert_eq!(conn_only.listen_events() & EPOLLET, 0);
        assert_ne!(conn_only.conn_events() & EPOLLET, 0);

        let listen_only = TriggerMode::from_selector(2).unwrap();
        assert_ne!(listen_only.listen_events() & EPOLLET, 0);
        assert_eq!(listen_only.conn_events() & EPOLLET, 0);

        let et = TriggerMode::from_selector(3).unwrap();
        assert_eq!(et.listen_events(), EPOLLRDHUP | EPOLLET);
        assert_eq!(et.conn_events(), EPOLLONESHOT | EPOLLRDHUP | EPOLLET);
    }
}
