use std::env;
use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8787";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DUET_RELAY_ADDR must be host:port, got {0:?}")]
    InvalidAddr(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let addr = match env::var("DUET_RELAY_ADDR") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAddr(raw))?,
            Err(_) => default_addr(),
        };
        let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
        Ok(Self { addr, log_filter })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            log_filter: "info".into(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8787))
}
