use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Server settings, read from `HUDDLE_*` environment variables (a `.env`
/// file is loaded first if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub heartbeat_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("HUDDLE_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("HUDDLE_PORT must be a port number")?;
        let db_path: PathBuf = lookup("HUDDLE_DB_PATH")
            .unwrap_or_else(|| "huddle.db".into())
            .into();
        let heartbeat_secs: u64 = lookup("HUDDLE_HEARTBEAT_SECS")
            .unwrap_or_else(|| "15".into())
            .parse()
            .context("HUDDLE_HEARTBEAT_SECS must be a whole number of seconds")?;

        Ok(Self {
            host,
            port,
            db_path,
            heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
