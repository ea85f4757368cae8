//! Configuration
//!
//! Everything comes from the environment; nothing vendor-specific. The
//! store URL is the only required setting.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub bind_address: IpAddr,
    /// HTTP port
    pub port: u16,
    /// Postgres connection string (required)
    pub database_url: String,
    /// Push sink endpoint; absent means log-only delivery
    pub push_sink_url: Option<String>,
    /// Bearer secret for the push sink
    pub push_sink_secret: Option<String>,
    /// Outbox worker poll interval
    pub outbox_poll_interval: Duration,
    /// Argon2 time cost for password hashing
    pub password_hash_cost: u32,
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    /// Load from environment variables, applying defaults where sensible.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let mut config = Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            database_url,
            push_sink_url: env::var("PUSH_SINK_URL").ok(),
            push_sink_secret: env::var("PUSH_SINK_SECRET").ok(),
            outbox_poll_interval: Duration::from_secs(5),
            password_hash_cost: payrail_identity::password::DEFAULT_TIME_COST,
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = env::var("BIND_ADDRESS") {
            self.bind_address = addr
                .parse()
                .map_err(|_| ConfigError::Invalid("BIND_ADDRESS", addr))?;
        }

        if let Ok(port) = env::var("PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT", port))?;
        }

        if let Ok(secs) = env::var("OUTBOX_POLL_INTERVAL_SECS") {
            let parsed: u64 = secs
                .parse()
                .map_err(|_| ConfigError::Invalid("OUTBOX_POLL_INTERVAL_SECS", secs))?;
            self.outbox_poll_interval = Duration::from_secs(parsed.max(1));
        }

        if let Ok(cost) = env::var("PASSWORD_HASH_COST") {
            self.password_hash_cost = cost
                .parse()
                .map_err(|_| ConfigError::Invalid("PASSWORD_HASH_COST", cost))?;
        }

        Ok(())
    }
}
