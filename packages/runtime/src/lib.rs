//! Payrail Runtime
//!
//! Env-driven configuration plus the wiring that turns the packages into
//! one running service: Postgres store, identity, transfer engine, outbox
//! worker, HTTP edge.

pub mod config;
pub mod serve;

pub use config::{Config, ConfigError};
pub use serve::serve;

/// Service version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load configuration from the environment and run until shutdown.
pub async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    serve(config).await
}
