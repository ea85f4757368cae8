//! Payrail CLI
//!
//! Usage:
//!   payrail run      # Start the service
//!   payrail config   # Show the resolved configuration
//!   payrail version  # Show the version

use payrail_runtime::{Config, VERSION};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match command {
        "run" => {
            tracing::info!(version = VERSION, "payrail starting");
            if let Err(err) = payrail_runtime::run().await {
                eprintln!("Error: {err:#}");
                std::process::exit(1);
            }
        }

        "config" => match Config::from_env() {
            Ok(config) => println!("{config:#?}"),
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
        },

        "version" | "-v" | "--version" => {
            println!("payrail v{VERSION}");
        }

        "help" | "-h" | "--help" => {
            print_help();
        }

        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!("payrail v{VERSION}");
    println!();
    println!("Usage:");
    println!("  payrail run      Start the service");
    println!("  payrail config   Show the resolved configuration");
    println!("  payrail version  Show the version");
    println!();
    println!("Environment:");
    println!("  DATABASE_URL                Postgres connection string (required)");
    println!("  PORT                        HTTP port (default 8080)");
    println!("  BIND_ADDRESS                Bind address (default 0.0.0.0)");
    println!("  PUSH_SINK_URL               Push sink endpoint (optional)");
    println!("  PUSH_SINK_SECRET            Push sink bearer secret (optional)");
    println!("  OUTBOX_POLL_INTERVAL_SECS   Outbox poll interval (default 5)");
    println!("  PASSWORD_HASH_COST          Argon2 time cost (default 2)");
}
