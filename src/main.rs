//! Rivera Cache CLI
//!
//! Builds a cache service from a configuration file and runs one operation
//! against it.
//!
//! ```text
//! rivera-cache --config cache.yaml set user:42 ada --expires 300
//! rivera-cache --config cache.yaml get user:42 --identifier sessions
//! rivera-cache --config cache.yaml health
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rivera_cache::{CacheService, CacheServiceConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Rivera Cache - multi-backend cache service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (.yaml/.yml or .json)
    #[arg(long, short, env = "RIVERA_CACHE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key; prints the value, exits 1 on a miss
    Get {
        key: String,
        /// Only query these handlers (repeatable)
        #[arg(long = "identifier", short)]
        identifiers: Vec<String>,
        /// Expiry window in seconds instead of each handler's default
        #[arg(long)]
        expires: Option<u32>,
    },
    /// Write a key to every matching handler
    Set {
        key: String,
        value: String,
        #[arg(long, default_value = "0")]
        expires: u32,
        #[arg(long = "identifier", short)]
        identifiers: Vec<String>,
    },
    /// Remove a key from every matching handler
    Delete {
        key: String,
        #[arg(long = "identifier", short)]
        identifiers: Vec<String>,
    },
    /// Drop every key on every matching handler
    Flush {
        #[arg(long = "identifier", short)]
        identifiers: Vec<String>,
    },
    /// Print per-handler statistics as JSON
    Stats {
        #[arg(long = "identifier", short)]
        identifiers: Vec<String>,
    },
    /// Print the health report as JSON
    Health,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = CacheServiceConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(config = %args.config.display(), handlers = config.handlers.len(), "Configuration loaded");

    let service = CacheService::from_config(&config)
        .await
        .context("building cache service")?;

    match args.command {
        Command::Get {
            key,
            identifiers,
            expires,
        } => {
            let ids = as_strs(&identifiers);
            let value = match expires {
                Some(expires) => service.get_with_expiry(&key, expires, &ids).await?,
                None => service.get(&key, &ids).await?,
            };
            match value {
                Some(value) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&value)?;
                    stdout.write_all(b"\n")?;
                }
                None => {
                    eprintln!("miss: {}", key);
                    std::process::exit(1);
                }
            }
        }
        Command::Set {
            key,
            value,
            expires,
            identifiers,
        } => {
            service
                .set(&key, value.into_bytes(), expires, &as_strs(&identifiers))
                .await?;
        }
        Command::Delete { key, identifiers } => {
            service.delete(&key, &as_strs(&identifiers)).await?;
        }
        Command::Flush { identifiers } => {
            service.flush_all(&as_strs(&identifiers)).await?;
        }
        Command::Stats { identifiers } => {
            let stats = service.stats(&as_strs(&identifiers)).await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Health => {
            let health = service.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.status.is_operational() {
                std::process::exit(2);
            }
        }
    }

    Ok(())
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays pipeable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
