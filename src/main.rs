use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewell::config::{LoggingConfig, RatewellConfig};
use ratewell::ratelimit::{PolicySet, RateLimiter};

/// Check requests against rate limits backed by Redis with local fallback.
#[derive(Debug, Parser)]
#[command(name = "ratewell", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to a YAML policy file, replacing the configured policies
    #[arg(short, long, global = true)]
    policies: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count requests for a key against an explicit limit
    Check {
        /// Rate limit key, e.g. "verify:203.0.113.4"
        #[arg(long)]
        key: String,
        /// Requests allowed per window
        #[arg(long)]
        limit: u64,
        /// Window length in milliseconds
        #[arg(long)]
        window_ms: u64,
        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        hits: u32,
    },
    /// Count requests for a caller against a named policy
    Policy {
        /// Policy name, e.g. "verify"
        #[arg(long)]
        name: String,
        /// Caller identifier, e.g. a client address
        #[arg(long)]
        caller: String,
        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        hits: u32,
    },
    /// Print the configured policies
    Policies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RatewellConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewell");

    if let Some(path) = &cli.policies {
        config.policies = PolicySet::from_file(path)?;
    }

    let limiter = RateLimiter::from_config(&config).await?;
    info!(remote = limiter.has_remote(), "Rate limiter initialized");

    match cli.command {
        Command::Check {
            key,
            limit,
            window_ms,
            hits,
        } => {
            for _ in 0..hits {
                let decision = limiter.check(&key, limit, window_ms).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Policy { name, caller, hits } => {
            for _ in 0..hits {
                let decision = limiter.check_policy(&name, &caller).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Policies => {
            println!("{}", serde_json::to_string_pretty(limiter.policies())?);
        }
    }

    Ok(())
}

/// Log to stderr so decisions on stdout stay machine-readable.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
