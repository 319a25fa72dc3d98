use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::{Algorithm, Gatekeeper, GatekeeperError, RateLimiterConfig};

/// Distributed locking and rate limiting over a shared Redis instance.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Redis URL, overriding the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask a rate limiter for permits
    Permit {
        /// Limiter name
        name: String,

        /// Permits per period; required unless the limiter is configured
        #[arg(long)]
        capacity: Option<u64>,

        /// Refresh period in milliseconds
        #[arg(long, default_value_t = 1000)]
        period_ms: u64,

        /// Window algorithm
        #[arg(long, value_enum, default_value_t = AlgorithmArg::FixedWindow)]
        algorithm: AlgorithmArg,

        /// Number of checks to make
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Acquire a lock, hold it, then release it
    Lock {
        /// Lock name
        name: String,

        /// How long to hold the lock, in milliseconds
        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,

        /// Give up waiting after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    FixedWindow,
    SlidingWindow,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::FixedWindow => Algorithm::FixedWindow,
            AlgorithmArg::SlidingWindow => Algorithm::SlidingWindow,
        }
    }
}

#[derive(Debug, Serialize)]
struct PermitReport<'a> {
    limiter: &'a str,
    algorithm: Algorithm,
    attempt: u32,
    granted: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }
    info!(store = %config.store.url, "Configuration loaded");

    let gatekeeper = Gatekeeper::connect(&config).await?;

    match cli.command {
        Command::Permit {
            name,
            capacity,
            period_ms,
            algorithm,
            count,
        } => {
            let limiter = match capacity {
                Some(capacity) => gatekeeper.rate_limiter(
                    RateLimiterConfig::new(name, capacity, Duration::from_millis(period_ms))
                        .with_algorithm(algorithm.into()),
                )?,
                None => gatekeeper.named_rate_limiter(&name)?,
            };

            for attempt in 1..=count {
                let report = PermitReport {
                    limiter: limiter.name(),
                    algorithm: limiter.config().algorithm,
                    attempt,
                    granted: limiter.get_permission().await,
                };
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Command::Lock {
            name,
            hold_ms,
            timeout_ms,
        } => {
            let lock = gatekeeper.reentrant_lock(name)?;
            info!(lock = %lock.name(), holder = %lock.holder(), "Waiting for lock");

            // Ctrl+C only stops the wait between attempts, never mid-call
            let outcome = match timeout_ms {
                Some(ms) => {
                    lock.lock_timeout_with_cancel(Duration::from_millis(ms), shutdown_signal())
                        .await
                }
                None => lock.lock_with_cancel(shutdown_signal()).await.map(|()| true),
            };
            let acquired = match outcome {
                Ok(acquired) => acquired,
                Err(GatekeeperError::Cancelled { .. }) => false,
                Err(e) => return Err(e.into()),
            };

            if !acquired {
                anyhow::bail!("lock '{}' was not acquired", lock.name());
            }

            info!(lock = %lock.name(), hold_ms, "Lock acquired, holding");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
                _ = shutdown_signal() => {}
            }

            lock.unlock().await?;
            info!(lock = %lock.name(), "Lock released");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
