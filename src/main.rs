use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::LoggingConfig;
use ratekeeper::{Decision, Limiter, RatekeeperConfig};

/// Probe a rate limiter from the command line.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version)]
struct Cli {
    /// YAML configuration file; `RATEKEEPER__*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one or more rate limit checks and print each decision
    Check {
        #[command(flatten)]
        request: Request,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Reserve units and print the reserved member ids
    Reserve {
        #[command(flatten)]
        request: Request,

        /// Refund the reservation right away
        #[arg(long)]
        release: bool,
    },
}

#[derive(Debug, Args)]
struct Request {
    #[arg(long)]
    key: String,

    #[arg(long, default_value_t = 1)]
    cost: i64,

    #[arg(long)]
    rate: i64,

    /// Window length in seconds
    #[arg(long)]
    window: i64,
}

/// One decision as printed on stdout.
#[derive(Debug, Serialize)]
struct DecisionLine<'a> {
    key: &'a str,
    algorithm: &'static str,
    allowed: bool,
    retry_after_ms: u128,
    members: &'a [String],
    released: bool,
}

impl<'a> DecisionLine<'a> {
    fn new(key: &'a str, algorithm: &'static str, decision: &'a Decision) -> Self {
        Self {
            key,
            algorithm,
            allowed: decision.allowed,
            retry_after_ms: decision.retry_after.as_millis(),
            members: decision.release.members(),
            released: decision.release.is_released(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RatekeeperConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging)?;
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Configuration loaded");
    }

    let limiter = Limiter::from_config(&config)
        .await
        .context("failed to build limiter")?;
    info!(algorithm = limiter.algorithm(), "Limiter ready");

    match cli.command {
        Command::Check {
            request,
            repeat,
            interval_ms,
        } => {
            tokio::select! {
                result = run_checks(&limiter, &request, repeat, Duration::from_millis(interval_ms)) => result?,
                _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping"),
            }
        }
        Command::Reserve { request, release } => {
            let decision = limiter
                .allow_after(request.cost, request.rate, request.window, &request.key)
                .await?;
            if release && decision.allowed {
                decision.release.release().await?;
            } else if release {
                warn!(key = %request.key, "Nothing to release, request was denied");
            }
            print_line(&DecisionLine::new(&request.key, limiter.algorithm(), &decision))?;
        }
    }

    Ok(())
}

async fn run_checks(limiter: &Limiter, request: &Request, repeat: u32, interval: Duration) -> anyhow::Result<()> {
    for i in 0..repeat {
        if i > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        let decision = limiter
            .allow_after(request.cost, request.rate, request.window, &request.key)
            .await?;
        print_line(&DecisionLine::new(&request.key, limiter.algorithm(), &decision))?;
    }
    Ok(())
}

fn print_line(line: &DecisionLine<'_>) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(line)?);
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level)
            .with_context(|| format!("invalid log level {:?}", logging.level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
    Ok(())
}
