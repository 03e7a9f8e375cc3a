use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{RateLimitDecision, RateLimiter};
use tollgate::store;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Token-bucket rate limiter operator tool")]
struct Cli {
    /// YAML configuration file; TOLLGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send requests for one caller through the configured store and report the decisions
    Probe {
        /// Authenticated identity of the caller
        #[arg(long)]
        identity: Option<String>,

        /// Remote address of the caller
        #[arg(long)]
        remote_address: Option<String>,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 1)]
        requests: usize,

        /// Send all requests at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::CheckConfig => {
            config.limiter_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Probe {
            identity,
            remote_address,
            requests,
            concurrent,
        } => {
            probe(&config, identity, remote_address, requests, concurrent).await?;
        }
    }

    Ok(())
}

async fn probe(
    config: &TollgateConfig,
    identity: Option<String>,
    remote_address: Option<String>,
    requests: usize,
    concurrent: bool,
) -> anyhow::Result<()> {
    let limiter_config = config.limiter_config()?;
    let store = store::open(&config.store).await?;
    let limiter = Arc::new(RateLimiter::new(store, limiter_config)?);

    info!(
        requests = requests,
        concurrent = concurrent,
        identity = ?identity,
        remote_address = ?remote_address,
        "Probing rate limiter"
    );

    let started = Instant::now();
    let decisions = if concurrent {
        let calls = (0..requests).map(|_| {
            let limiter = limiter.clone();
            let identity = identity.clone();
            let remote_address = remote_address.clone();
            async move {
                limiter
                    .check(identity.as_deref(), remote_address.as_deref())
                    .await
            }
        });
        join_all(calls).await
    } else {
        let mut decisions = Vec::with_capacity(requests);
        for _ in 0..requests {
            decisions.push(
                limiter
                    .check(identity.as_deref(), remote_address.as_deref())
                    .await,
            );
        }
        decisions
    };
    let elapsed = started.elapsed();

    let mut allowed = 0;
    let mut throttled = 0;
    let mut failed = 0;
    for (i, decision) in decisions.iter().enumerate() {
        match decision {
            RateLimitDecision::Allowed { remaining } => {
                allowed += 1;
                println!("{:>5}  allowed    remaining={:.2}", i + 1, remaining);
            }
            RateLimitDecision::Throttled { retry_after } => {
                throttled += 1;
                println!("{:>5}  throttled  retry_after={:?}", i + 1, retry_after);
            }
            RateLimitDecision::StoreFailure { admitted, reason } => {
                failed += 1;
                println!("{:>5}  failure    admitted={} reason={}", i + 1, admitted, reason);
            }
        }
    }

    println!(
        "allowed={} throttled={} store_failures={} elapsed={:?}",
        allowed, throttled, failed, elapsed
    );

    Ok(())
}
