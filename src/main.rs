use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{AdmissionEngine, CheckRequest, CounterBackend, Quota, RedisBackend};

/// Admission control checks and quota administration.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML); `TURNSTILE__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for a caller and print each decision
    Check {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        category: String,
        /// Number of consecutive checks
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
        /// Pin the limit instead of resolving it
        #[arg(long)]
        limit: Option<u64>,
        /// Pin the window instead of resolving it
        #[arg(long)]
        window_ms: Option<u64>,
    },
    /// Manage per-caller quota overrides
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },
    /// Forget a caller's current window
    Reset {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        category: String,
    },
}

#[derive(Debug, Subcommand)]
enum QuotaAction {
    /// Show the override and the quota that would apply
    Get {
        #[arg(long)]
        caller: String,
        #[arg(long, default_value = "default")]
        category: String,
    },
    /// Persist an override
    Set {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        limit: u64,
        #[arg(long)]
        window_ms: u64,
    },
    /// Remove an override
    Reset {
        #[arg(long)]
        caller: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Turnstile");

    let backend = connect_backend(&config).await;
    let engine = AdmissionEngine::new(&config.admission, backend)?;

    match cli.command {
        Command::Check {
            caller,
            category,
            count,
            limit,
            window_ms,
        } => {
            let mut request = CheckRequest::new(&caller, &category);
            request.limit = limit;
            request.window_ms = window_ms;
            for _ in 0..count {
                print_json(&engine.check_with(request).await?)?;
            }
            print_json(&engine.stats())?;
        }
        Command::Quota { action } => match action {
            QuotaAction::Get { caller, category } => {
                let stored = engine.quotas().get(&caller).await?;
                let effective = engine.quotas().resolve(&caller, &category).await;
                print_json(&serde_json::json!({
                    "override": stored,
                    "effective": effective,
                }))?;
            }
            QuotaAction::Set {
                caller,
                limit,
                window_ms,
            } => {
                let quota = Quota::new(limit, window_ms)?;
                engine.quotas().set(&caller, quota).await?;
                print_json(&quota)?;
            }
            QuotaAction::Reset { caller } => {
                engine.quotas().reset(&caller).await?;
            }
        },
        Command::Reset { caller, category } => {
            engine.reset_caller(&caller, &category).await?;
        }
    }

    Ok(())
}

/// Connect to the shared store if one is configured. A failed connection
/// leaves decisions to the local fallback.
async fn connect_backend(config: &TurnstileConfig) -> Option<Arc<dyn CounterBackend>> {
    let url = config.store.redis_url.as_deref()?;
    match RedisBackend::connect(url, &config.admission.key_prefix).await {
        Ok(backend) => Some(Arc::new(backend) as Arc<dyn CounterBackend>),
        Err(e) => {
            warn!(url = %url, error = %e, "Counter store unreachable, counting locally");
            None
        }
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.json {
        builder.json().init();
    } else {
        builder.with_target(false).with_thread_ids(true).init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
