use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulwark::config::{BulwarkConfig, LoggingConfig};
use bulwark::janitor;
use bulwark::ratelimit::{Action, AttemptKey, Identifier, LimitOverride, RateLimiter};
use bulwark::storage::{self, Metadata, MetadataValue};

/// Attempt-log rate limiter: inspect and maintain throttling state.
#[derive(Parser)]
#[command(name = "bulwark", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decide whether a new attempt would be allowed
    Check {
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Append an attempt to the log
    Record {
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        attempt: AttemptArgs,
    },
    /// Check and record in one atomic step
    CheckAndRecord {
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        attempt: AttemptArgs,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Show attempts, last attempt and lock state
    Status {
        #[command(flatten)]
        key: KeyArgs,
        #[command(flatten)]
        limits: LimitArgs,
    },
    /// Remove an identifier's attempts (administrative unlock)
    Clear {
        #[arg(long)]
        identifier: String,
        /// Only clear this action; all actions when omitted
        #[arg(long)]
        action: Option<String>,
    },
    /// Delete attempts older than the retention horizon once
    Cleanup,
    /// Run cleanup on the configured interval until interrupted
    Janitor,
}

#[derive(Args)]
struct KeyArgs {
    /// Subject being throttled (email, IP address, account id)
    #[arg(long)]
    identifier: String,
    /// Operation being throttled (login, password_reset, ...)
    #[arg(long)]
    action: String,
}

impl KeyArgs {
    fn to_key(&self) -> bulwark::error::Result<AttemptKey> {
        AttemptKey::parse(&self.identifier, &self.action)
    }
}

#[derive(Args)]
struct AttemptArgs {
    #[arg(long, value_enum)]
    outcome: Outcome,
    /// Metadata as key=value; may be repeated
    #[arg(long = "meta", value_parser = parse_metadata_entry)]
    metadata: Vec<(String, MetadataValue)>,
}

impl AttemptArgs {
    fn metadata(&self) -> Option<Metadata> {
        if self.metadata.is_empty() {
            None
        } else {
            Some(self.metadata.iter().cloned().collect())
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Args)]
struct LimitArgs {
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    window_minutes: Option<u32>,
    #[arg(long)]
    lockout_minutes: Option<u32>,
}

impl LimitArgs {
    fn to_override(&self) -> Option<LimitOverride> {
        let overrides = LimitOverride {
            max_attempts: self.max_attempts,
            window_minutes: self.window_minutes,
            lockout_minutes: self.lockout_minutes,
        };
        (!overrides.is_empty()).then_some(overrides)
    }
}

/// Parse `key=value`, inferring booleans and integers.
fn parse_metadata_entry(raw: &str) -> Result<(String, MetadataValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    if key.is_empty() {
        return Err("metadata key must not be empty".to_string());
    }

    let value = match value {
        "true" => MetadataValue::Bool(true),
        "false" => MetadataValue::Bool(false),
        other => match other.parse::<i64>() {
            Ok(n) => MetadataValue::from(n),
            Err(_) => MetadataValue::from(other),
        },
    };

    Ok((key.to_string(), value))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = BulwarkConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting Bulwark"
    );

    let store = storage::open(&config.storage).await?;
    let rules = config.limits.load_rules()?;
    let limiter = Arc::new(
        RateLimiter::new(store)
            .with_rules(rules)
            .with_retention(config.retention()),
    );

    match cli.command {
        Command::Check { key, limits } => {
            let result = limiter
                .check_rate_limit(&key.to_key()?, limits.to_override().as_ref())
                .await;
            print_json(&serde_json::json!({ "result": result, "state": result.state() }))?;
        }
        Command::Record { key, attempt } => {
            let success = matches!(attempt.outcome, Outcome::Success);
            limiter
                .record_attempt(&key.to_key()?, success, attempt.metadata())
                .await;
        }
        Command::CheckAndRecord { key, attempt, limits } => {
            let success = matches!(attempt.outcome, Outcome::Success);
            let result = limiter
                .check_and_record(
                    &key.to_key()?,
                    success,
                    attempt.metadata(),
                    limits.to_override().as_ref(),
                )
                .await;
            print_json(&serde_json::json!({ "result": result, "state": result.state() }))?;
        }
        Command::Status { key, limits } => {
            let status = limiter
                .get_rate_limit_status(&key.to_key()?, limits.to_override().as_ref())
                .await;
            print_json(&status)?;
        }
        Command::Clear { identifier, action } => {
            let identifier = Identifier::new(identifier)?;
            let action = action.map(Action::new).transpose()?;
            match limiter.clear_rate_limit(&identifier, action.as_ref()).await {
                Some(deleted) => print_json(&serde_json::json!({ "deleted": deleted }))?,
                None => anyhow::bail!("clear was not confirmed by the store"),
            }
        }
        Command::Cleanup => match limiter.cleanup().await {
            Some(deleted) => print_json(&serde_json::json!({ "deleted": deleted }))?,
            None => anyhow::bail!("cleanup was not confirmed by the store"),
        },
        Command::Janitor => {
            let interval = Duration::from_secs(config.cleanup.interval_secs);
            janitor::run_with_shutdown(limiter, interval, shutdown_signal()).await;
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
