use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cooldowns::config::CooldownsConfig;
use cooldowns::ratelimit::{ArgValue, BucketKey, CallArgs, LimiterId, LimiterState, SharedRegistry};

#[derive(Debug, Parser)]
#[command(name = "cooldowns", version, about = "Call admission control per argument bucket")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a configuration file and define every limiter in it
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Run a burst of calls against one configured limiter
    Simulate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        limiter: String,
        #[arg(long, default_value_t = 1)]
        calls: u32,
        /// Positional argument passed with every call
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Write the limiter state as JSON after the run
        #[arg(long)]
        save_state: Option<PathBuf>,
    },
    /// Summarize a saved limiter state
    Inspect {
        #[arg(long)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Simulate {
            config,
            limiter,
            calls,
            args,
            save_state,
        } => simulate(config, limiter, calls, args, save_state).await,
        Command::Inspect { state } => inspect(state),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_registry(path: &PathBuf) -> anyhow::Result<SharedRegistry> {
    let config = CooldownsConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let registry = SharedRegistry::new();
    config.register_all(&registry)?;
    Ok(registry)
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let registry = load_registry(&path)?;
    for id in registry.ids() {
        let limiter = registry.get(id.clone())?;
        println!("{}: limit {} {:?}", id, limiter.limit(), limiter.policy());
    }
    println!("{} limiter(s) ok", registry.len());
    Ok(())
}

/// Numeric ids are written the same way on the command line as in YAML.
fn parse_id(raw: &str) -> LimiterId {
    raw.parse::<i64>()
        .map(LimiterId::Int)
        .unwrap_or_else(|_| LimiterId::Name(raw.to_string()))
}

fn parse_arg(raw: &str) -> ArgValue {
    match raw {
        "null" => ArgValue::Null,
        "true" => ArgValue::Bool(true),
        "false" => ArgValue::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(ArgValue::Int)
            .unwrap_or_else(|_| ArgValue::Str(raw.to_string())),
    }
}

async fn simulate(
    config: PathBuf,
    limiter: String,
    calls: u32,
    args: Vec<String>,
    save_state: Option<PathBuf>,
) -> anyhow::Result<()> {
    let registry = load_registry(&config)?;
    let limiter = registry.get(parse_id(&limiter))?;

    let call_args = args
        .iter()
        .fold(CallArgs::new(), |acc, raw| acc.arg(parse_arg(raw)));

    let mut admitted = 0;
    for call in 1..=calls {
        match limiter.admit(&call_args).await {
            Ok(()) => {
                admitted += 1;
                println!("call {}: admitted", call);
            }
            Err(e) if e.is_on_cooldown() => {
                let retry = e.retry_after().unwrap_or_default();
                println!("call {}: rejected, retry in {:.3}s", call, retry.as_secs_f64());
            }
            Err(e) => return Err(e.into()),
        }
    }
    println!(
        "{} admitted, {} rejected, {} remaining",
        admitted,
        calls - admitted,
        limiter.remaining_calls(&call_args).await
    );

    if let Some(path) = save_state {
        limiter.snapshot()?.save(&path)?;
        info!(path = %path.display(), "Saved limiter state");
    }
    Ok(())
}

fn inspect(path: PathBuf) -> anyhow::Result<()> {
    let state = LimiterState::load(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let id = state
        .limiter_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<unnamed>".to_string());
    println!(
        "limiter {}: limit {}, period {}s, {} bucket(s)",
        id,
        state.limit,
        state.period_seconds,
        state.cache.len()
    );
    if !state.reset_times.is_empty() {
        println!("daily resets: {:?}", state.reset_times);
    }

    for (encoded, bucket) in &state.cache {
        let key = BucketKey::decode(encoded)?;
        let next = bucket.resets()?.into_iter().next();
        println!(
            "  {} available {}/{}, next reset {}",
            key,
            bucket.current_available,
            bucket.limit,
            next.map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}
