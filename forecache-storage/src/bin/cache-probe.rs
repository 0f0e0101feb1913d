//! Cache probe - Inspects and administers a configured cache
//!
//! Usage: cargo run --features cli --bin cache-probe -- [--config config.toml] [COMMAND]
//!
//! Without `--config` the configuration is read from FORECACHE_* environment
//! variables. With no command, a round trip is run and stats are printed.
//! Log verbosity follows RUST_LOG.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use forecache_core::{CacheConfig, CacheKey, CacheMode, CacheResult, ConfigError, KeyParams};
use forecache_storage::{RedisConnector, RemoteConnector, TieredCache};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PROBE_SUBJECT: &str = "cache-probe";

#[derive(Parser, Debug)]
#[command(name = "cache-probe", version, about = "Inspect and administer a forecache deployment")]
struct Cli {
    /// TOML configuration file (defaults to FORECACHE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Write, read back and invalidate a throwaway entry, then print stats
    Probe,
    /// Print the stats snapshot as JSON
    Stats,
    /// List every key in the namespace with its tier and remaining lifetime
    Keys,
    /// Print the value stored under a full key
    Get { key: String },
    /// Delete one full key from both tiers
    Delete { key: String },
    /// Remove every entry for a subject
    Invalidate { subject: String },
    /// Remove every key in the namespace from both tiers
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("forecache_storage=debug,info"));
    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
    {
        eprintln!("Failed to init subscriber: {}", e);
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid cache configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(config = ?config, "Starting cache probe");

    let command = cli.command.unwrap_or(Command::Probe);
    let result = match config.mode {
        CacheMode::Remote => match RedisConnector::from_config(&config) {
            Ok(connector) => run(connector, &config, command).await,
            Err(e) => Err(e),
        },
        CacheMode::FallbackOnly => match TieredCache::fallback_only(&config) {
            Ok(cache) => execute(&cache, command).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Cache probe failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> CacheResult<CacheConfig> {
    let Some(path) = path else {
        return CacheConfig::from_env();
    };
    let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        reason: format!("failed to read {}: {}", path.display(), e),
    })?;
    CacheConfig::from_toml_str(&source)
}

async fn run<C: RemoteConnector>(
    connector: C,
    config: &CacheConfig,
    command: Command,
) -> CacheResult<()> {
    let cache = TieredCache::new(connector, config)?;
    execute(&cache, command).await
}

async fn execute<C: RemoteConnector>(cache: &TieredCache<C>, command: Command) -> CacheResult<()> {
    match command {
        Command::Probe => probe(cache).await,
        Command::Stats => print_json(&cache.stats().await),
        Command::Keys => print_json(&cache.keys().await),
        Command::Get { key } => {
            let value: Option<serde_json::Value> = cache.get(&CacheKey::from_raw(key)).await?;
            print_json(&value)
        }
        Command::Delete { key } => {
            let removed = cache.delete(&CacheKey::from_raw(key)).await;
            println!("deleted: {}", removed);
            Ok(())
        }
        Command::Invalidate { subject } => {
            let removed = cache.invalidate(&subject).await?;
            println!("invalidated: {}", removed);
            Ok(())
        }
        Command::Clear => {
            let removed = cache.clear().await;
            println!("cleared: {}", removed);
            Ok(())
        }
    }
}

async fn probe<C: RemoteConnector>(cache: &TieredCache<C>) -> CacheResult<()> {
    let key = cache.derive_key(PROBE_SUBJECT, &KeyParams::new().with("days", 7))?;
    let payload = json!({ "probe": true, "written_at": chrono::Utc::now().to_rfc3339() });

    cache.set(&key, &payload, Duration::from_secs(60)).await?;
    let read: Option<serde_json::Value> = cache.get(&key).await?;
    let removed = cache.invalidate(PROBE_SUBJECT).await?;

    println!("key:         {}", key);
    println!("round trip:  {}", if read.as_ref() == Some(&payload) { "ok" } else { "MISMATCH" });
    println!("invalidated: {}", removed);

    print_json(&cache.stats().await)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> CacheResult<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{}", rendered);
    Ok(())
}
