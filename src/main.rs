use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
use config::{AppConfig, CliConfig, FileConfig};

mod ephemeral;
use ephemeral::MemoryEphemeralStore;

mod flush_queue;
use flush_queue::SqliteFlushTaskStore;

mod notifications;
use notifications::{build_aggregation, SqliteNotificationGroupStore};

mod sqlite_persistence;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the engine's SQLite databases.
    #[clap(value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. File values override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Aggregation window length in seconds.
    #[clap(long, default_value_t = 600)]
    pub window_secs: u64,

    /// Extra lifetime granted to batch data beyond the window, in seconds.
    #[clap(long, default_value_t = 120)]
    pub batch_ttl_margin_secs: u64,

    /// Delay before a scheduled flush runs, in seconds. Defaults to the
    /// window length.
    #[clap(long)]
    pub flush_delay_secs: Option<u64>,

    /// Interval between polls for due flush tasks, in milliseconds.
    #[clap(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Maximum execution attempts per flush task.
    #[clap(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Base delay of the exponential retry backoff, in milliseconds.
    #[clap(long, default_value_t = 2000)]
    pub retry_backoff_base_ms: u64,

    /// Interval between sweeps of expired ephemeral entries, in seconds.
    #[clap(long, default_value_t = 60)]
    pub purge_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        window_secs: cli_args.window_secs,
        batch_ttl_margin_secs: cli_args.batch_ttl_margin_secs,
        flush_delay_secs: cli_args.flush_delay_secs,
        poll_interval_ms: cli_args.poll_interval_ms,
        max_attempts: cli_args.max_attempts,
        retry_backoff_base_ms: cli_args.retry_backoff_base_ms,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!(
        "Opening notification database at {:?}...",
        config.notifications_db_path()
    );
    let group_store = Arc::new(SqliteNotificationGroupStore::new(
        config.notifications_db_path(),
    )?);

    info!(
        "Opening flush task database at {:?}...",
        config.flush_tasks_db_path()
    );
    let task_store = Arc::new(SqliteFlushTaskStore::new(config.flush_tasks_db_path())?);

    let ephemeral = Arc::new(MemoryEphemeralStore::new());

    // The engine handle is the ingress half: a host surface embedding this
    // process feeds events through it. This binary drives the flush side.
    let (_engine, worker) = build_aggregation(
        ephemeral.clone(),
        group_store,
        task_store,
        config.notifications.clone(),
        &config.flush_worker,
    );

    let shutdown = CancellationToken::new();

    // Spawn background task sweeping lazily expired window and batch keys
    let purge_interval = Duration::from_secs(cli_args.purge_interval_secs.max(1));
    let purge_store = ephemeral.clone();
    let purge_token = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);

        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = purge_store.purge_expired();
                    if purged > 0 {
                        info!("Purged {} expired ephemeral entries", purged);
                    }
                }
                _ = purge_token.cancelled() => break,
            }
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    info!(
        "Aggregating with a {:?} window, flushing after {:?}",
        config.notifications.window, config.notifications.flush_delay
    );
    worker.run(shutdown).await;

    Ok(())
}
