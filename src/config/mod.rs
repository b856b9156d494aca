mod file_config;

pub use file_config::{FileConfig, FlushWorkerConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub window_secs: u64,
    pub batch_ttl_margin_secs: u64,
    pub flush_delay_secs: Option<u64>,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_base_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            window_secs: 600,
            batch_ttl_margin_secs: 120,
            flush_delay_secs: None,
            poll_interval_ms: 1000,
            max_attempts: 3,
            retry_backoff_base_ms: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,

    // Feature configs (with defaults)
    pub notifications: NotificationSettings,
    pub flush_worker: FlushWorkerSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified as an argument or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let window_secs = file.window_secs.unwrap_or(cli.window_secs);
        if window_secs == 0 {
            bail!("window_secs must be greater than zero");
        }

        let batch_ttl_margin_secs = file
            .batch_ttl_margin_secs
            .unwrap_or(cli.batch_ttl_margin_secs);

        let flush_delay_secs = file
            .flush_delay_secs
            .or(cli.flush_delay_secs)
            .unwrap_or(window_secs);

        // The flush must run while the batch keys are still alive
        if flush_delay_secs > window_secs + batch_ttl_margin_secs {
            bail!(
                "flush_delay_secs ({}) exceeds the batch lifetime of {} seconds",
                flush_delay_secs,
                window_secs + batch_ttl_margin_secs
            );
        }

        let notifications = NotificationSettings {
            window: Duration::from_secs(window_secs),
            batch_ttl_margin: Duration::from_secs(batch_ttl_margin_secs),
            flush_delay: Duration::from_secs(flush_delay_secs),
        };

        // Flush worker settings - merge file config with defaults
        let fw_file = file.flush_worker.unwrap_or_default();
        let poll_interval_ms = fw_file.poll_interval_ms.unwrap_or(cli.poll_interval_ms);
        if poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        let max_attempts = fw_file.max_attempts.unwrap_or(cli.max_attempts);
        if max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        let flush_worker = FlushWorkerSettings {
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_attempts,
            retry_backoff_base: Duration::from_millis(
                fw_file
                    .retry_backoff_base_ms
                    .unwrap_or(cli.retry_backoff_base_ms),
            ),
        };

        Ok(Self {
            db_dir,
            notifications,
            flush_worker,
        })
    }

    pub fn notifications_db_path(&self) -> PathBuf {
        self.db_dir.join("notifications.db")
    }

    pub fn flush_tasks_db_path(&self) -> PathBuf {
        self.db_dir.join("flush_tasks.db")
    }
}

/// Aggregation timing knobs shared by the engine and the reconciler.
#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// How long an aggregation window stays open.
    pub window: Duration,
    /// Extra lifetime granted to batch keys beyond the window, so a late
    /// flush still finds its data.
    pub batch_ttl_margin: Duration,
    /// How long after the second event of a window the flush runs.
    pub flush_delay: Duration,
}

impl NotificationSettings {
    /// TTL applied to the batch hash and the actor set.
    pub fn batch_ttl(&self) -> Duration {
        self.window + self.batch_ttl_margin
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            batch_ttl_margin: Duration::from_secs(120),
            flush_delay: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushWorkerSettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub retry_backoff_base: Duration,
}

impl Default for FlushWorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_attempts: 3,
            retry_backoff_base: Duration::from_millis(2000),
        }
    }
}
