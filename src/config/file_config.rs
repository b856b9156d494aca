use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub window_secs: Option<u64>,
    pub batch_ttl_margin_secs: Option<u64>,
    pub flush_delay_secs: Option<u64>,

    // Feature configs
    pub flush_worker: Option<FlushWorkerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FlushWorkerConfig {
    pub poll_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_base_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
