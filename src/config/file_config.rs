use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub admin_port: Option<u16>,

    // Feature configs
    pub analysis: Option<AnalysisConfig>,
    pub watchdog: Option<WatchdogConfig>,
    pub cache: Option<CacheConfigFile>,
    pub provider: Option<ProviderConfig>,
    pub data_api: Option<DataApiConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AnalysisConfig {
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    /// Claims after which a job stuck in processing is failed for good.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub retention_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CacheConfigFile {
    pub default_ttl_secs: Option<u64>,
    pub max_entries: Option<usize>,
    pub max_memory_mb: Option<usize>,
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DataApiConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
