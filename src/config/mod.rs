mod file_config;

pub use file_config::{
    AnalysisConfig, CacheConfigFile, DataApiConfig, FileConfig, ProviderConfig, WatchdogConfig,
};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub admin_port: u16,
    pub provider_url: Option<String>,
    pub provider_model: Option<String>,
    pub data_api_url: Option<String>,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub admin_port: u16,

    pub analysis: AnalysisSettings,
    pub watchdog: WatchdogSettings,
    pub cache: CacheSettings,
    pub provider: ProviderSettings,
    pub data_api: DataApiSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let admin_port = file.admin_port.unwrap_or(cli.admin_port);

        let defaults = AnalysisSettings::default();
        let analysis_file = file.analysis.unwrap_or_default();
        let analysis = AnalysisSettings {
            poll_interval_secs: analysis_file
                .poll_interval_secs
                .unwrap_or(cli.poll_interval_secs),
            batch_size: analysis_file.batch_size.unwrap_or(cli.batch_size),
            max_concurrency: analysis_file
                .max_concurrency
                .unwrap_or(defaults.max_concurrency),
            max_retries: analysis_file.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_secs: analysis_file
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: analysis_file
                .max_backoff_secs
                .unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: analysis_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_attempts: analysis_file.max_attempts.unwrap_or(defaults.max_attempts),
        };
        if analysis.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if analysis.max_concurrency == 0 {
            bail!("analysis.max_concurrency must be at least 1");
        }
        if analysis.backoff_multiplier < 1.0 {
            bail!(
                "analysis.backoff_multiplier must be >= 1.0, got {}",
                analysis.backoff_multiplier
            );
        }

        let defaults = WatchdogSettings::default();
        let watchdog_file = file.watchdog.unwrap_or_default();
        let watchdog = WatchdogSettings {
            interval_secs: watchdog_file.interval_secs.unwrap_or(defaults.interval_secs),
            stale_after_secs: watchdog_file
                .stale_after_secs
                .unwrap_or(defaults.stale_after_secs),
            retention_hours: watchdog_file
                .retention_hours
                .unwrap_or(defaults.retention_hours),
        };

        let defaults = CacheSettings::default();
        let cache_file = file.cache.unwrap_or_default();
        let cache = CacheSettings {
            default_ttl_secs: cache_file
                .default_ttl_secs
                .unwrap_or(defaults.default_ttl_secs),
            max_entries: cache_file.max_entries.unwrap_or(defaults.max_entries),
            max_memory_mb: cache_file.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            cleanup_interval_secs: cache_file
                .cleanup_interval_secs
                .unwrap_or(defaults.cleanup_interval_secs),
        };
        if cache.max_entries == 0 {
            bail!("cache.max_entries must be at least 1");
        }

        let provider_file = file.provider.unwrap_or_default();
        let provider = ProviderSettings {
            url: provider_file.url.or_else(|| cli.provider_url.clone()),
            model: provider_file
                .model
                .or_else(|| cli.provider_model.clone())
                .unwrap_or_else(|| DEFAULT_PROVIDER_MODEL.to_string()),
            api_key: provider_file.api_key,
            timeout_secs: provider_file
                .timeout_secs
                .unwrap_or(ProviderSettings::default().timeout_secs),
        };

        let data_api_file = file.data_api.unwrap_or_default();
        let data_api = DataApiSettings {
            url: data_api_file.url.or_else(|| cli.data_api_url.clone()),
            api_key: data_api_file.api_key,
            timeout_secs: data_api_file
                .timeout_secs
                .unwrap_or(DataApiSettings::default().timeout_secs),
        };

        Ok(Self {
            db_dir,
            admin_port,
            analysis,
            watchdog,
            cache,
            provider,
            data_api,
        })
    }

    pub fn analysis_db_path(&self) -> PathBuf {
        self.db_dir.join("analysis_queue.db")
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Total provider attempts per job, the first one included.
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub max_attempts: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            batch_size: 10,
            max_concurrency: 4,
            max_retries: 3,
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
            backoff_multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogSettings {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
    pub retention_hours: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            stale_after_secs: 7200, // 2 hours
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
    pub max_memory_mb: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_entries: 5000,
            max_memory_mb: 200,
            cleanup_interval_secs: 60,
        }
    }
}

pub const DEFAULT_PROVIDER_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            url: None,
            model: DEFAULT_PROVIDER_MODEL.to_string(),
            api_key: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataApiSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DataApiSettings {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: 30,
        }
    }
}
