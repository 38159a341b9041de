use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clinic_analysis_worker::analysis_queue::{
    AnalysisProcessor, HttpAnalysisProvider, HttpSubjectResolver, QueueWatchdog, RecordCache,
    RetryPolicy, RetryingProvider, SqliteAnalysisStore,
};
use clinic_analysis_worker::cache::CacheConfig;
use clinic_analysis_worker::config::{AppConfig, CliConfig, FileConfig};
use clinic_analysis_worker::server::{run_server, ServerState};
use clinic_analysis_worker::metrics;

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
    /// Directory holding analysis_queue.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Optional TOML config file. Values in it override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port of the admin HTTP server (health, stats, metrics).
    #[clap(long, default_value_t = 3100)]
    pub admin_port: u16,

    /// Base URL of the analysis provider.
    #[clap(long)]
    pub provider_url: Option<String>,

    /// Model name reported in analysis results.
    #[clap(long)]
    pub provider_model: Option<String>,

    /// Base URL of the clinic data API used to resolve reports.
    #[clap(long)]
    pub data_api_url: Option<String>,

    /// Seconds between two polls of the queue.
    #[clap(long, default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Maximum number of jobs fetched per poll.
    #[clap(long, default_value_t = 10)]
    pub batch_size: usize,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            admin_port: args.admin_port,
            provider_url: args.provider_url.clone(),
            provider_model: args.provider_model.clone(),
            data_api_url: args.data_api_url.clone(),
            poll_interval_secs: args.poll_interval_secs,
            batch_size: args.batch_size,
        }
    }
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
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(&cli_args), file_config)?;

    let provider_url = config
        .provider
        .url
        .clone()
        .context("provider url must be specified via --provider-url or [provider] url")?;
    let data_api_url = config
        .data_api
        .url
        .clone()
        .context("data API url must be specified via --data-api-url or [data_api] url")?;

    info!("Initializing metrics...");
    metrics::init_metrics();

    let db_path = config.analysis_db_path();
    info!("Opening analysis queue database at {:?}...", db_path);
    let store = Arc::new(SqliteAnalysisStore::new(&db_path)?);

    let record_cache = Arc::new(RecordCache::new(
        "records",
        CacheConfig::from(&config.cache),
    ));
    let resolver = Arc::new(HttpSubjectResolver::new(
        data_api_url,
        config.data_api.api_key.clone(),
        Duration::from_secs(config.data_api.timeout_secs),
        record_cache.clone(),
    ));

    info!(
        "Analysis provider configured at {} (model {})",
        provider_url, config.provider.model
    );
    let provider = Arc::new(RetryingProvider::new(
        HttpAnalysisProvider::new(
            provider_url,
            config.provider.model.clone(),
            config.provider.api_key.clone(),
            Duration::from_secs(config.provider.timeout_secs),
        ),
        RetryPolicy::new(&config.analysis),
    ));

    let shutdown = CancellationToken::new();

    let processor = Arc::new(AnalysisProcessor::new(
        store.clone(),
        store.clone(),
        resolver,
        provider,
        &config.analysis,
        shutdown.child_token(),
    ));
    let processor_handle = processor.spawn();

    let watchdog = QueueWatchdog::new(
        store.clone(),
        &config.watchdog,
        config.analysis.max_attempts,
    );
    let watchdog_handle = {
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { watchdog.run(shutdown).await })
    };

    let server_handle = tokio::spawn(run_server(
        ServerState::new(processor.clone(), store.clone(), record_cache),
        config.admin_port,
        shutdown.child_token(),
    ));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Admin server exited"),
                Ok(Err(e)) => error!("Admin server failed: {:#}", e),
                Err(e) => error!("Admin server task panicked: {}", e),
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = processor_handle.await {
        error!("Analysis processor task failed: {}", e);
    }
    if let Err(e) = watchdog_handle.await {
        error!("Queue watchdog task failed: {}", e);
    }

    info!("Analysis worker stopped");
    Ok(())
}
