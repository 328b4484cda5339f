//! Process entry point: wires the configuration cache refresher and the
//! ingest router together from one YAML config.

mod config;

use crate::config::{Config, ConfigError, MetricsConfig};
use clap::{Parser, Subcommand};
use fast_store::builder::{FastStoreRefresh, RefreshError};
use fast_store::kv::{KvError, RedisKv};
use fast_store::reader::FastStore;
use fast_store::store::{PgConfigStore, StoreError};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "eventline", about = "Customer data pipeline edge services")]
struct Cli {
    #[arg(long, short, global = true, default_value = "eventline.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic cache refresher and, if configured, the ingest router
    Serve,
    /// Run a single cache refresh cycle and exit
    Refresh,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cache error: {0}")]
    Kv(#[from] KvError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    #[error("router failed: {0}")]
    Router(#[from] ingest_router::errors::IngestError),

    #[error("metrics exporter setup failed: {0}")]
    Metrics(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The guard must outlive the runtime so buffered events flush on exit.
    let _sentry_guard = config.logging.as_ref().map(|logging| {
        sentry::init((
            logging.sentry_dsn.clone(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    if let Some(metrics) = &config.metrics {
        install_statsd(metrics)?;
    }
    shared::metrics_defs::describe_all(fast_store::metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(ingest_router::metrics_defs::ALL_METRICS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Serve => runtime.block_on(serve(config)),
        Command::Refresh => runtime.block_on(refresh_once(config)),
    }
}

fn install_statsd(metrics: &MetricsConfig) -> Result<(), Error> {
    let recorder = StatsdBuilder::from(&metrics.statsd_host, metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| Error::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| Error::Metrics(e.to_string()))?;
    Ok(())
}

async fn serve(config: Config) -> Result<(), Error> {
    let kv = Arc::new(RedisKv::connect(&config.redis.url).await?);
    let store = Arc::new(PgConfigStore::connect(&config.database.url).await?);

    let refresher = FastStoreRefresh::new(store, kv.clone())
        .with_batch_size(config.refresh.batch_size);
    let interval = Duration::from_secs(config.refresh.interval_secs);

    let refresh_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // Failures are logged and counted inside refresh(); the previous
            // snapshot keeps serving until the next tick.
            refresher.refresh().await.ok();
        }
    });

    match config.router {
        Some(router) => {
            tracing::info!(port = router.listener.port, "starting ingest router");
            ingest_router::run(router, FastStore::new(kv)).await?;
        }
        None => {
            tracing::info!("no router configured, running refresher only");
            refresh_task.await?;
        }
    }

    Ok(())
}

async fn refresh_once(config: Config) -> Result<(), Error> {
    let kv = Arc::new(RedisKv::connect(&config.redis.url).await?);
    let store = Arc::new(PgConfigStore::connect(&config.database.url).await?);

    let stats = FastStoreRefresh::new(store, kv)
        .with_batch_size(config.refresh.batch_size)
        .refresh()
        .await?;
    tracing::info!(
        streams = stats.streams,
        links = stats.links,
        api_keys = stats.api_keys,
        "refresh cycle finished"
    );
    Ok(())
}
