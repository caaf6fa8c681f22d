use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::sync::atomic::Ordering;
use syncer::config::Args;
use syncer::db::{self, PostgresSink};
use syncer::engine::{RunSummary, SyncEngine};
use syncer::errors::SourceError;
use syncer::metrics;
use syncer::model::Device;
use syncer::retry::with_retry;
use syncer::source::{HttpSource, ReadingSource};
use syncer::state::{JsonFileStateStore, StateStore};
use tracing::{error, info, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let metrics_file = args.metrics_file.clone();

    if let Err(e) = metrics::init_metrics() {
        warn!("Failed to register metrics: {}", e);
    }

    let run_id = uuid::Uuid::new_v4();
    let code = match run(args)
        .instrument(tracing::info_span!("run", run_id = %run_id))
        .await
    {
        Ok(summary) => {
            if summary.failure_count() > 0 {
                error!(
                    failed = summary.failure_count(),
                    "Sync finished with device failures"
                );
            }
            if summary.cancelled() {
                warn!("Sync interrupted; progress up to the last committed batch is saved");
            }
            0
        }
        Err(e) => {
            error!("Sync aborted: {:#}", e);
            1
        }
    };

    metrics::LAST_RUN_TIMESTAMP_SECONDS.set(Utc::now().timestamp() as f64);
    if let Some(path) = metrics_file {
        if let Err(e) = metrics::write_metrics_file(&path) {
            warn!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }

    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<RunSummary> {
    let settings = args.into_settings(Utc::now())?;

    info!("Starting sensor sync");
    info!("State file: {}", settings.state_path.display());
    info!("Source: {}", settings.source.base_url);
    info!(
        "Database: {}",
        settings.database_url.split('@').last().unwrap_or("***")
    );

    // Corrupt state must stop us before anything is fetched.
    let store = JsonFileStateStore::new(&settings.state_path);
    let state = store.load().await.context("Failed to load sync state")?;

    let source = HttpSource::new(settings.source.clone())?;
    with_retry(&settings.retry, "authenticate", SourceError::is_retryable, || {
        source.authenticate()
    })
    .await
    .context("Failed to authenticate with the source")?;

    let pool = db::make_pool(&settings.database_url)
        .await
        .context("Failed to connect to the database")?;
    let sink = PostgresSink::new(pool, settings.retry);

    let devices: Vec<Device> = if settings.devices.is_empty() {
        with_retry(&settings.retry, "list_devices", SourceError::is_retryable, || {
            source.list_devices()
        })
        .await
        .context("Failed to list devices")?
    } else {
        settings.devices.iter().map(Device::new).collect()
    };

    let engine = SyncEngine::new(&source, &sink, &store, settings.engine.clone());

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, stopping after the current batch");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    let outcome = engine.run(&devices, state).await?;
    Ok(outcome.summary)
}
