use anyhow::{Context, Result};
use clap::Parser;
use facegallery_media::{ImageWriterPool, WriterConfig};
use facegallery_store::GalleryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod callback;
mod config;
mod dbus_interface;
mod engine;
mod feed;
mod training;
mod wire;

use callback::{CallbackSettings, FrameCallback};
use config::{Args, Config, RunMode};
use training::{CommandAnalyzer, TrainingDriver};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args).context("invalid configuration")?;
    tracing::info!(mode = config.mode.as_str(), data_dir = %config.data_dir.display(), "facegalleryd starting");

    let store = Arc::new(
        GalleryStore::open(config.database_dir(), config.samples_dir()).context("failed to open gallery store")?,
    );

    match config.mode {
        RunMode::Update => {
            let updated = store.recalibrate()?;
            tracing::info!(updated, "thresholds recalibrated");
            return Ok(());
        }
        RunMode::Delete => {
            let removed = store.clear()?;
            tracing::info!(removed, "gallery cleared");
            return Ok(());
        }
        RunMode::Run | RunMode::RunSave | RunMode::Train => {}
    }

    let writer = Arc::new(
        ImageWriterPool::start(WriterConfig {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
            ..WriterConfig::default()
        })
        .context("failed to start image writer pool")?,
    );

    let result = match config.mode.admission() {
        Some(mode) => run_stream(&config, Arc::clone(&store), Arc::clone(&writer), mode).await,
        None => run_training(&config, Arc::clone(&store), Arc::clone(&writer)).await,
    };

    let timeout = config.shutdown_timeout();
    let detached = tokio::task::spawn_blocking(move || writer.shutdown(timeout)).await?;
    if detached > 0 {
        tracing::error!(detached, "image writers still busy at exit");
    }
    tracing::info!("facegalleryd stopped");
    result
}

async fn run_stream(
    config: &Config,
    store: Arc<GalleryStore>,
    writer: Arc<ImageWriterPool>,
    mode: facegallery_core::AdmissionMode,
) -> Result<()> {
    let settings = CallbackSettings {
        admission: config.admission.clone(),
        warmup_frames: config.warmup_frames,
        track_idle_frames: config.track_idle_frames,
        ..CallbackSettings::new(mode)
    };
    let callback = FrameCallback::new(Arc::clone(&store), writer, settings);
    let (engine, engine_thread) = engine::spawn_engine(callback);

    let _bus = if config.dbus_enabled {
        let service = dbus_interface::GalleryService::new(Arc::clone(&store), config.mode.as_str());
        match dbus_interface::serve(service).await {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus review service registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; review service disabled");
                None
            }
        }
    } else {
        None
    };

    let server = feed::FeedServer::bind(&config.socket_path)
        .with_context(|| format!("failed to bind feed socket {}", config.socket_path.display()))?;
    tracing::info!(persons = store.count()?, "facegalleryd ready");

    tokio::select! {
        _ = server.serve(engine) => {}
        r = shutdown_signal() => r?,
    }
    tracing::info!("facegalleryd shutting down");

    // The feed future held the last engine handle; the thread exits once
    // its queue is empty.
    tokio::task::spawn_blocking(move || {
        if engine_thread.join().is_err() {
            tracing::error!("engine thread panicked");
        }
    })
    .await?;
    Ok(())
}

async fn run_training(config: &Config, store: Arc<GalleryStore>, writer: Arc<ImageWriterPool>) -> Result<()> {
    let template = config
        .analyzer_command
        .as_deref()
        .context("train mode needs analyzer_command (FACEGALLERY_ANALYZER_COMMAND)")?;
    let analyzer = CommandAnalyzer::from_template(template, config.analyzer_repeat)?;
    let mut driver = TrainingDriver::new(store, writer, analyzer, config.train_dir())
        .bundled_dir(config.bundled_train_dir.clone())
        .frame_timeout(config.train_frame_timeout());

    tokio::select! {
        report = driver.run() => {
            let report = report?;
            tracing::info!(
                ?report,
                files = driver.processed_files().len(),
                names = driver.processed_names().len(),
                "training finished"
            );
        }
        r = shutdown_signal() => {
            r?;
            tracing::info!("training interrupted");
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}
