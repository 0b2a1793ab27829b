//! Worker server.
//!
//! Registers in the worker set, recovers the local CAS cache, announces its
//! contents to the blob-location index, and runs the execution pipeline
//! until interrupted. Peer blob fetches go through the deployment's
//! transport adapter, which wires the worker stub factory; the local cache
//! is always served in-process.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use granary::config::WorkerProcessConfig;
use granary::queue_service::OperationQueueService;
use granary::stubs::{UnconnectedStubFactory, WorkerStubs};
use granary::worker::announce::BlobLocationAnnouncer;
use granary::worker::blob_source::RemoteBlobSource;
use granary::worker::{Pipeline, WorkerContext};
use granary_backend_memory::MemoryBackplane;
use granary_backend_postgres::PostgresBackplane;
use granary_backplane::{Backplane, ChannelMessage, OperationListener};
use granary_cas::{CasFileCache, CasFileCacheConfig, ExecFileSystem};

/// Workers do not watch operations; the subscription listener is inert.
struct NullListener;

impl OperationListener for NullListener {
    fn on_message(&self, _channel: &str, _message: ChannelMessage) {}
    fn on_reset(&self, _channel: &str, _operation: Option<granary_api::Operation>) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "granary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerProcessConfig::from_env();
    info!(
        worker = config.worker.name,
        cas_root = %config.cas_root.display(),
        exec_root = %config.exec_root.display(),
        backplane = config.database_url.as_deref().map(|_| "postgres").unwrap_or("memory"),
        "starting worker"
    );

    let backplane: Arc<dyn Backplane> = match config.database_url.as_deref() {
        Some(database_url) => Arc::new(PostgresBackplane::connect(database_url).await?),
        None => Arc::new(MemoryBackplane::default()),
    };
    backplane.start(Arc::new(NullListener)).await?;

    let stubs = WorkerStubs::new(Box::new(UnconnectedStubFactory));
    let remote_source = Arc::new(RemoteBlobSource::new(
        backplane.clone(),
        stubs,
        config.worker.name.clone(),
    ));
    let (cache_events_tx, cache_events_rx) = tokio::sync::mpsc::unbounded_channel();
    let cache = Arc::new(CasFileCache::new(
        CasFileCacheConfig {
            root: config.cas_root.clone(),
            max_size_bytes: config.cas_max_size_bytes,
        },
        remote_source.clone(),
        Some(cache_events_tx),
    ));
    let exec_fs = Arc::new(ExecFileSystem::new(
        config.exec_root.clone(),
        cache,
        config.link_input_directories,
    ));
    let recovered = exec_fs.start().await?;
    info!(blobs = recovered.len(), "cache recovered");
    backplane
        .add_blobs_location(&recovered, &config.worker.name)
        .await?;
    backplane.add_worker(&config.worker.name).await?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let announcer = tokio::spawn(
        BlobLocationAnnouncer {
            backplane: backplane.clone(),
            worker_name: config.worker.name.clone(),
        }
        .run(cache_events_rx, shutdown.clone().cancelled_owned()),
    );

    let queue_service = Arc::new(OperationQueueService::new(backplane.clone()));
    let context = WorkerContext::new(
        config.worker.clone(),
        queue_service,
        backplane.clone(),
        exec_fs,
        remote_source,
    );
    let pipeline = tokio::spawn(Pipeline::new(context).run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    shutdown.cancel();
    let _ = pipeline.await;
    let _ = announcer.await;
    backplane.remove_worker(&config.worker.name).await?;
    backplane.stop().await?;
    info!("worker stopped");
    Ok(())
}
