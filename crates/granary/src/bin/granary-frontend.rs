//! Frontend shard server.
//!
//! Runs the instance scheduler: accepts prequeued work, promotes it through
//! the operation queuer, watches for lost claims with the dispatched
//! monitor, and serves blob reads with worker failover. The RPC surface is
//! provided by the deployment's transport adapter, which also installs the
//! worker stub factory; without one this process manages queue state only.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use granary::config::FrontendProcessConfig;
use granary::instance::monitor::DispatchedMonitor;
use granary::instance::queuer::OperationQueuer;
use granary::stubs::{UnconnectedStubFactory, WorkerStubs};
use granary::Instance;
use granary_backend_memory::MemoryBackplane;
use granary_backend_postgres::PostgresBackplane;
use granary_backplane::Backplane;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "granary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = FrontendProcessConfig::from_env();
    info!(
        instance = config.instance.name,
        backplane = config.database_url.as_deref().map(|_| "postgres").unwrap_or("memory"),
        "starting frontend"
    );

    let backplane: Arc<dyn Backplane> = match config.database_url.as_deref() {
        Some(database_url) => Arc::new(PostgresBackplane::connect(database_url).await?),
        None => Arc::new(MemoryBackplane::default()),
    };
    let stubs = WorkerStubs::new(Box::new(UnconnectedStubFactory));
    let instance = Instance::new(config.instance.clone(), backplane.clone(), stubs);
    instance.start().await?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        backplane.set_on_unsubscribe(Arc::new(move || shutdown.cancel()));
    }

    let queuer = tokio::spawn(
        OperationQueuer {
            instance: instance.clone(),
        }
        .run(shutdown.clone().cancelled_owned()),
    );
    let monitor = tokio::spawn(
        DispatchedMonitor {
            instance: instance.clone(),
            config: config.monitor.clone(),
        }
        .run(shutdown.clone().cancelled_owned()),
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = shutdown.cancelled() => info!("backplane subscription lost"),
    }
    shutdown.cancel();
    let _ = queuer.await;
    let _ = monitor.await;
    instance.stop().await?;
    info!("frontend stopped");
    Ok(())
}
