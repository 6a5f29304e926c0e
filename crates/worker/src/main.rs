use std::sync::Arc;

use anyhow::Context;

use stockroom_infra::jobs::{JobStore, PropagationWorker, WorkerConfig};
use stockroom_infra::{EngineConfig, PostgresStore, Store, StoreKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockroom_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let worker_config = WorkerConfig::from(config.propagation.clone());

    let url = database_url(&config)?;
    let store = PostgresStore::connect(url, config.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    store.migrate().await.context("failed to apply migrations")?;
    run(Arc::new(store), worker_config).await;

    Ok(())
}

/// The worker only runs against postgres.
fn database_url(config: &EngineConfig) -> anyhow::Result<&str> {
    match config.store {
        StoreKind::Memory => anyhow::bail!(
            "stockroom-worker needs STOCKROOM_STORE=postgres; \
             the memory store is private to the process that created it"
        ),
        StoreKind::Postgres => config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required for the postgres store"),
    }
}

async fn run<S: Store + JobStore>(store: Arc<S>, config: WorkerConfig) {
    let worker = PropagationWorker::new(store, config);
    worker
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await;

    let stats = worker.stats();
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        retried = stats.jobs_retried,
        dead_lettered = stats.jobs_dead_lettered,
        "worker exited"
    );
}
